//! Error types for packet protection primitives

use thiserror::Error;

/// Errors from packet protection operations
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    /// Authenticated decryption failed (wrong generation, corruption or
    /// forgery; these are indistinguishable by design)
    #[error("decryption failed under generation {generation}")]
    DecryptionFailed {
        /// Generation of the key set that was tried
        generation: u64,
    },

    /// Ciphertext is shorter than the authentication tag
    #[error("payload too short: need at least {minimum} bytes, got {actual}")]
    PayloadTooShort {
        /// Minimum acceptable length
        minimum: usize,
        /// Actual length
        actual: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = CryptoError::DecryptionFailed { generation: 3 };
        assert_eq!(err.to_string(), "decryption failed under generation 3");

        let err = CryptoError::PayloadTooShort { minimum: 16, actual: 4 };
        assert_eq!(err.to_string(), "payload too short: need at least 16 bytes, got 4");
    }
}
