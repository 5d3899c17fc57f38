//! Traffic secrets handed over by the handshake layer.

use std::fmt;

use zeroize::Zeroize;

/// Length of a traffic secret (SHA-256 output).
pub const SECRET_LEN: usize = 32;

/// Which side of the connection an endpoint plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// The endpoint that opened the connection
    Client,
    /// The endpoint that accepted the connection
    Server,
}

impl Role {
    /// The role of the other endpoint.
    pub fn peer(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// A 1-RTT traffic secret for one direction and one generation.
///
/// Zeroized on drop. `Debug` never prints the secret.
#[derive(Clone, PartialEq, Eq)]
pub struct TrafficSecret {
    bytes: [u8; SECRET_LEN],
}

impl TrafficSecret {
    /// Wrap raw secret bytes.
    pub fn new(bytes: [u8; SECRET_LEN]) -> Self {
        Self { bytes }
    }

    /// Raw secret bytes.
    pub fn as_bytes(&self) -> &[u8; SECRET_LEN] {
        &self.bytes
    }
}

impl fmt::Debug for TrafficSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TrafficSecret(..)")
    }
}

impl Drop for TrafficSecret {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

/// Generation-0 secrets for both directions, as produced by the handshake.
///
/// `local` protects packets this endpoint sends; `remote` opens packets the
/// peer sends.
#[derive(Debug, Clone)]
pub struct OneRttSecrets {
    /// Secret for the local (send) direction
    pub local: TrafficSecret,
    /// Secret for the remote (receive) direction
    pub remote: TrafficSecret,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_hides_secret() {
        let secret = TrafficSecret::new([0xAB; SECRET_LEN]);
        let rendered = format!("{secret:?}");
        assert!(!rendered.contains("ab"));
        assert!(!rendered.contains("171"));
    }

    #[test]
    fn peer_role_is_symmetric() {
        assert_eq!(Role::Client.peer(), Role::Server);
        assert_eq!(Role::Server.peer().peer(), Role::Server);
    }
}
