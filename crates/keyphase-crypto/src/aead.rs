//! Payload protection using `ChaCha20-Poly1305`
//!
//! All functions are pure. Key selection (which generation to try) is the
//! caller's job; these functions only seal and open with the key set given.

use chacha20poly1305::{
    ChaCha20Poly1305, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::{error::CryptoError, key_set::HeaderKey, key_set::KeySet};

type HmacSha256 = Hmac<Sha256>;

/// Poly1305 tag size (16 bytes)
pub const TAG_LEN: usize = 16;

/// Bytes of ciphertext sampled for the header protection mask
pub const SAMPLE_LEN: usize = 16;

/// Seal a packet payload.
///
/// `header` is the unprotected header and is authenticated as associated
/// data. The output is `plaintext.len() + TAG_LEN` bytes.
pub fn seal_payload(
    keys: &KeySet,
    packet_number: u64,
    header: &[u8],
    plaintext: &[u8],
) -> Vec<u8> {
    let cipher = ChaCha20Poly1305::new(keys.packet_key().into());
    let nonce = keys.nonce(packet_number);

    let Ok(ciphertext) =
        cipher.encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: header })
    else {
        unreachable!("ChaCha20-Poly1305 encryption cannot fail with valid inputs");
    };

    ciphertext
}

/// Open a packet payload.
///
/// # Errors
///
/// - `PayloadTooShort`: ciphertext cannot hold a tag
/// - `DecryptionFailed`: tag mismatch (wrong key, tampering or corruption)
pub fn open_payload(
    keys: &KeySet,
    packet_number: u64,
    header: &[u8],
    ciphertext: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < TAG_LEN {
        return Err(CryptoError::PayloadTooShort { minimum: TAG_LEN, actual: ciphertext.len() });
    }

    let cipher = ChaCha20Poly1305::new(keys.packet_key().into());
    let nonce = keys.nonce(packet_number);

    cipher
        .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: header })
        .map_err(|_| CryptoError::DecryptionFailed { generation: keys.generation() })
}

/// Compute the 5-byte header protection mask for a ciphertext sample.
///
/// Byte 0 masks the low bits of the first header byte (including the key
/// phase bit); bytes 1..5 mask the packet number.
pub fn header_protection_mask(key: &HeaderKey, sample: &[u8; SAMPLE_LEN]) -> [u8; 5] {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key.as_bytes()) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(sample);
    let result = mac.finalize().into_bytes();

    let mut mask = [0u8; 5];
    mask.copy_from_slice(&result[..5]);
    mask
}
