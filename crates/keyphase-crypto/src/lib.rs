//! Keyphase Cryptographic Primitives
//!
//! Building blocks for 1-RTT packet protection and key updates. Pure
//! functions with deterministic outputs; every piece of state lives in the
//! caller (see `keyphase-core`).
//!
//! # Key Lifecycle
//!
//! The handshake hands over one traffic secret per direction. Every key
//! update ratchets that secret forward with a one-way HKDF step, and each
//! secret expands into the packet key and IV of one generation.
//!
//! ```text
//! Handshake traffic secret (generation 0)
//!        │
//!        ├──"quic hp"──> Header protection key (fixed for the connection)
//!        │
//!        ├──"quic key"/"quic iv"──> KeySet[0]
//!        │
//!        ▼ "quic ku"
//! Traffic secret (generation 1) ──> KeySet[1]
//!        │
//!        ▼ "quic ku"
//!       ...
//! ```
//!
//! # Security
//!
//! Forward Secrecy:
//! - The ratchet is HKDF-Expand, so a later secret never reveals an earlier
//!   one
//! - Superseded secrets and key sets are zeroized on drop
//!
//! Authenticity:
//! - ChaCha20-Poly1305 AEAD with the unprotected header as associated data
//! - Nonce binds each packet to (IV, packet number)
//! - Failed authentication tag -> packet is dropped by the caller
//!
//! Agreement:
//! - Derivation is deterministic, so both endpoints arrive at identical
//!   KeySets for the same generation without any negotiation

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod aead;
pub mod derivation;
pub mod error;
pub mod key_set;
pub mod secret;

pub use aead::{SAMPLE_LEN, TAG_LEN, header_protection_mask, open_payload, seal_payload};
pub use derivation::{
    derive_initial_key_set, derive_next, derive_traffic_secrets, hkdf_expand_label,
    next_generation_secret,
};
pub use error::CryptoError;
pub use key_set::{Direction, HeaderKey, IV_LEN, KEY_LEN, KeyPhase, KeySet};
pub use secret::{OneRttSecrets, Role, SECRET_LEN, TrafficSecret};
