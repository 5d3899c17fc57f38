//! Error types for the key-update subsystem.
//!
//! Two severities matter to callers: errors that terminate the connection
//! ([`KeyUpdateError::is_fatal`]) and errors that only drop one packet or
//! defer one request. Wire-format and connection ID problems have their own
//! enums so they never masquerade as key-phase violations.

use keyphase_crypto::KeyPhase;
use thiserror::Error;

use crate::config::ConfigError;

/// Errors raised by the key-phase engine and packet protector.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyUpdateError {
    /// A key-update operation was attempted before the handshake confirmed
    #[error("handshake not confirmed")]
    HandshakeNotConfirmed,

    /// `initialize` was called twice
    #[error("1-RTT secrets already installed")]
    AlreadyInitialized,

    /// A local update is still waiting for the peer to acknowledge it
    #[error("key update to generation {generation} not yet confirmed")]
    UpdateInProgress {
        /// The unconfirmed local generation
        generation: u64,
    },

    /// The peer flipped its key phase again before its previous update was
    /// confirmed
    #[error("peer attempted key update to generation {generation} before confirming the previous one")]
    UpdateTooFrequent {
        /// Remote generation the peer tried to move to
        generation: u64,
    },

    /// No current, retained or candidate key set matches the packet
    #[error("no key set for phase {phase:?} at packet {packet_number}")]
    NoValidKeySet {
        /// Phase bit carried by the packet
        phase: KeyPhase,
        /// Reconstructed packet number
        packet_number: u64,
    },

    /// Every candidate key set failed to authenticate the packet
    #[error("decryption failed for packet {packet_number}")]
    DecryptionFailed {
        /// Reconstructed packet number
        packet_number: u64,
    },

    /// The connection was closed and its keys discarded
    #[error("connection closed")]
    ConnectionClosed,
}

impl KeyUpdateError {
    /// Returns true if this error must terminate the connection.
    ///
    /// Protocol violations (early or too-frequent updates, double
    /// initialization) and use after close are fatal. Decryption failures and
    /// unmatched phases only drop the packet; an in-progress update only
    /// defers the request.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::HandshakeNotConfirmed
                | Self::AlreadyInitialized
                | Self::UpdateTooFrequent { .. }
                | Self::ConnectionClosed
        )
    }
}

/// Errors decoding or protecting a short-header packet.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PacketError {
    /// Datagram too small to hold a header, packet number and sample
    #[error("packet too short: need {minimum} bytes, got {actual}")]
    TooShort {
        /// Minimum length for this connection ID length
        minimum: usize,
        /// Actual datagram length
        actual: usize,
    },

    /// Long-header packets belong to the handshake layer
    #[error("long header packet")]
    LongHeader,

    /// The fixed bit (0x40) was clear
    #[error("fixed bit not set in first byte {first_byte:#04x}")]
    FixedBitClear {
        /// First byte after header protection removal
        first_byte: u8,
    },
}

/// Errors managing connection IDs.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// Retiring this ID would leave the connection without a usable ID
    #[error("cannot retire connection id {sequence}: it is the only active id")]
    CannotRetireInUseId {
        /// Sequence number of the ID
        sequence: u64,
    },

    /// No ID with this sequence number was ever issued
    #[error("unknown connection id sequence {sequence}")]
    UnknownSequence {
        /// Requested sequence number
        sequence: u64,
    },

    /// The peer's active connection ID limit is already met
    #[error("active connection id limit {limit} reached")]
    ActiveLimitReached {
        /// The configured limit
        limit: usize,
    },

    /// Connection ID length outside 1..=20
    #[error("invalid connection id length {length}")]
    InvalidLength {
        /// Offending length
        length: usize,
    },

    /// The peer reused a sequence number for a different ID
    #[error("peer reused connection id sequence {sequence}")]
    DuplicateSequence {
        /// Reused sequence number
        sequence: u64,
    },
}

impl RegistryError {
    /// Returns true if the error came from a peer violating the protocol,
    /// rather than from a local caller.
    pub fn is_peer_violation(&self) -> bool {
        matches!(self, Self::DuplicateSequence { .. })
    }
}

/// Errors setting up an endpoint.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EndpointError {
    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    /// Connection ID registry failure
    #[error("connection id registry: {0}")]
    Registry(#[from] RegistryError),
}
