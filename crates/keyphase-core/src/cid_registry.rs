//! Connection ID bookkeeping.
//!
//! [`ConnectionIdRegistry`] issues and retires the IDs this endpoint hands
//! out (the peer puts them in the destination field of packets it sends us).
//! [`PeerConnectionIds`] stores the IDs the peer issued, which we use as
//! destination, together with their stateless reset tokens.
//!
//! Rotation here is independent of key updates.

use std::{
    collections::{BTreeMap, BTreeSet, HashSet},
    fmt,
};

use bytes::Bytes;
use tracing::debug;

use crate::{
    config::{KeyUpdateConfig, MAX_CONNECTION_ID_LENGTH},
    env::Environment,
    error::RegistryError,
};

/// Stateless reset token length.
pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

/// Opaque connection identifier (at most 20 bytes).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Wrap bytes as a connection ID.
    ///
    /// # Errors
    ///
    /// - `InvalidLength` if longer than 20 bytes
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, RegistryError> {
        let bytes = bytes.into();
        if bytes.len() > MAX_CONNECTION_ID_LENGTH {
            return Err(RegistryError::InvalidLength { length: bytes.len() });
        }
        Ok(Self { bytes })
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Length in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// True for the zero-length ID.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionId(")?;
        for byte in self.bytes.iter() {
            write!(f, "{byte:02x}")?;
        }
        f.write_str(")")
    }
}

/// Token that lets the peer recognize a stateless reset for one connection
/// ID.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatelessResetToken([u8; STATELESS_RESET_TOKEN_LEN]);

impl StatelessResetToken {
    /// Wrap raw token bytes.
    pub fn new(bytes: [u8; STATELESS_RESET_TOKEN_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8; STATELESS_RESET_TOKEN_LEN] {
        &self.0
    }

    /// Compare without an early exit on the first differing byte.
    pub fn matches(&self, candidate: &[u8; STATELESS_RESET_TOKEN_LEN]) -> bool {
        let diff = self.0.iter().zip(candidate).fold(0u8, |acc, (a, b)| acc | (a ^ b));
        diff == 0
    }
}

impl fmt::Debug for StatelessResetToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("StatelessResetToken(..)")
    }
}

/// Contents of a "new connection ID" signal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConnectionId {
    /// Strictly increasing per issuer
    pub sequence_number: u64,
    /// The ID itself
    pub connection_id: ConnectionId,
    /// Reset token bound to this ID
    pub reset_token: StatelessResetToken,
}

#[derive(Debug, Clone)]
struct Issued {
    connection_id: ConnectionId,
    reset_token: StatelessResetToken,
}

/// Locally issued connection IDs.
#[derive(Debug)]
pub struct ConnectionIdRegistry {
    length: usize,
    active_limit: usize,
    active: BTreeMap<u64, Issued>,
    next_sequence: u64,
    /// Every ID and token ever issued, so neither repeats
    seen_ids: HashSet<ConnectionId>,
    seen_tokens: HashSet<StatelessResetToken>,
}

impl ConnectionIdRegistry {
    /// Create an empty registry issuing `length`-byte IDs.
    ///
    /// # Errors
    ///
    /// - `InvalidLength` if `length` is outside 1..=20
    pub fn new(length: usize, active_limit: usize) -> Result<Self, RegistryError> {
        if !(1..=MAX_CONNECTION_ID_LENGTH).contains(&length) {
            return Err(RegistryError::InvalidLength { length });
        }
        Ok(Self {
            length,
            active_limit,
            active: BTreeMap::new(),
            next_sequence: 0,
            seen_ids: HashSet::new(),
            seen_tokens: HashSet::new(),
        })
    }

    /// Registry sized from configuration.
    pub fn from_config(config: &KeyUpdateConfig) -> Result<Self, RegistryError> {
        Self::new(config.connection_id_length, config.active_connection_id_limit)
    }

    /// Length of issued IDs.
    pub fn connection_id_length(&self) -> usize {
        self.length
    }

    /// Issue a fresh ID with the next sequence number and a fresh token.
    ///
    /// # Errors
    ///
    /// - `ActiveLimitReached` if `active_limit` IDs are already active
    pub fn issue_next<E: Environment>(&mut self, env: &E) -> Result<NewConnectionId, RegistryError> {
        if self.active.len() >= self.active_limit {
            return Err(RegistryError::ActiveLimitReached { limit: self.active_limit });
        }

        let connection_id = loop {
            let mut bytes = vec![0u8; self.length];
            env.random_bytes(&mut bytes);
            let candidate = ConnectionId { bytes: Bytes::from(bytes) };
            if !self.seen_ids.contains(&candidate) {
                break candidate;
            }
        };
        let reset_token = loop {
            let mut bytes = [0u8; STATELESS_RESET_TOKEN_LEN];
            env.random_bytes(&mut bytes);
            let candidate = StatelessResetToken(bytes);
            if !self.seen_tokens.contains(&candidate) {
                break candidate;
            }
        };

        let sequence_number = self.next_sequence;
        self.next_sequence += 1;
        self.seen_ids.insert(connection_id.clone());
        self.seen_tokens.insert(reset_token);
        self.active.insert(
            sequence_number,
            Issued { connection_id: connection_id.clone(), reset_token },
        );

        debug!(sequence_number, ?connection_id, "issued connection id");
        Ok(NewConnectionId { sequence_number, connection_id, reset_token })
    }

    /// Process a retirement signal for `sequence_number`.
    ///
    /// # Errors
    ///
    /// - `UnknownSequence` if never issued or already retired
    /// - `CannotRetireInUseId` if it is the only active ID
    pub fn retire(&mut self, sequence_number: u64) -> Result<ConnectionId, RegistryError> {
        if !self.active.contains_key(&sequence_number) {
            return Err(RegistryError::UnknownSequence { sequence: sequence_number });
        }
        if self.active.len() == 1 {
            return Err(RegistryError::CannotRetireInUseId { sequence: sequence_number });
        }

        let retired = self
            .active
            .remove(&sequence_number)
            .ok_or(RegistryError::UnknownSequence { sequence: sequence_number })?;
        debug!(sequence_number, "retired connection id");
        Ok(retired.connection_id)
    }

    /// Whether `connection_id` is one of our active IDs.
    pub fn validate(&self, connection_id: &[u8]) -> bool {
        self.active.values().any(|issued| issued.connection_id.as_bytes() == connection_id)
    }

    /// Reset token for an active ID.
    pub fn reset_token(&self, connection_id: &[u8]) -> Option<StatelessResetToken> {
        self.active
            .values()
            .find(|issued| issued.connection_id.as_bytes() == connection_id)
            .map(|issued| issued.reset_token)
    }

    /// Number of active IDs.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Sequence numbers of active IDs, ascending.
    pub fn active_sequences(&self) -> impl Iterator<Item = u64> + '_ {
        self.active.keys().copied()
    }
}

/// Connection IDs issued by the peer.
#[derive(Debug)]
pub struct PeerConnectionIds {
    entries: BTreeMap<u64, NewConnectionId>,
    active_limit: usize,
    /// Every sequence number below this was retired
    retired_below: u64,
    /// Retired sequence numbers at or above `retired_below`
    retired_above: BTreeSet<u64>,
}

impl PeerConnectionIds {
    /// Start with the ID the peer chose during the handshake.
    pub fn new(initial: NewConnectionId, active_limit: usize) -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(initial.sequence_number, initial);
        Self { entries, active_limit, retired_below: 0, retired_above: BTreeSet::new() }
    }

    /// Whether `sequence_number` was retired by this endpoint.
    pub fn is_retired(&self, sequence_number: u64) -> bool {
        sequence_number < self.retired_below || self.retired_above.contains(&sequence_number)
    }

    /// ID to put in the destination field of outgoing packets (the oldest
    /// one still active).
    pub fn current(&self) -> Option<&ConnectionId> {
        self.entries.values().next().map(|entry| &entry.connection_id)
    }

    /// Store a peer-issued ID. Returns false if it was a retransmission or
    /// its sequence number was already retired.
    ///
    /// # Errors
    ///
    /// - `DuplicateSequence` if the sequence number was used for other
    ///   content
    /// - `ActiveLimitReached` if the peer exceeded our limit
    pub fn on_new_connection_id(&mut self, frame: NewConnectionId) -> Result<bool, RegistryError> {
        if self.is_retired(frame.sequence_number) {
            debug!(sequence_number = frame.sequence_number, "ignored retired peer connection id");
            return Ok(false);
        }
        if let Some(existing) = self.entries.get(&frame.sequence_number) {
            if *existing == frame {
                return Ok(false);
            }
            return Err(RegistryError::DuplicateSequence { sequence: frame.sequence_number });
        }
        if self.entries.len() >= self.active_limit {
            return Err(RegistryError::ActiveLimitReached { limit: self.active_limit });
        }

        debug!(sequence_number = frame.sequence_number, "stored peer connection id");
        self.entries.insert(frame.sequence_number, frame);
        Ok(true)
    }

    /// Stop using the ID with `sequence_number`. The caller sends the
    /// retirement signal.
    ///
    /// # Errors
    ///
    /// - `UnknownSequence` if not stored
    /// - `CannotRetireInUseId` if no replacement is available
    pub fn retire(&mut self, sequence_number: u64) -> Result<ConnectionId, RegistryError> {
        if !self.entries.contains_key(&sequence_number) {
            return Err(RegistryError::UnknownSequence { sequence: sequence_number });
        }
        if self.entries.len() == 1 {
            return Err(RegistryError::CannotRetireInUseId { sequence: sequence_number });
        }
        let retired = self
            .entries
            .remove(&sequence_number)
            .ok_or(RegistryError::UnknownSequence { sequence: sequence_number })?;

        self.retired_above.insert(sequence_number);
        while self.retired_above.remove(&self.retired_below) {
            self.retired_below += 1;
        }
        Ok(retired.connection_id)
    }

    /// Sequence number of the ID in use.
    pub fn current_sequence(&self) -> Option<u64> {
        self.entries.keys().next().copied()
    }

    /// Whether the trailing bytes of a datagram are one of the peer's reset
    /// tokens. Every token is compared in full.
    pub fn is_stateless_reset(&self, tail: &[u8; STATELESS_RESET_TOKEN_LEN]) -> bool {
        self.entries.values().fold(false, |found, entry| found | entry.reset_token.matches(tail))
    }

    /// Number of stored IDs.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Never true after construction; present for API symmetry.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::{Duration, Instant},
    };

    use super::*;

    /// Deterministic byte stream; optionally repeats its first output to
    /// force collisions.
    #[derive(Clone)]
    struct CountingEnv {
        counter: Arc<AtomicU64>,
        repeat_first: u64,
    }

    impl CountingEnv {
        fn new() -> Self {
            Self { counter: Arc::new(AtomicU64::new(0)), repeat_first: 0 }
        }
    }

    impl Environment for CountingEnv {
        type Instant = Instant;

        fn now(&self) -> Instant {
            Instant::now()
        }

        fn sleep(&self, _duration: Duration) -> impl std::future::Future<Output = ()> + Send {
            async {}
        }

        fn random_bytes(&self, buffer: &mut [u8]) {
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let value = if n < self.repeat_first { 0 } else { n };
            for (i, byte) in buffer.iter_mut().enumerate() {
                *byte = value.to_be_bytes()[i % 8] ^ (i as u8);
            }
        }
    }

    #[test]
    fn sequence_numbers_strictly_increase() {
        let env = CountingEnv::new();
        let mut registry = ConnectionIdRegistry::new(8, 8).unwrap();

        let issued: Vec<_> = (0..5).map(|_| registry.issue_next(&env).unwrap()).collect();
        for pair in issued.windows(2) {
            assert!(pair[1].sequence_number > pair[0].sequence_number);
        }
        assert_eq!(issued[0].sequence_number, 0);
        assert!(issued.iter().all(|frame| frame.connection_id.len() == 8));
    }

    #[test]
    fn ids_and_tokens_never_repeat() {
        // First four draws are identical; the registry must keep drawing
        let env = CountingEnv { counter: Arc::new(AtomicU64::new(0)), repeat_first: 4 };
        let mut registry = ConnectionIdRegistry::new(4, 8).unwrap();

        let a = registry.issue_next(&env).unwrap();
        let b = registry.issue_next(&env).unwrap();
        assert_ne!(a.connection_id, b.connection_id);
        assert_ne!(a.reset_token, b.reset_token);
    }

    #[test]
    fn retire_sole_id_is_rejected() {
        let env = CountingEnv::new();
        let mut registry = ConnectionIdRegistry::new(8, 8).unwrap();
        let only = registry.issue_next(&env).unwrap();

        assert_eq!(
            registry.retire(only.sequence_number),
            Err(RegistryError::CannotRetireInUseId { sequence: 0 })
        );
        assert!(registry.validate(only.connection_id.as_bytes()));
    }

    #[test]
    fn retire_after_replacement() {
        let env = CountingEnv::new();
        let mut registry = ConnectionIdRegistry::new(8, 8).unwrap();
        let first = registry.issue_next(&env).unwrap();
        let second = registry.issue_next(&env).unwrap();

        assert_eq!(registry.retire(0), Ok(first.connection_id.clone()));
        assert!(!registry.validate(first.connection_id.as_bytes()));
        assert!(registry.validate(second.connection_id.as_bytes()));
        assert_eq!(registry.retire(0), Err(RegistryError::UnknownSequence { sequence: 0 }));
        assert_eq!(registry.retire(9), Err(RegistryError::UnknownSequence { sequence: 9 }));
    }

    #[test]
    fn active_limit_enforced() {
        let env = CountingEnv::new();
        let mut registry = ConnectionIdRegistry::new(8, 2).unwrap();
        registry.issue_next(&env).unwrap();
        registry.issue_next(&env).unwrap();

        assert_eq!(
            registry.issue_next(&env),
            Err(RegistryError::ActiveLimitReached { limit: 2 })
        );

        registry.retire(0).unwrap();
        assert_eq!(registry.issue_next(&env).unwrap().sequence_number, 2);
    }

    #[test]
    fn rejects_invalid_length() {
        assert_eq!(
            ConnectionIdRegistry::new(0, 8).err(),
            Some(RegistryError::InvalidLength { length: 0 })
        );
        assert_eq!(
            ConnectionIdRegistry::new(21, 8).err(),
            Some(RegistryError::InvalidLength { length: 21 })
        );
        assert!(ConnectionId::new(vec![0u8; 21]).is_err());
    }

    #[test]
    fn peer_ids_and_reset_detection() {
        let env = CountingEnv::new();
        let mut issuer = ConnectionIdRegistry::new(8, 8).unwrap();
        let initial = issuer.issue_next(&env).unwrap();
        let next = issuer.issue_next(&env).unwrap();

        let mut peer = PeerConnectionIds::new(initial.clone(), 4);
        assert_eq!(peer.current(), Some(&initial.connection_id));
        assert_eq!(peer.on_new_connection_id(next.clone()), Ok(true));
        assert_eq!(peer.on_new_connection_id(next.clone()), Ok(false));

        assert!(peer.is_stateless_reset(next.reset_token.as_bytes()));
        assert!(!peer.is_stateless_reset(&[0xAA; STATELESS_RESET_TOKEN_LEN]));

        assert_eq!(peer.retire(0), Ok(initial.connection_id));
        assert_eq!(peer.current(), Some(&next.connection_id));
        assert_eq!(peer.retire(1), Err(RegistryError::CannotRetireInUseId { sequence: 1 }));
    }

    #[test]
    fn retired_peer_id_is_not_reinstated() {
        let env = CountingEnv::new();
        let mut issuer = ConnectionIdRegistry::new(8, 8).unwrap();
        let initial = issuer.issue_next(&env).unwrap();
        let first = issuer.issue_next(&env).unwrap();
        let second = issuer.issue_next(&env).unwrap();
        let third = issuer.issue_next(&env).unwrap();

        let mut peer = PeerConnectionIds::new(initial.clone(), 4);
        assert_eq!(peer.on_new_connection_id(second.clone()), Ok(true));
        assert_eq!(peer.on_new_connection_id(third.clone()), Ok(true));
        assert_eq!(peer.retire(0), Ok(initial.connection_id.clone()));
        assert_eq!(peer.retire(2), Ok(second.connection_id.clone()));
        assert!(peer.is_retired(0) && peer.is_retired(2));
        assert!(!peer.is_retired(1));

        // Late retransmissions of retired IDs are ignored
        assert_eq!(peer.on_new_connection_id(initial.clone()), Ok(false));
        assert_eq!(peer.on_new_connection_id(second.clone()), Ok(false));
        assert_eq!(peer.len(), 1);
        assert!(!peer.is_stateless_reset(initial.reset_token.as_bytes()));

        // The gap below them is still open
        assert_eq!(peer.on_new_connection_id(first.clone()), Ok(true));
        assert_eq!(peer.current(), Some(&first.connection_id));
        assert_eq!(peer.retire(1), Ok(first.connection_id));
        assert!(peer.is_retired(1) && peer.is_retired(2));
        assert_eq!(peer.current(), Some(&third.connection_id));
    }

    #[test]
    fn peer_reusing_sequence_is_violation() {
        let env = CountingEnv::new();
        let mut issuer = ConnectionIdRegistry::new(8, 8).unwrap();
        let initial = issuer.issue_next(&env).unwrap();
        let other = issuer.issue_next(&env).unwrap();

        let mut peer = PeerConnectionIds::new(initial, 4);
        let forged = NewConnectionId { sequence_number: 0, ..other };
        let err = peer.on_new_connection_id(forged).unwrap_err();
        assert!(err.is_peer_violation());
    }

    #[test]
    fn token_debug_is_redacted() {
        let token = StatelessResetToken::new([0xAB; STATELESS_RESET_TOKEN_LEN]);
        assert_eq!(format!("{token:?}"), "StatelessResetToken(..)");
        let cid = ConnectionId::new(vec![0xde, 0xad]).unwrap();
        assert_eq!(format!("{cid:?}"), "ConnectionId(dead)");
    }
}
