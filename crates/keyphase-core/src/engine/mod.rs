//! Key-phase state machine.
//!
//! Tracks the current and previous key generation for each direction,
//! decides which keys may open an incoming packet, and enforces the rules
//! that stop either side from updating too early or too often.
//!
//! Pure state machine: no I/O, time is passed in. Callers serialize access
//! (see [`crate::SharedEndpoint`]).
//!
//! # Lifecycle
//!
//! ```text
//! ┌───────────────────┐ confirm_handshake ┌────────────────────┐ initialize ┌────────┐
//! │ AwaitingHandshake │──────────────────>│ HandshakeConfirmed │───────────>│ Active │
//! └───────────────────┘                   └────────────────────┘            └────────┘
//!           │                                       │                           │
//!           └───────────────────────────────────────┴───────── close ───────────┴──> Closed
//! ```
//!
//! # Generations
//!
//! The two directions advance independently, each holding at most two key
//! sets. A peer's update is only acted on after a packet authenticates under
//! the candidate keys, so a forged phase bit cannot move either direction.
//! When the peer moves ahead of the local write generation, the local side
//! follows immediately so the peer sees its update answered.

mod keys;
mod receive;
mod send;

use std::time::Duration;

use keyphase_crypto::{HeaderKey, KeyPhase, KeySet, OneRttSecrets};
pub use receive::PhaseObservation;
use receive::ReceiveKeys;
use send::SendKeys;
use tracing::{debug, info, trace, warn};

use crate::{env::Timestamp, error::KeyUpdateError};

/// Engine lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Handshake still running; no key update operation is allowed
    AwaitingHandshake,
    /// Handshake confirmed; waiting for the 1-RTT secrets
    HandshakeConfirmed,
    /// Secrets installed; updates allowed
    Active,
    /// All keys discarded
    Closed,
}

/// Key set selected to open an incoming packet.
#[derive(Debug, Clone, Copy)]
pub struct ReadCandidate<'a> {
    keys: &'a KeySet,
    observation: PhaseObservation,
}

impl<'a> ReadCandidate<'a> {
    /// Keys to try.
    pub fn keys(&self) -> &'a KeySet {
        self.keys
    }

    /// Generation of the keys.
    pub fn generation(&self) -> u64 {
        self.keys.generation()
    }

    /// Why these keys were chosen.
    pub fn observation(&self) -> PhaseObservation {
        self.observation
    }
}

/// Result of confirming that a packet authenticated under a generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    /// Packet used the current remote generation
    Current {
        /// Current remote generation
        generation: u64,
    },
    /// Packet used the retained previous generation
    Reordered {
        /// Previous remote generation
        generation: u64,
    },
    /// The peer updated; the remote direction moved to `generation`
    PeerUpdate {
        /// New remote generation
        generation: u64,
        /// New local write generation, if the local side had to follow
        responded: Option<u64>,
    },
}

/// Key-phase engine for one connection.
///
/// Generic over `Instant` to support both real time and virtual time for
/// deterministic testing.
#[derive(Debug)]
pub struct KeyPhaseEngine<I: Timestamp> {
    state: EngineState,
    retention_period: Duration,
    send: SendKeys<I>,
    receive: ReceiveKeys<I>,
    /// A packet has been sent since the remote generation last advanced
    sent_since_peer_update: bool,
}

impl<I: Timestamp> KeyPhaseEngine<I> {
    /// Create an engine awaiting handshake confirmation.
    ///
    /// A superseded remote generation stays usable for `retention_period`
    /// after the first packet under its successor authenticates.
    pub fn new(retention_period: Duration) -> Self {
        Self {
            state: EngineState::AwaitingHandshake,
            retention_period,
            send: SendKeys::new(),
            receive: ReceiveKeys::new(),
            sent_since_peer_update: true,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Signal from the handshake layer that the handshake is confirmed.
    pub fn confirm_handshake(&mut self) {
        if self.state == EngineState::AwaitingHandshake {
            debug!("handshake confirmed");
            self.state = EngineState::HandshakeConfirmed;
        }
    }

    /// Install the generation-0 secrets for both directions.
    ///
    /// # Errors
    ///
    /// - `HandshakeNotConfirmed` before [`Self::confirm_handshake`]
    /// - `AlreadyInitialized` on a second call
    /// - `ConnectionClosed` after [`Self::close`]
    pub fn initialize(&mut self, secrets: OneRttSecrets, now: I) -> Result<(), KeyUpdateError> {
        match self.state {
            EngineState::AwaitingHandshake => return Err(KeyUpdateError::HandshakeNotConfirmed),
            EngineState::Active => return Err(KeyUpdateError::AlreadyInitialized),
            EngineState::Closed => return Err(KeyUpdateError::ConnectionClosed),
            EngineState::HandshakeConfirmed => {},
        }

        let OneRttSecrets { local, remote } = secrets;
        self.send.install(local, now);
        self.receive.install(remote);
        self.state = EngineState::Active;

        info!("1-RTT keys installed at generation 0");
        Ok(())
    }

    fn ensure_active(&self) -> Result<(), KeyUpdateError> {
        match self.state {
            EngineState::Active => Ok(()),
            EngineState::Closed => Err(KeyUpdateError::ConnectionClosed),
            EngineState::AwaitingHandshake | EngineState::HandshakeConfirmed => {
                Err(KeyUpdateError::HandshakeNotConfirmed)
            },
        }
    }

    /// Current local and remote generations.
    fn generations(&self) -> Result<(u64, u64), KeyUpdateError> {
        self.ensure_active()?;
        match (self.send.generation(), self.receive.generation()) {
            (Some(local), Some(remote)) => Ok((local, remote)),
            _ => Err(KeyUpdateError::HandshakeNotConfirmed),
        }
    }

    /// Write keys for the next outgoing packet.
    pub fn write_key_set(&self) -> Result<&KeySet, KeyUpdateError> {
        self.ensure_active()?;
        self.send.current().ok_or(KeyUpdateError::HandshakeNotConfirmed)
    }

    /// Header protection key for incoming packets.
    pub fn remote_header_key(&self) -> Result<&HeaderKey, KeyUpdateError> {
        self.ensure_active()?;
        self.receive
            .current()
            .map(KeySet::header_key)
            .ok_or(KeyUpdateError::HandshakeNotConfirmed)
    }

    /// Phase bit for outgoing packets.
    pub fn local_phase(&self) -> Option<KeyPhase> {
        self.send.current().map(KeySet::phase)
    }

    /// Current local (write) generation.
    pub fn local_generation(&self) -> Option<u64> {
        self.send.generation()
    }

    /// Current remote (read) generation.
    pub fn remote_generation(&self) -> Option<u64> {
        self.receive.generation()
    }

    /// Previous remote generation, while retained.
    pub fn retained_remote_generation(&self) -> Option<u64> {
        self.receive.previous().map(KeySet::generation)
    }

    /// A local update has not been acknowledged yet.
    pub fn update_in_progress(&self) -> bool {
        self.send.update_pending()
    }

    /// Whether [`Self::initiate_local_update`] would succeed now.
    pub fn can_initiate_update(&self) -> bool {
        self.generations()
            .is_ok_and(|(local, remote)| !self.send.update_pending() && remote >= local)
    }

    /// Packets sent under the current local generation.
    pub fn sent_in_generation(&self) -> u64 {
        self.send.sent_in_generation()
    }

    /// Packets authenticated under the current remote generation.
    pub fn received_in_generation(&self) -> u64 {
        self.receive.received_in_generation()
    }

    /// Time since the current local generation was installed.
    pub fn generation_age(&self, now: I) -> Option<Duration> {
        self.send.generation_started().map(|started| now - started)
    }

    /// Start a local key update.
    ///
    /// Derives the next write generation and switches to it; the superseded
    /// write keys are dropped once the peer acknowledges a packet sent under
    /// the new ones. Returns the new local generation.
    ///
    /// # Errors
    ///
    /// - `HandshakeNotConfirmed` before [`Self::initialize`]; this also
    ///   closes the engine
    /// - `UpdateInProgress` while the previous local update is
    ///   unacknowledged, or the peer has not yet caught up with it
    /// - `ConnectionClosed` after [`Self::close`]
    pub fn initiate_local_update(&mut self, now: I) -> Result<u64, KeyUpdateError> {
        let (local, remote) = match self.generations() {
            Ok(generations) => generations,
            Err(KeyUpdateError::HandshakeNotConfirmed) => {
                warn!("key update requested before the handshake was confirmed");
                self.close();
                return Err(KeyUpdateError::HandshakeNotConfirmed);
            },
            Err(error) => return Err(error),
        };
        if self.send.update_pending() || remote < local {
            return Err(KeyUpdateError::UpdateInProgress { generation: local });
        }

        let generation = self.send.roll(now).ok_or(KeyUpdateError::HandshakeNotConfirmed)?;
        info!(generation, "initiated local key update");
        Ok(generation)
    }

    /// Classify the key phase bit of an incoming packet.
    ///
    /// When the bit signals a possible peer update, the next remote
    /// generation is derived ahead of decryption. Nothing else changes until
    /// [`Self::confirm_generation_in_use`] reports that a packet
    /// authenticated.
    pub fn observe_phase_bit(
        &mut self,
        phase: KeyPhase,
        packet_number: u64,
    ) -> Result<PhaseObservation, KeyUpdateError> {
        self.ensure_active()?;
        let observation = self.receive.classify(phase, packet_number);

        if let PhaseObservation::PeerUpdate { generation } = observation
            && !self.receive.next_is_primed()
        {
            self.receive.prime_next();
            trace!(generation, packet_number, "derived candidate remote keys");
        }

        Ok(observation)
    }

    /// Pick the key set that may open a packet with this phase bit and
    /// packet number.
    ///
    /// The packet number disambiguates a flipped bit: below every packet of
    /// the current generation it belongs to the retained previous
    /// generation, above all of them to the next.
    ///
    /// # Errors
    ///
    /// - `NoValidKeySet` if no live or candidate generation fits
    pub fn select_read_key_set(
        &mut self,
        phase: KeyPhase,
        packet_number: u64,
    ) -> Result<ReadCandidate<'_>, KeyUpdateError> {
        let observation = self.observe_phase_bit(phase, packet_number)?;
        let keys = match observation {
            PhaseObservation::Current { .. } => self.receive.current(),
            PhaseObservation::Reordered { .. } => self.receive.previous(),
            PhaseObservation::PeerUpdate { .. } => self.receive.prime_next(),
            PhaseObservation::Unmatched => None,
        };

        match keys {
            Some(keys) => Ok(ReadCandidate { keys, observation }),
            None => Err(KeyUpdateError::NoValidKeySet { phase, packet_number }),
        }
    }

    /// Record that `packet_number` authenticated under `generation`.
    ///
    /// For the next remote generation this completes the peer's update:
    /// the remote direction advances, the superseded generation's retention
    /// countdown starts and, if the peer is now ahead, the local write keys
    /// follow.
    ///
    /// # Errors
    ///
    /// - `UpdateTooFrequent` if the peer updates again before any packet was
    ///   sent since its previous update (closes the engine)
    /// - `NoValidKeySet` if `generation` is not live or next
    pub fn confirm_generation_in_use(
        &mut self,
        generation: u64,
        packet_number: u64,
        now: I,
    ) -> Result<Confirmation, KeyUpdateError> {
        let (local, remote) = self.generations()?;

        if generation == remote {
            self.receive.on_current_packet(packet_number);
            return Ok(Confirmation::Current { generation });
        }
        if self.retained_remote_generation() == Some(generation) {
            trace!(generation, packet_number, "reordered packet under previous keys");
            return Ok(Confirmation::Reordered { generation });
        }
        if generation != remote + 1 {
            return Err(KeyUpdateError::NoValidKeySet {
                phase: KeyPhase::for_generation(generation),
                packet_number,
            });
        }

        if remote > 0 && !self.sent_since_peer_update {
            warn!(generation, packet_number, "peer updated keys before acknowledging its last update");
            self.close();
            return Err(KeyUpdateError::UpdateTooFrequent { generation });
        }

        let deadline = now + self.retention_period;
        let promoted = self
            .receive
            .promote(packet_number, deadline)
            .ok_or(KeyUpdateError::HandshakeNotConfirmed)?;
        self.sent_since_peer_update = false;
        info!(generation = promoted, packet_number, "peer key update");

        let responded = if local < promoted {
            let responded = self.send.roll(now);
            debug!(generation = ?responded, "following peer key update");
            responded
        } else {
            None
        };

        Ok(Confirmation::PeerUpdate { generation: promoted, responded })
    }

    /// Record that `packet_number` was sent under the current write keys.
    pub fn on_packet_sent(&mut self, packet_number: u64) {
        if self.state != EngineState::Active {
            return;
        }
        self.send.on_packet_sent(packet_number);
        self.sent_since_peer_update = true;
    }

    /// Process the peer's largest acknowledged packet number.
    ///
    /// Returns the local generation that became confirmed, if any.
    pub fn on_ack_received(&mut self, largest_acked: u64) -> Option<u64> {
        if self.state != EngineState::Active {
            return None;
        }
        let (generation, dropped) = self.send.on_ack(largest_acked)?;
        debug!(generation, dropped, largest_acked, "local key update confirmed");
        Some(generation)
    }

    /// Drop the previous remote generation once its retention window has
    /// passed. Returns the discarded generation.
    pub fn discard_expired(&mut self, now: I) -> Option<u64> {
        let discarded = self.receive.expire(now)?;
        debug!(generation = discarded, "discarded previous remote keys");
        Some(discarded)
    }

    /// When [`Self::discard_expired`] next has work to do.
    pub fn next_timeout(&self) -> Option<I> {
        self.receive.deadline()
    }

    /// Discard every key set. All later operations fail with
    /// `ConnectionClosed`.
    pub fn close(&mut self) {
        if self.state != EngineState::Closed {
            debug!("discarding all 1-RTT keys");
        }
        self.send.clear();
        self.receive.clear();
        self.state = EngineState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use keyphase_crypto::{Role, derive_traffic_secrets, open_payload, seal_payload};

    use super::*;

    const RETENTION: Duration = Duration::from_secs(3);

    fn active(role: Role, now: Instant) -> KeyPhaseEngine<Instant> {
        let mut engine = KeyPhaseEngine::new(RETENTION);
        engine.confirm_handshake();
        engine.initialize(derive_traffic_secrets(b"handshake", role), now).unwrap();
        engine
    }

    fn pair(now: Instant) -> (KeyPhaseEngine<Instant>, KeyPhaseEngine<Instant>) {
        (active(Role::Client, now), active(Role::Server, now))
    }

    struct Packet {
        phase: KeyPhase,
        number: u64,
        sealed: Vec<u8>,
    }

    fn send(from: &mut KeyPhaseEngine<Instant>, number: u64) -> Packet {
        let keys = from.write_key_set().unwrap();
        let phase = keys.phase();
        let sealed = seal_payload(keys, number, &[u8::from(phase.bit())], b"payload");
        from.on_packet_sent(number);
        Packet { phase, number, sealed }
    }

    fn deliver(
        to: &mut KeyPhaseEngine<Instant>,
        packet: &Packet,
        now: Instant,
    ) -> Result<Confirmation, KeyUpdateError> {
        let candidate = to.select_read_key_set(packet.phase, packet.number)?;
        let generation = candidate.generation();
        open_payload(candidate.keys(), packet.number, &[u8::from(packet.phase.bit())], &packet.sealed)
            .map_err(|_| KeyUpdateError::DecryptionFailed { packet_number: packet.number })?;
        to.confirm_generation_in_use(generation, packet.number, now)
    }

    #[test]
    fn update_before_handshake_closes() {
        let now = Instant::now();
        let mut engine = KeyPhaseEngine::<Instant>::new(RETENTION);
        assert_eq!(engine.initiate_local_update(now), Err(KeyUpdateError::HandshakeNotConfirmed));
        assert_eq!(engine.state(), EngineState::Closed);

        engine.confirm_handshake();
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(engine.initiate_local_update(now), Err(KeyUpdateError::ConnectionClosed));
        assert_eq!(
            engine.initialize(derive_traffic_secrets(b"handshake", Role::Client), now),
            Err(KeyUpdateError::ConnectionClosed)
        );
    }

    #[test]
    fn update_before_initialize_closes() {
        let now = Instant::now();
        let mut engine = KeyPhaseEngine::<Instant>::new(RETENTION);
        engine.confirm_handshake();
        assert_eq!(
            engine.observe_phase_bit(KeyPhase::One, 0),
            Err(KeyUpdateError::HandshakeNotConfirmed)
        );
        assert_eq!(engine.state(), EngineState::HandshakeConfirmed);

        assert_eq!(engine.initiate_local_update(now), Err(KeyUpdateError::HandshakeNotConfirmed));
        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(engine.local_generation(), None);
    }

    #[test]
    fn initialize_requires_confirmed_handshake() {
        let now = Instant::now();
        let mut engine = KeyPhaseEngine::<Instant>::new(RETENTION);
        let secrets = derive_traffic_secrets(b"handshake", Role::Client);

        assert_eq!(
            engine.initialize(secrets.clone(), now),
            Err(KeyUpdateError::HandshakeNotConfirmed)
        );
        engine.confirm_handshake();
        assert_eq!(engine.initialize(secrets.clone(), now), Ok(()));
        assert_eq!(engine.initialize(secrets, now), Err(KeyUpdateError::AlreadyInitialized));
        assert_eq!(engine.local_generation(), Some(0));
        assert_eq!(engine.remote_generation(), Some(0));
    }

    #[test]
    fn second_update_before_confirmation_is_in_progress() {
        let now = Instant::now();
        let mut engine = active(Role::Client, now);

        assert_eq!(engine.initiate_local_update(now), Ok(1));
        assert_eq!(
            engine.initiate_local_update(now),
            Err(KeyUpdateError::UpdateInProgress { generation: 1 })
        );
        assert_eq!(engine.local_generation(), Some(1));
        assert_eq!(engine.local_phase(), Some(KeyPhase::One));
    }

    #[test]
    fn ack_of_new_generation_confirms_update() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);

        send(&mut client, 0);
        client.initiate_local_update(now).unwrap();
        assert_eq!(client.on_ack_received(0), None, "ack of a gen-0 packet confirms nothing");

        let packet = send(&mut client, 1);
        deliver(&mut server, &packet, now).unwrap();

        // The server's ack travels under its own (followed) generation 1
        let reply = send(&mut server, 0);
        assert_eq!(
            deliver(&mut client, &reply, now),
            Ok(Confirmation::PeerUpdate { generation: 1, responded: None })
        );
        assert_eq!(client.on_ack_received(1), Some(1));
        assert!(!client.update_in_progress());
        assert!(client.can_initiate_update());
    }

    #[test]
    fn peer_update_is_followed_locally() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);

        client.initiate_local_update(now).unwrap();
        let packet = send(&mut client, 0);

        assert_eq!(
            deliver(&mut server, &packet, now),
            Ok(Confirmation::PeerUpdate { generation: 1, responded: Some(1) })
        );
        assert_eq!(server.remote_generation(), Some(1));
        assert_eq!(server.local_generation(), Some(1));
        assert_eq!(server.retained_remote_generation(), Some(0));
    }

    #[test]
    fn forged_phase_flip_changes_nothing() {
        let now = Instant::now();
        let (_, mut server) = pair(now);

        let observation = server.observe_phase_bit(KeyPhase::One, 5).unwrap();
        assert_eq!(observation, PhaseObservation::PeerUpdate { generation: 1 });

        let candidate = server.select_read_key_set(KeyPhase::One, 5).unwrap();
        assert!(open_payload(candidate.keys(), 5, &[1], &[0u8; 32]).is_err());

        assert_eq!(server.remote_generation(), Some(0));
        assert_eq!(server.local_generation(), Some(0));
    }

    #[test]
    fn double_peer_flip_is_too_frequent() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);

        client.initiate_local_update(now).unwrap();
        let first = send(&mut client, 0);
        deliver(&mut server, &first, now).unwrap();

        // Force the client ahead without waiting for an acknowledgement
        client.send.on_ack(0);
        client.receive.promote(0, now + RETENTION);
        client.initiate_local_update(now).unwrap();
        let second = send(&mut client, 1);

        assert_eq!(
            deliver(&mut server, &second, now),
            Err(KeyUpdateError::UpdateTooFrequent { generation: 2 })
        );
        assert_eq!(server.state(), EngineState::Closed);
        assert_eq!(server.write_key_set().err(), Some(KeyUpdateError::ConnectionClosed));
    }

    #[test]
    fn reordered_packet_opens_within_retention() {
        let t0 = Instant::now();
        let (mut client, mut server) = pair(t0);

        let late = send(&mut client, 0);
        deliver(&mut server, &send(&mut client, 1), t0).unwrap();
        client.initiate_local_update(t0).unwrap();
        deliver(&mut server, &send(&mut client, 2), t0).unwrap();

        let within = t0 + Duration::from_secs(1);
        assert_eq!(server.discard_expired(within), None);
        assert_eq!(
            deliver(&mut server, &late, within),
            Ok(Confirmation::Reordered { generation: 0 })
        );
    }

    #[test]
    fn reordered_packet_dropped_after_retention() {
        let t0 = Instant::now();
        let (mut client, mut server) = pair(t0);

        let late = send(&mut client, 0);
        deliver(&mut server, &send(&mut client, 1), t0).unwrap();
        client.initiate_local_update(t0).unwrap();
        deliver(&mut server, &send(&mut client, 2), t0).unwrap();

        assert_eq!(server.next_timeout(), Some(t0 + RETENTION));
        assert_eq!(server.discard_expired(t0 + RETENTION), Some(0));
        assert_eq!(server.retained_remote_generation(), None);
        assert_eq!(
            deliver(&mut server, &late, t0 + RETENTION),
            Err(KeyUpdateError::NoValidKeySet { phase: KeyPhase::Zero, packet_number: 0 })
        );
    }

    #[test]
    fn further_promotion_drops_previous_immediately() {
        let t0 = Instant::now();
        let (mut client, mut server) = pair(t0);

        for round in 0..3u64 {
            client.initiate_local_update(t0).unwrap();
            let packet = send(&mut client, round * 2);
            deliver(&mut server, &packet, t0).unwrap();
            let reply = send(&mut server, round);
            deliver(&mut client, &reply, t0).unwrap();
            client.on_ack_received(round * 2);
            deliver(&mut server, &send(&mut client, round * 2 + 1), t0).unwrap();
        }

        assert_eq!(server.remote_generation(), Some(3));
        assert_eq!(server.retained_remote_generation(), Some(2));
    }

    #[test]
    fn unmatched_bit_between_current_packets() {
        let now = Instant::now();
        let (mut client, mut server) = pair(now);

        deliver(&mut server, &send(&mut client, 3), now).unwrap();
        deliver(&mut server, &send(&mut client, 9), now).unwrap();

        assert_eq!(server.observe_phase_bit(KeyPhase::One, 5), Ok(PhaseObservation::Unmatched));
        assert!(matches!(
            server.select_read_key_set(KeyPhase::One, 5),
            Err(KeyUpdateError::NoValidKeySet { .. })
        ));
    }

    #[test]
    fn close_discards_everything() {
        let now = Instant::now();
        let mut engine = active(Role::Server, now);
        engine.close();

        assert_eq!(engine.state(), EngineState::Closed);
        assert_eq!(engine.local_generation(), None);
        assert_eq!(engine.initiate_local_update(now), Err(KeyUpdateError::ConnectionClosed));
        assert_eq!(
            engine.initialize(derive_traffic_secrets(b"x", Role::Server), now),
            Err(KeyUpdateError::ConnectionClosed)
        );
    }
}
