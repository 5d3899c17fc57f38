//! One side of a connection: engine, protector, trigger and connection IDs
//! composed behind a send/receive interface.
//!
//! Uses the action pattern: methods take time as input and return actions
//! for the driver to execute. Fatal errors close the endpoint and surface as
//! [`EndpointAction::Close`]; dropped packets surface as nothing at all.

use std::fmt;

use keyphase_crypto::{Direction, OneRttSecrets, Role};
use tracing::{debug, warn};

use crate::{
    cid_registry::{
        ConnectionId, ConnectionIdRegistry, NewConnectionId, PeerConnectionIds,
        STATELESS_RESET_TOKEN_LEN,
    },
    config::KeyUpdateConfig,
    engine::{Confirmation, EngineState, KeyPhaseEngine},
    env::{Environment, Timestamp},
    error::{EndpointError, KeyUpdateError, RegistryError},
    packet::{HeaderForm, destination_connection_id},
    protector::{OpenOutcome, PacketProtector},
    tracer::{LogTracer, PacketInfo, PacketTracer},
    trigger::{TriggerOutcome, UpdateTrigger},
};

/// Actions returned by the endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAction {
    /// Put this datagram on the wire
    Transmit(Vec<u8>),
    /// Hand this payload to the application
    Deliver {
        /// Packet number it arrived in
        packet_number: u64,
        /// Decrypted payload
        payload: Vec<u8>,
    },
    /// Long-header packet for the handshake layer, untouched
    HandshakePacket(Vec<u8>),
    /// A direction moved to a new key generation
    KeyUpdated {
        /// Which direction
        direction: Direction,
        /// New generation
        generation: u64,
    },
    /// The peer signalled that it lost all connection state
    StatelessReset,
    /// The connection must be closed
    Close {
        /// Fatal error that caused the close
        error: KeyUpdateError,
    },
}

/// Packet and update counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointStats {
    /// Packets sealed and handed to the driver
    pub sent: u64,
    /// Packets authenticated
    pub received: u64,
    /// Packets silently discarded
    pub dropped: u64,
    /// Local updates started by the trigger or on request
    pub local_updates: u64,
    /// Peer updates completed
    pub peer_updates: u64,
}

/// One side of a 1-RTT connection.
pub struct Endpoint<I: Timestamp> {
    role: Role,
    config: KeyUpdateConfig,
    engine: KeyPhaseEngine<I>,
    protector: PacketProtector,
    trigger: UpdateTrigger,
    local_cids: ConnectionIdRegistry,
    initial_cid: NewConnectionId,
    peer_cids: Option<PeerConnectionIds>,
    next_packet_number: u64,
    largest_received: Option<u64>,
    tracer: Box<dyn PacketTracer>,
    stats: EndpointStats,
    close_reason: Option<KeyUpdateError>,
}

impl<I: Timestamp> Endpoint<I> {
    /// Create an endpoint awaiting the handshake and issue its first
    /// connection ID (sequence 0).
    pub fn new<E>(role: Role, config: KeyUpdateConfig, env: &E) -> Result<Self, EndpointError>
    where
        E: Environment<Instant = I>,
    {
        config.validate()?;
        let mut local_cids = ConnectionIdRegistry::from_config(&config)?;
        let initial_cid = local_cids.issue_next(env)?;

        Ok(Self {
            role,
            engine: KeyPhaseEngine::new(config.retention_period),
            protector: PacketProtector::new(config.connection_id_length),
            trigger: UpdateTrigger::from_config(&config),
            local_cids,
            initial_cid,
            peer_cids: None,
            next_packet_number: 0,
            largest_received: None,
            tracer: Box::new(LogTracer),
            stats: EndpointStats::default(),
            close_reason: None,
            config,
        })
    }

    /// Replace the packet tracer.
    pub fn set_tracer(&mut self, tracer: Box<dyn PacketTracer>) {
        self.tracer = tracer;
    }

    /// Replace the update trigger.
    pub fn set_trigger(&mut self, trigger: UpdateTrigger) {
        self.trigger = trigger;
    }

    /// Which side of the connection this is.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Active configuration.
    pub fn config(&self) -> &KeyUpdateConfig {
        &self.config
    }

    /// The key-phase engine.
    pub fn engine(&self) -> &KeyPhaseEngine<I> {
        &self.engine
    }

    /// Counters.
    pub fn stats(&self) -> EndpointStats {
        self.stats
    }

    /// The connection ID issued at construction, for the handshake.
    pub fn initial_connection_id(&self) -> &NewConnectionId {
        &self.initial_cid
    }

    /// Whether the endpoint is closed.
    pub fn is_closed(&self) -> bool {
        self.engine.state() == EngineState::Closed
    }

    /// The fatal error that closed the endpoint, if any.
    pub fn close_reason(&self) -> Option<&KeyUpdateError> {
        self.close_reason.as_ref()
    }

    /// Handshake finished: record the peer's first connection ID and install
    /// the 1-RTT secrets.
    pub fn complete_handshake(
        &mut self,
        secrets: OneRttSecrets,
        peer_initial: NewConnectionId,
        now: I,
    ) -> Result<(), KeyUpdateError> {
        self.engine.confirm_handshake();
        self.engine.initialize(secrets, now)?;
        self.peer_cids =
            Some(PeerConnectionIds::new(peer_initial, self.config.active_connection_id_limit));
        debug!(role = ?self.role, "handshake complete");
        Ok(())
    }

    fn fail(&mut self, error: KeyUpdateError) -> EndpointAction {
        warn!(role = ?self.role, %error, "closing connection");
        self.engine.close();
        self.close_reason = Some(error.clone());
        EndpointAction::Close { error }
    }

    fn poll_trigger(&mut self, now: I, actions: &mut Vec<EndpointAction>) -> Result<(), KeyUpdateError> {
        if let TriggerOutcome::Initiated { generation } = self.trigger.poll(&mut self.engine, now)? {
            self.stats.local_updates += 1;
            actions.push(EndpointAction::KeyUpdated { direction: Direction::Local, generation });
        }
        Ok(())
    }

    /// Seal `payload` into the next packet.
    pub fn send(&mut self, payload: &[u8], now: I) -> Vec<EndpointAction> {
        if self.is_closed() {
            return Vec::new();
        }

        let mut actions = Vec::new();
        self.engine.discard_expired(now);
        if let Err(error) = self.poll_trigger(now, &mut actions) {
            actions.push(self.fail(error));
            return actions;
        }

        let Some(dcid) = self.peer_cids.as_ref().and_then(PeerConnectionIds::current).cloned()
        else {
            actions.push(self.fail(KeyUpdateError::HandshakeNotConfirmed));
            return actions;
        };

        let packet_number = self.next_packet_number;
        match self.protector.seal(&mut self.engine, &dcid, packet_number, payload) {
            Ok(packet) => {
                self.next_packet_number += 1;
                self.stats.sent += 1;
                self.tracer.sent_packet(&PacketInfo {
                    header_form: HeaderForm::Short,
                    key_phase: self.engine.local_phase(),
                    packet_number,
                    size: packet.len(),
                });
                actions.push(EndpointAction::Transmit(packet));
            },
            Err(error) => actions.push(self.fail(error)),
        }
        actions
    }

    /// Process an incoming datagram.
    pub fn recv(&mut self, datagram: &[u8], now: I) -> Vec<EndpointAction> {
        if self.is_closed() {
            return Vec::new();
        }
        self.engine.discard_expired(now);

        let Some(&first) = datagram.first() else {
            self.stats.dropped += 1;
            return Vec::new();
        };
        if HeaderForm::of(first) == HeaderForm::Long {
            self.tracer.received_packet(&PacketInfo {
                header_form: HeaderForm::Long,
                key_phase: None,
                packet_number: 0,
                size: datagram.len(),
            });
            return vec![EndpointAction::HandshakePacket(datagram.to_vec())];
        }

        let known = destination_connection_id(datagram, self.local_cids.connection_id_length())
            .is_some_and(|dcid| self.local_cids.validate(dcid));
        if !known {
            return self.drop_or_reset(datagram, "unknown destination connection id");
        }

        let opened = match self.protector.open_datagram(
            &mut self.engine,
            datagram,
            self.largest_received,
            now,
        ) {
            Ok(OpenOutcome::Opened(opened)) => opened,
            Ok(OpenOutcome::Dropped(_)) => {
                return self.drop_or_reset(datagram, "packet failed to open");
            },
            Err(error) => return vec![self.fail(error)],
        };

        self.largest_received =
            Some(self.largest_received.map_or(opened.packet_number, |l| l.max(opened.packet_number)));
        self.stats.received += 1;
        self.tracer.received_packet(&PacketInfo {
            header_form: HeaderForm::Short,
            key_phase: Some(opened.phase),
            packet_number: opened.packet_number,
            size: datagram.len(),
        });

        let mut actions = Vec::new();
        if let Confirmation::PeerUpdate { generation, responded } = opened.confirmation {
            self.stats.peer_updates += 1;
            actions.push(EndpointAction::KeyUpdated { direction: Direction::Remote, generation });
            if let Some(generation) = responded {
                actions.push(EndpointAction::KeyUpdated { direction: Direction::Local, generation });
            }
        }
        actions.push(EndpointAction::Deliver {
            packet_number: opened.packet_number,
            payload: opened.payload,
        });
        actions
    }

    fn drop_or_reset(&mut self, datagram: &[u8], reason: &'static str) -> Vec<EndpointAction> {
        if self.is_stateless_reset(datagram) {
            warn!(role = ?self.role, "stateless reset from peer");
            self.engine.close();
            return vec![EndpointAction::StatelessReset];
        }
        self.stats.dropped += 1;
        debug!(role = ?self.role, size = datagram.len(), reason, "dropped datagram");
        Vec::new()
    }

    fn is_stateless_reset(&self, datagram: &[u8]) -> bool {
        let Some(peer_cids) = &self.peer_cids else {
            return false;
        };
        let Some(start) = datagram.len().checked_sub(STATELESS_RESET_TOKEN_LEN) else {
            return false;
        };
        <&[u8; STATELESS_RESET_TOKEN_LEN]>::try_from(&datagram[start..])
            .is_ok_and(|tail| peer_cids.is_stateless_reset(tail))
    }

    /// Process the largest packet number the peer acknowledged. Returns the
    /// local generation that became confirmed, if any.
    pub fn on_ack(&mut self, largest_acked: u64) -> Option<u64> {
        self.engine.on_ack_received(largest_acked)
    }

    /// Timer expiry: discard expired keys and apply the time threshold.
    pub fn on_timeout(&mut self, now: I) -> Vec<EndpointAction> {
        if self.is_closed() {
            return Vec::new();
        }
        self.engine.discard_expired(now);

        let mut actions = Vec::new();
        if self.engine.state() == EngineState::Active
            && let Err(error) = self.poll_trigger(now, &mut actions)
        {
            actions.push(self.fail(error));
        }
        actions
    }

    /// Earliest time [`Self::on_timeout`] has work to do.
    pub fn next_timeout(&self, now: I) -> Option<I> {
        let retention = self.engine.next_timeout();
        let update = self.trigger.next_deadline(&self.engine, now);
        match (retention, update) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Explicitly request a local key update.
    ///
    /// # Errors
    ///
    /// `UpdateInProgress` if one is pending. Fatal errors, such as a
    /// request before the handshake completes, close the endpoint.
    pub fn request_key_update(&mut self, now: I) -> Result<u64, KeyUpdateError> {
        if self.is_closed() {
            return Err(KeyUpdateError::ConnectionClosed);
        }
        match self.engine.initiate_local_update(now) {
            Ok(generation) => {
                self.stats.local_updates += 1;
                Ok(generation)
            },
            Err(error) if error.is_fatal() => {
                self.fail(error.clone());
                Err(error)
            },
            Err(error) => Err(error),
        }
    }

    /// Issue an additional connection ID for the peer.
    pub fn issue_connection_id<E>(&mut self, env: &E) -> Result<NewConnectionId, RegistryError>
    where
        E: Environment<Instant = I>,
    {
        self.local_cids.issue_next(env)
    }

    /// The peer retired one of our connection IDs.
    pub fn on_retire_connection_id(
        &mut self,
        sequence_number: u64,
    ) -> Result<ConnectionId, RegistryError> {
        self.local_cids.retire(sequence_number)
    }

    /// The peer issued a connection ID.
    pub fn on_new_connection_id(&mut self, frame: NewConnectionId) -> Result<bool, RegistryError> {
        match &mut self.peer_cids {
            Some(peer_cids) => peer_cids.on_new_connection_id(frame),
            None => Err(RegistryError::UnknownSequence { sequence: frame.sequence_number }),
        }
    }

    /// Switch to the next peer-issued ID. Returns the sequence number to
    /// send in a retirement signal.
    pub fn rotate_peer_connection_id(&mut self) -> Result<u64, RegistryError> {
        let Some(peer_cids) = &mut self.peer_cids else {
            return Err(RegistryError::UnknownSequence { sequence: 0 });
        };
        let sequence = peer_cids
            .current_sequence()
            .ok_or(RegistryError::UnknownSequence { sequence: 0 })?;
        peer_cids.retire(sequence)?;
        Ok(sequence)
    }

    /// Destination connection ID for outgoing packets.
    pub fn peer_connection_id(&self) -> Option<&ConnectionId> {
        self.peer_cids.as_ref().and_then(PeerConnectionIds::current)
    }

    /// Whether `connection_id` is one of ours.
    pub fn owns_connection_id(&self, connection_id: &[u8]) -> bool {
        self.local_cids.validate(connection_id)
    }

    /// Close the connection and discard all keys.
    pub fn close(&mut self) {
        self.engine.close();
    }
}

impl<I: Timestamp> fmt::Debug for Endpoint<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("role", &self.role)
            .field("engine", &self.engine)
            .field("next_packet_number", &self.next_packet_number)
            .field("largest_received", &self.largest_received)
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}
