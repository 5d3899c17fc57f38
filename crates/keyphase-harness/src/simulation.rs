//! Round-based two-endpoint simulation.
//!
//! Each round advances the virtual clock by one tick, fires both endpoints'
//! timers, has each endpoint send one packet carrying an acknowledgment of
//! the largest packet number it has received, and delivers whatever the
//! links release. Invariants are checked at the end of every round.

use std::time::Duration;

use keyphase_core::{
    Endpoint, EndpointAction, EndpointError, EndpointStats, Environment, KeyUpdateConfig,
    KeyUpdateError, Role,
};
use keyphase_crypto::derive_traffic_secrets;
use tracing::{debug, info};

use crate::{
    invariants::{EndpointSnapshot, InvariantRegistry, SystemSnapshot, Violation},
    link::{Link, LinkStats},
    recording::RecordingTracer,
    sim_env::{SimEnv, SimInstant},
};

/// Handshake secret both simulated endpoints derive their keys from.
const HANDSHAKE_SECRET: &[u8] = b"keyphase simulation handshake";

/// Simulation parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SimConfig {
    /// Rounds to run; each endpoint sends one packet per round
    pub packets: u64,
    /// Packet-count update threshold for both endpoints
    pub packet_interval: u64,
    /// Time update threshold for both endpoints
    pub time_interval: Option<Duration>,
    /// Fraction of datagrams lost, per direction
    pub loss: f64,
    /// Fraction of datagrams held back behind later ones
    pub reorder: f64,
    /// RNG seed for the environment and both links
    pub seed: u64,
    /// Virtual time per round
    pub tick: Duration,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            packets: 1000,
            packet_interval: 1,
            time_interval: None,
            loss: 0.0,
            reorder: 0.0,
            seed: 0,
            tick: Duration::from_millis(10),
        }
    }
}

impl SimConfig {
    /// Whether the links neither lose nor reorder datagrams.
    pub fn is_lossless(&self) -> bool {
        self.loss <= 0.0 && self.reorder <= 0.0
    }

    fn key_update_config(&self) -> KeyUpdateConfig {
        KeyUpdateConfig {
            packet_interval: Some(self.packet_interval),
            time_interval: self.time_interval,
            ..KeyUpdateConfig::default()
        }
    }
}

/// Reasons a simulation cannot start.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Endpoint configuration rejected
    #[error("endpoint setup failed: {0}")]
    Endpoint(#[from] EndpointError),

    /// Key installation failed
    #[error("handshake failed: {0}")]
    Handshake(#[from] KeyUpdateError),
}

/// Final state of one endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointReport {
    /// Which side
    pub role: Role,
    /// Counters
    pub stats: EndpointStats,
    /// Final write generation
    pub local_generation: u64,
    /// Final read generation
    pub remote_generation: u64,
    /// Key phase transitions among sent packets
    pub sent_transitions: usize,
    /// Key phase transitions among accepted packets
    pub received_transitions: usize,
    /// Why the endpoint closed, if it did
    pub close_reason: Option<KeyUpdateError>,
}

/// Outcome of a simulation run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimReport {
    /// Rounds executed
    pub rounds: u64,
    /// Client side
    pub client: EndpointReport,
    /// Server side
    pub server: EndpointReport,
    /// Client to server link
    pub to_server: LinkStats,
    /// Server to client link
    pub to_client: LinkStats,
    /// Every violation found, with the round it was found in
    pub violations: Vec<(u64, Violation)>,
}

impl SimReport {
    /// Whether every invariant held in every round.
    pub fn is_clean(&self) -> bool {
        self.violations.is_empty()
    }
}

struct SimEndpoint {
    endpoint: Endpoint<SimInstant>,
    tracer: RecordingTracer,
    largest_received: Option<u64>,
    local_history: Vec<u64>,
    remote_history: Vec<u64>,
}

impl SimEndpoint {
    fn new(role: Role, config: &SimConfig, env: &SimEnv) -> Result<Self, SimError> {
        let mut endpoint = Endpoint::new(role, config.key_update_config(), env)?;
        let tracer = RecordingTracer::new();
        endpoint.set_tracer(Box::new(tracer.clone()));
        Ok(Self {
            endpoint,
            tracer,
            largest_received: None,
            local_history: Vec::new(),
            remote_history: Vec::new(),
        })
    }

    fn send(&mut self, now: SimInstant) -> Option<Vec<u8>> {
        let payload = self.largest_received.map(|pn| pn.to_be_bytes().to_vec()).unwrap_or_default();
        let actions = self.endpoint.send(&payload, now);
        self.log_key_updates(&actions);
        actions.into_iter().find_map(|action| match action {
            EndpointAction::Transmit(datagram) => Some(datagram),
            _ => None,
        })
    }

    fn receive(&mut self, datagram: &[u8], now: SimInstant) {
        let actions = self.endpoint.recv(datagram, now);
        self.log_key_updates(&actions);
        for action in actions {
            if let EndpointAction::Deliver { packet_number, payload } = action {
                self.largest_received =
                    Some(self.largest_received.map_or(packet_number, |l| l.max(packet_number)));
                if let Ok(acked) = <[u8; 8]>::try_from(payload.as_slice()) {
                    self.endpoint.on_ack(u64::from_be_bytes(acked));
                }
            }
        }
    }

    fn on_timeout(&mut self, now: SimInstant) {
        let actions = self.endpoint.on_timeout(now);
        self.log_key_updates(&actions);
    }

    fn log_key_updates(&self, actions: &[EndpointAction]) {
        for action in actions {
            if let EndpointAction::KeyUpdated { direction, generation } = action {
                debug!(role = ?self.endpoint.role(), ?direction, generation, "key update");
            }
        }
    }

    fn generations(&self) -> (u64, u64) {
        let engine = self.endpoint.engine();
        (engine.local_generation().unwrap_or(0), engine.remote_generation().unwrap_or(0))
    }

    fn record_round(&mut self) {
        let (local, remote) = self.generations();
        self.local_history.push(local);
        self.remote_history.push(remote);
    }

    fn snapshot(&self) -> EndpointSnapshot {
        EndpointSnapshot::capture(
            &self.endpoint,
            self.local_history.clone(),
            self.remote_history.clone(),
            self.tracer.sent_transitions(),
            self.tracer.received_transitions(),
        )
    }

    fn report(&self) -> EndpointReport {
        let (local_generation, remote_generation) = self.generations();
        EndpointReport {
            role: self.endpoint.role(),
            stats: self.endpoint.stats(),
            local_generation,
            remote_generation,
            sent_transitions: self.tracer.sent_transitions(),
            received_transitions: self.tracer.received_transitions(),
            close_reason: self.endpoint.close_reason().cloned(),
        }
    }
}

/// A client and a server connected by two simulated links.
pub struct Simulation {
    config: SimConfig,
    env: SimEnv,
    client: SimEndpoint,
    server: SimEndpoint,
    to_server: Link,
    to_client: Link,
    invariants: InvariantRegistry,
    round: u64,
    violations: Vec<(u64, Violation)>,
}

impl Simulation {
    /// Build both endpoints and complete their handshake at time zero.
    ///
    /// Lossless configurations check [`InvariantRegistry::lossless`], all
    /// others [`InvariantRegistry::standard`].
    pub fn new(config: SimConfig) -> Result<Self, SimError> {
        let env = SimEnv::with_seed(config.seed);
        let mut client = SimEndpoint::new(Role::Client, &config, &env)?;
        let mut server = SimEndpoint::new(Role::Server, &config, &env)?;

        let now = env.now();
        let client_cid = client.endpoint.initial_connection_id().clone();
        let server_cid = server.endpoint.initial_connection_id().clone();
        client.endpoint.complete_handshake(
            derive_traffic_secrets(HANDSHAKE_SECRET, Role::Client),
            server_cid,
            now,
        )?;
        server.endpoint.complete_handshake(
            derive_traffic_secrets(HANDSHAKE_SECRET, Role::Server),
            client_cid,
            now,
        )?;

        let invariants = if config.is_lossless() {
            InvariantRegistry::lossless()
        } else {
            InvariantRegistry::standard()
        };

        Ok(Self {
            to_server: Link::new(config.loss, config.reorder, config.seed.wrapping_add(1)),
            to_client: Link::new(config.loss, config.reorder, config.seed.wrapping_add(2)),
            config,
            env,
            client,
            server,
            invariants,
            round: 0,
            violations: Vec::new(),
        })
    }

    /// Replace the invariants checked after every round.
    #[must_use]
    pub fn with_invariants(mut self, registry: InvariantRegistry) -> Self {
        self.invariants = registry;
        self
    }

    /// Rounds executed so far.
    pub fn round(&self) -> u64 {
        self.round
    }

    /// Client endpoint.
    pub fn client(&self) -> &Endpoint<SimInstant> {
        &self.client.endpoint
    }

    /// Server endpoint.
    pub fn server(&self) -> &Endpoint<SimInstant> {
        &self.server.endpoint
    }

    /// Execute one round.
    pub fn step(&mut self) {
        self.round += 1;
        self.env.advance(self.config.tick);
        let now = self.env.now();

        self.client.on_timeout(now);
        self.server.on_timeout(now);

        if let Some(datagram) = self.client.send(now) {
            self.to_server.send(datagram, self.round);
        }
        if let Some(datagram) = self.server.send(now) {
            self.to_client.send(datagram, self.round);
        }

        for datagram in self.to_server.deliver(self.round) {
            self.server.receive(&datagram, now);
        }
        for datagram in self.to_client.deliver(self.round) {
            self.client.receive(&datagram, now);
        }

        self.client.record_round();
        self.server.record_round();

        if let Err(violations) = self.invariants.check_all(&self.snapshot()) {
            for violation in violations {
                debug!(round = self.round, %violation, "invariant violated");
                self.violations.push((self.round, violation));
            }
        }
    }

    /// Observable state of both endpoints.
    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot::pair(self.client.snapshot(), self.server.snapshot())
    }

    /// Run the configured number of rounds, stopping early once both
    /// endpoints have closed.
    pub fn run(mut self) -> SimReport {
        while self.round < self.config.packets {
            if self.client.endpoint.is_closed() && self.server.endpoint.is_closed() {
                break;
            }
            self.step();
        }

        let report = self.report();
        info!(
            rounds = report.rounds,
            client_generation = report.client.local_generation,
            server_generation = report.server.local_generation,
            violations = report.violations.len(),
            "simulation finished"
        );
        report
    }

    /// Summary of the run so far.
    pub fn report(&self) -> SimReport {
        SimReport {
            rounds: self.round,
            client: self.client.report(),
            server: self.server.report(),
            to_server: self.to_server.stats(),
            to_client: self.to_client.stats(),
            violations: self.violations.clone(),
        }
    }
}
