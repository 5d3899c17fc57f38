//! QUIC 1-RTT key update state machine.
//!
//! Sans-IO building blocks for rotating packet protection keys on a live
//! connection:
//!
//! - [`KeyPhaseEngine`]: per-direction key generations, phase bit
//!   interpretation, update rules
//! - [`PacketProtector`]: seals and opens short-header packets with the
//!   engine's keys
//! - [`UpdateTrigger`]: packet-count and time thresholds for local updates
//! - [`ConnectionIdRegistry`] / [`PeerConnectionIds`]: connection IDs and
//!   stateless reset tokens
//! - [`Endpoint`]: all of the above behind send/receive, with
//!   [`SharedEndpoint`] as the single serialization point
//!
//! Time is always passed in. Randomness comes from an [`Environment`], so the
//! simulation harness can replay any run from a seed.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod cid_registry;
pub mod config;
pub mod endpoint;
pub mod engine;
pub mod env;
pub mod error;
pub mod packet;
pub mod protector;
pub mod shared;
pub mod system_env;
pub mod tracer;
pub mod trigger;

pub use cid_registry::{
    ConnectionId, ConnectionIdRegistry, NewConnectionId, PeerConnectionIds,
    STATELESS_RESET_TOKEN_LEN, StatelessResetToken,
};
pub use config::{
    ConfigError, DEFAULT_ACTIVE_CONNECTION_ID_LIMIT, DEFAULT_CONNECTION_ID_LENGTH,
    DEFAULT_KEY_RETENTION_PERIOD, DEFAULT_KEY_UPDATE_PACKET_INTERVAL,
    DEFAULT_KEY_UPDATE_TIME_INTERVAL, KeyUpdateConfig, MAX_CONNECTION_ID_LENGTH,
};
pub use endpoint::{Endpoint, EndpointAction, EndpointStats};
pub use engine::{Confirmation, EngineState, KeyPhaseEngine, PhaseObservation, ReadCandidate};
pub use env::{Environment, Timestamp};
pub use error::{EndpointError, KeyUpdateError, PacketError, RegistryError};
pub use keyphase_crypto::{Direction, KeyPhase, KeySet, OneRttSecrets, Role};
pub use protector::{DropReason, OpenOutcome, OpenedPacket, PacketProtector};
pub use shared::{SharedEndpoint, spawn_update_timer};
pub use system_env::SystemEnv;
pub use tracer::{HeaderForm, LogTracer, PacketInfo, PacketTracer, count_key_phase_transitions};
pub use trigger::{TriggerOutcome, UpdateTrigger};
