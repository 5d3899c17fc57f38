//! Deterministic simulation harness for key-update testing.
//!
//! Two endpoints exchange packets over a seeded, lossy and reordering link
//! on a virtual clock. Every run is reproducible from its seed.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks behavioral properties after every round:
//! no fatal close, monotonic generations, and send/receive generations that
//! never drift more than one apart. Use [`InvariantRegistry::standard()`] for
//! lossy links and [`InvariantRegistry::lossless()`] when the link neither
//! drops nor reorders.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod link;
pub mod recording;
pub mod sim_env;
pub mod simulation;

pub use invariants::{
    EndpointSnapshot, GenerationLockStep, GenerationMonotonicity, Invariant, InvariantRegistry,
    InvariantResult, NoFatalClose, SystemSnapshot, TransitionBalance, Violation,
};
pub use link::{Link, LinkStats};
pub use recording::RecordingTracer;
pub use sim_env::{SimEnv, SimInstant};
pub use simulation::{EndpointReport, SimConfig, SimError, SimReport, Simulation};
