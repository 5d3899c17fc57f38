//! Environment abstraction for deterministic testing.
//!
//! Decouples the key-update logic from system resources (time, randomness).
//! The simulation harness plugs in a virtual clock and seeded RNG; production
//! uses [`crate::SystemEnv`].

use std::{
    fmt,
    ops::{Add, Sub},
    time::Duration,
};

/// Point in time understood by the state machines.
///
/// Blanket-implemented for anything that behaves like an instant, so both
/// `std::time::Instant` and virtual simulation clocks qualify.
pub trait Timestamp:
    Copy + Ord + Send + Sync + fmt::Debug + Add<Duration, Output = Self> + Sub<Output = Duration>
{
}

impl<T> Timestamp for T where
    T: Copy
        + Ord
        + Send
        + Sync
        + fmt::Debug
        + Add<Duration, Output = Self>
        + Sub<Output = Duration>
{
}

/// Abstract environment providing time, randomness, and async primitives.
///
/// # Safety
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `random_bytes()` uses cryptographically secure entropy in production
pub trait Environment: Clone + Send + Sync + 'static {
    /// The instant type used by this environment.
    type Instant: Timestamp;

    /// Current time (monotonic).
    fn now(&self) -> Self::Instant;

    /// Sleeps for the specified duration.
    ///
    /// Only driver code (the update timer) awaits this; the state machines
    /// never do.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;

    /// Fills the provided buffer with random bytes.
    ///
    /// Connection IDs and stateless reset tokens are drawn from here, so the
    /// same seed must reproduce the same bytes.
    fn random_bytes(&self, buffer: &mut [u8]);
}
