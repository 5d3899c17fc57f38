//! Policy deciding when to request a local key update.

use std::time::Duration;

use tracing::{debug, trace};

use crate::{config::KeyUpdateConfig, engine::KeyPhaseEngine, env::Timestamp, error::KeyUpdateError};

/// Result of polling the trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// No threshold crossed
    Idle,
    /// A local update was started
    Initiated {
        /// New local generation
        generation: u64,
    },
    /// A threshold was crossed but an update is already in progress
    Suppressed,
}

/// Packet-count and elapsed-time thresholds.
///
/// Only ever requests an update; a request while one is in progress is
/// absorbed as [`TriggerOutcome::Suppressed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateTrigger {
    packet_interval: Option<u64>,
    time_interval: Option<Duration>,
}

impl UpdateTrigger {
    /// Trigger with explicit thresholds. `None` disables a threshold.
    pub fn new(packet_interval: Option<u64>, time_interval: Option<Duration>) -> Self {
        Self { packet_interval, time_interval }
    }

    /// Trigger using the configured thresholds.
    pub fn from_config(config: &KeyUpdateConfig) -> Self {
        Self::new(config.packet_interval, config.time_interval)
    }

    /// Request an update after every packet.
    pub fn every_packet() -> Self {
        Self::new(Some(1), None)
    }

    /// Never request an update.
    pub fn disabled() -> Self {
        Self::new(None, None)
    }

    /// Whether a threshold has been crossed for the current generation.
    ///
    /// Packets count in either direction: whichever of sent or received
    /// reaches the interval first.
    pub fn is_due<I: Timestamp>(&self, engine: &KeyPhaseEngine<I>, now: I) -> bool {
        let packets = engine.sent_in_generation().max(engine.received_in_generation());
        let packets_due = self.packet_interval.is_some_and(|interval| packets >= interval);
        let time_due = self
            .time_interval
            .zip(engine.generation_age(now))
            .is_some_and(|(interval, age)| age >= interval);
        packets_due || time_due
    }

    /// When the time threshold will next be crossed.
    pub fn next_deadline<I: Timestamp>(&self, engine: &KeyPhaseEngine<I>, now: I) -> Option<I> {
        let interval = self.time_interval?;
        let age = engine.generation_age(now)?;
        Some(now + interval.saturating_sub(age))
    }

    /// Request a local update if a threshold has been crossed.
    ///
    /// # Errors
    ///
    /// Fatal engine errors (`HandshakeNotConfirmed`, `ConnectionClosed`).
    pub fn poll<I: Timestamp>(
        &self,
        engine: &mut KeyPhaseEngine<I>,
        now: I,
    ) -> Result<TriggerOutcome, KeyUpdateError> {
        if !self.is_due(engine, now) {
            return Ok(TriggerOutcome::Idle);
        }

        match engine.initiate_local_update(now) {
            Ok(generation) => {
                debug!(generation, "update threshold crossed");
                Ok(TriggerOutcome::Initiated { generation })
            },
            Err(KeyUpdateError::UpdateInProgress { generation }) => {
                trace!(generation, "update threshold crossed while update in progress");
                Ok(TriggerOutcome::Suppressed)
            },
            Err(err) => Err(err),
        }
    }
}

impl Default for UpdateTrigger {
    fn default() -> Self {
        Self::from_config(&KeyUpdateConfig::default())
    }
}
