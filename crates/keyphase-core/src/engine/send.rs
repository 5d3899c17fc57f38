//! Local (write) direction.

use keyphase_crypto::{Direction, KeySet, TrafficSecret, derive_initial_key_set};

use super::keys::{Generations, Ratchet, Retention};
use crate::env::Timestamp;

/// Write keys plus the bookkeeping needed to confirm a local update.
#[derive(Debug)]
pub(crate) struct SendKeys<I> {
    keys: Generations<I>,
    ratchet: Option<Ratchet>,
    /// First packet number sent under the current generation
    first_sent: Option<u64>,
    sent_in_generation: u64,
    generation_started: Option<I>,
}

impl<I: Timestamp> SendKeys<I> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Generations::Unset,
            ratchet: None,
            first_sent: None,
            sent_in_generation: 0,
            generation_started: None,
        }
    }

    pub(crate) fn install(&mut self, secret: TrafficSecret, now: I) {
        let keys = derive_initial_key_set(&secret, Direction::Local);
        self.keys = Generations::Single(keys);
        self.ratchet = Some(Ratchet::new(secret));
        self.generation_started = Some(now);
    }

    pub(crate) fn current(&self) -> Option<&KeySet> {
        self.keys.current()
    }

    pub(crate) fn generation(&self) -> Option<u64> {
        self.current().map(KeySet::generation)
    }

    /// A local update has been made but no packet sent under it has been
    /// acknowledged yet.
    pub(crate) fn update_pending(&self) -> bool {
        matches!(self.keys.retention(), Some(Retention::UntilConfirmed))
    }

    pub(crate) fn sent_in_generation(&self) -> u64 {
        self.sent_in_generation
    }

    pub(crate) fn generation_started(&self) -> Option<I> {
        self.generation_started
    }

    /// Switch to the next write generation, keeping the superseded one until
    /// the switch is acknowledged. Returns the new generation.
    pub(crate) fn roll(&mut self, now: I) -> Option<u64> {
        let current = self.keys.current()?;
        let ratchet = self.ratchet.as_mut()?;
        let next = ratchet.advance(current);
        let generation = next.generation();

        self.keys.advance(next, Retention::UntilConfirmed);
        self.first_sent = None;
        self.sent_in_generation = 0;
        self.generation_started = Some(now);
        Some(generation)
    }

    pub(crate) fn on_packet_sent(&mut self, packet_number: u64) {
        self.first_sent.get_or_insert(packet_number);
        self.sent_in_generation += 1;
    }

    /// Confirm a pending update if `largest_acked` covers a packet sent
    /// under the current generation. Returns the generation confirmed and the
    /// superseded generation that was dropped.
    pub(crate) fn on_ack(&mut self, largest_acked: u64) -> Option<(u64, u64)> {
        if !self.update_pending() {
            return None;
        }
        let first_sent = self.first_sent?;
        if largest_acked < first_sent {
            return None;
        }
        let dropped = self.keys.drop_previous()?;
        Some((self.generation()?, dropped))
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }
}
