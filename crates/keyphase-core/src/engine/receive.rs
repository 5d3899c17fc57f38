//! Remote (read) direction.

use keyphase_crypto::{Direction, KeyPhase, KeySet, TrafficSecret, derive_initial_key_set};

use super::keys::{Generations, Ratchet, Retention};
use crate::env::Timestamp;

/// How a packet's key phase bit relates to the remote key generations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseObservation {
    /// Bit matches the current remote generation
    Current {
        /// Current remote generation
        generation: u64,
    },
    /// Bit matches the retained previous generation and the packet predates
    /// the switch
    Reordered {
        /// Retained previous generation
        generation: u64,
    },
    /// Bit differs and the packet is newer than anything under the current
    /// generation: the peer may have updated
    PeerUpdate {
        /// Candidate next generation
        generation: u64,
    },
    /// Bit differs but the packet fits neither the previous nor the next
    /// generation (for example, the previous one was already discarded)
    Unmatched,
}

/// Read keys plus the packet-number bounds used to classify phase bits.
#[derive(Debug)]
pub(crate) struct ReceiveKeys<I> {
    keys: Generations<I>,
    ratchet: Option<Ratchet>,
    /// Lowest packet number authenticated under the current generation
    lowest: Option<u64>,
    /// Highest packet number authenticated under the current generation
    highest: Option<u64>,
    received_in_generation: u64,
}

impl<I: Timestamp> ReceiveKeys<I> {
    pub(crate) fn new() -> Self {
        Self {
            keys: Generations::Unset,
            ratchet: None,
            lowest: None,
            highest: None,
            received_in_generation: 0,
        }
    }

    pub(crate) fn install(&mut self, secret: TrafficSecret) {
        let keys = derive_initial_key_set(&secret, Direction::Remote);
        self.keys = Generations::Single(keys);
        self.ratchet = Some(Ratchet::new(secret));
    }

    pub(crate) fn current(&self) -> Option<&KeySet> {
        self.keys.current()
    }

    pub(crate) fn previous(&self) -> Option<&KeySet> {
        self.keys.previous()
    }

    pub(crate) fn generation(&self) -> Option<u64> {
        self.current().map(KeySet::generation)
    }

    pub(crate) fn received_in_generation(&self) -> u64 {
        self.received_in_generation
    }

    pub(crate) fn deadline(&self) -> Option<I> {
        self.keys.deadline()
    }

    pub(crate) fn expire(&mut self, now: I) -> Option<u64> {
        self.keys.expire(now)
    }

    /// Classify a phase bit without changing any state.
    pub(crate) fn classify(&self, phase: KeyPhase, packet_number: u64) -> PhaseObservation {
        let Some(current) = self.current() else {
            return PhaseObservation::Unmatched;
        };
        if phase == current.phase() {
            return PhaseObservation::Current { generation: current.generation() };
        }

        // Every packet of the previous generation was sent before every
        // packet of the current one, and likewise for the next generation.
        let predates_current = self.lowest.is_some_and(|lowest| packet_number < lowest);
        let follows_current = self.highest.is_none_or(|highest| packet_number > highest);

        match self.previous() {
            Some(previous) if predates_current => {
                PhaseObservation::Reordered { generation: previous.generation() }
            },
            _ if follows_current => {
                PhaseObservation::PeerUpdate { generation: current.generation() + 1 }
            },
            _ => PhaseObservation::Unmatched,
        }
    }

    /// Next generation's keys, derived on first request.
    pub(crate) fn prime_next(&mut self) -> Option<&KeySet> {
        let current = self.keys.current()?;
        let ratchet = self.ratchet.as_mut()?;
        Some(ratchet.peek(current))
    }

    pub(crate) fn next_is_primed(&self) -> bool {
        self.ratchet.as_ref().is_some_and(Ratchet::is_primed)
    }

    /// Record an authenticated packet under the current generation.
    pub(crate) fn on_current_packet(&mut self, packet_number: u64) {
        self.lowest = Some(self.lowest.map_or(packet_number, |lowest| lowest.min(packet_number)));
        self.highest =
            Some(self.highest.map_or(packet_number, |highest| highest.max(packet_number)));
        self.received_in_generation += 1;
    }

    /// Make the next generation current after `packet_number` authenticated
    /// under it. The superseded generation is retained until `deadline`.
    pub(crate) fn promote(&mut self, packet_number: u64, deadline: I) -> Option<u64> {
        let current = self.keys.current()?;
        let ratchet = self.ratchet.as_mut()?;
        let next = ratchet.advance(current);
        let generation = next.generation();

        self.keys.advance(next, Retention::Until(deadline));
        self.lowest = Some(packet_number);
        self.highest = Some(packet_number);
        self.received_in_generation = 1;
        Some(generation)
    }

    pub(crate) fn clear(&mut self) {
        *self = Self::new();
    }
}
