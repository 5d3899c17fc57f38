//! Packet tracer that keeps everything it sees.

use std::sync::{Arc, Mutex, PoisonError};

use keyphase_core::{PacketInfo, PacketTracer, count_key_phase_transitions};

#[derive(Debug, Default)]
struct Recorded {
    sent: Vec<PacketInfo>,
    received: Vec<PacketInfo>,
}

/// Records sent and received packets for later inspection.
///
/// Clones share the recording, so one clone can be installed in an endpoint
/// while another is read by the simulation.
#[derive(Debug, Clone, Default)]
pub struct RecordingTracer {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingTracer {
    /// Create an empty recording.
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, f: impl FnOnce(&Recorded) -> R) -> R {
        f(&self.inner.lock().unwrap_or_else(PoisonError::into_inner))
    }

    /// Packets sent so far.
    pub fn sent(&self) -> Vec<PacketInfo> {
        self.with(|r| r.sent.clone())
    }

    /// Packets received so far.
    pub fn received(&self) -> Vec<PacketInfo> {
        self.with(|r| r.received.clone())
    }

    /// Key phase transitions among sent packets.
    pub fn sent_transitions(&self) -> usize {
        self.with(|r| count_key_phase_transitions(&r.sent))
    }

    /// Key phase transitions among received packets.
    pub fn received_transitions(&self) -> usize {
        self.with(|r| count_key_phase_transitions(&r.received))
    }
}

impl PacketTracer for RecordingTracer {
    fn sent_packet(&mut self, info: &PacketInfo) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).sent.push(*info);
    }

    fn received_packet(&mut self, info: &PacketInfo) {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).received.push(*info);
    }
}
