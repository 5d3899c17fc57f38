//! Per-packet observation hooks.
//!
//! Endpoints report every packet they send or accept to a [`PacketTracer`].
//! Tests use this to count key phase transitions on the wire; production
//! uses [`LogTracer`].

use keyphase_crypto::KeyPhase;
use tracing::trace;

pub use crate::packet::HeaderForm;

/// What a tracer learns about one packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// Long (handshake) or short (1-RTT) header
    pub header_form: HeaderForm,
    /// Key phase bit; `None` for long headers, which carry none
    pub key_phase: Option<KeyPhase>,
    /// Full packet number
    pub packet_number: u64,
    /// Datagram size in bytes
    pub size: usize,
}

/// Observer of sent and received packets.
pub trait PacketTracer: Send {
    /// A packet left this endpoint.
    fn sent_packet(&mut self, info: &PacketInfo);

    /// A packet was authenticated by this endpoint.
    fn received_packet(&mut self, info: &PacketInfo);
}

/// Tracer that emits a `trace`-level event per packet.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogTracer;

impl PacketTracer for LogTracer {
    fn sent_packet(&mut self, info: &PacketInfo) {
        trace!(
            packet_number = info.packet_number,
            key_phase = ?info.key_phase,
            size = info.size,
            "sent packet"
        );
    }

    fn received_packet(&mut self, info: &PacketInfo) {
        trace!(
            packet_number = info.packet_number,
            key_phase = ?info.key_phase,
            size = info.size,
            "received packet"
        );
    }
}

/// Count key phase transitions in a sequence of traced packets.
///
/// The count starts from phase `One`, so a stream whose first short-header
/// packet uses phase `Zero` already counts one transition. Long-header
/// packets are skipped.
pub fn count_key_phase_transitions<'a>(packets: impl IntoIterator<Item = &'a PacketInfo>) -> usize {
    let mut last = KeyPhase::One;
    let mut transitions = 0;
    for phase in packets.into_iter().filter_map(|info| info.key_phase) {
        if phase != last {
            transitions += 1;
            last = phase;
        }
    }
    transitions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn short(phase: KeyPhase) -> PacketInfo {
        PacketInfo { header_form: HeaderForm::Short, key_phase: Some(phase), packet_number: 0, size: 40 }
    }

    fn long() -> PacketInfo {
        PacketInfo { header_form: HeaderForm::Long, key_phase: None, packet_number: 0, size: 1200 }
    }

    #[test]
    fn counts_from_phase_one() {
        let packets = [long(), short(KeyPhase::Zero), short(KeyPhase::Zero), short(KeyPhase::One)];
        assert_eq!(count_key_phase_transitions(&packets), 2);
    }

    #[test]
    fn long_headers_do_not_count() {
        let packets = [short(KeyPhase::One), long(), short(KeyPhase::One)];
        assert_eq!(count_key_phase_transitions(&packets), 0);
    }

    #[test]
    fn empty_stream_has_no_transitions() {
        assert_eq!(count_key_phase_transitions(std::iter::empty::<&PacketInfo>()), 0);
    }
}
