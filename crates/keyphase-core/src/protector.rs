//! Sealing outgoing and opening incoming 1-RTT packets.
//!
//! The protector owns no keys. It asks the engine for the write key set or
//! for the candidate read key set, applies the AEAD and header protection,
//! and reports back which generation authenticated a packet.

use keyphase_crypto::{KeyPhase, open_payload, seal_payload};
use tracing::trace;

use crate::{
    cid_registry::ConnectionId,
    engine::{Confirmation, EngineState, KeyPhaseEngine},
    env::Timestamp,
    error::{KeyUpdateError, PacketError},
    packet::{decode_packet_number, encode_short_header, protect_header, unprotect_header},
};

/// A packet that authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedPacket {
    /// Full packet number
    pub packet_number: u64,
    /// Phase bit it carried
    pub phase: KeyPhase,
    /// Remote generation that opened it
    pub generation: u64,
    /// What the engine made of it
    pub confirmation: Confirmation,
    /// Decrypted payload
    pub payload: Vec<u8>,
}

/// Why a packet was silently discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DropReason {
    /// Header could not be parsed or unmasked
    Malformed(PacketError),
    /// 1-RTT keys are not installed yet
    KeysUnavailable,
    /// No key set fits, or none authenticated the packet
    Undecryptable(KeyUpdateError),
}

/// Outcome of [`PacketProtector::open_datagram`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpenOutcome {
    /// The packet authenticated
    Opened(OpenedPacket),
    /// The packet was discarded; the connection is unaffected
    Dropped(DropReason),
}

/// Seals and opens short-header packets with the engine's keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketProtector {
    /// Length of the destination connection IDs on incoming packets
    local_cid_len: usize,
}

impl PacketProtector {
    /// Protector for a connection whose locally issued IDs are
    /// `local_cid_len` bytes long.
    pub fn new(local_cid_len: usize) -> Self {
        Self { local_cid_len }
    }

    /// Seal `plaintext` as packet `packet_number` under the current write
    /// keys, embedding the current local phase bit.
    ///
    /// # Errors
    ///
    /// - `HandshakeNotConfirmed` before the engine is initialized
    /// - `ConnectionClosed` after close
    pub fn seal<I: Timestamp>(
        &self,
        engine: &mut KeyPhaseEngine<I>,
        dcid: &ConnectionId,
        packet_number: u64,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, KeyUpdateError> {
        let keys = engine.write_key_set()?;
        let phase = keys.phase();

        let mut packet = encode_short_header(phase, dcid.as_bytes(), packet_number);
        let ciphertext = seal_payload(keys, packet_number, &packet, plaintext);
        packet.extend_from_slice(&ciphertext);

        let Ok(()) = protect_header(&mut packet, dcid.len(), keys.header_key()) else {
            unreachable!("a sealed payload always covers the header protection sample");
        };

        engine.on_packet_sent(packet_number);
        trace!(packet_number, ?phase, size = packet.len(), "sealed packet");
        Ok(packet)
    }

    /// Open a packet whose header protection is already removed.
    ///
    /// Observes the phase bit, tries the selected key set and, on success,
    /// confirms the generation with the engine (which may complete a peer
    /// update).
    ///
    /// # Errors
    ///
    /// - `NoValidKeySet` / `DecryptionFailed`: drop the packet
    /// - `UpdateTooFrequent`: fatal, the engine is already closed
    pub fn open<I: Timestamp>(
        &self,
        engine: &mut KeyPhaseEngine<I>,
        header: &[u8],
        phase: KeyPhase,
        packet_number: u64,
        ciphertext: &[u8],
        now: I,
    ) -> Result<OpenedPacket, KeyUpdateError> {
        let candidate = engine.select_read_key_set(phase, packet_number)?;
        let generation = candidate.generation();
        let payload = open_payload(candidate.keys(), packet_number, header, ciphertext)
            .map_err(|_| KeyUpdateError::DecryptionFailed { packet_number })?;

        let confirmation = engine.confirm_generation_in_use(generation, packet_number, now)?;
        Ok(OpenedPacket { packet_number, phase, generation, confirmation, payload })
    }

    /// Remove header protection from a datagram and open it.
    ///
    /// `largest_received` is the largest packet number authenticated so far
    /// and anchors packet number reconstruction.
    ///
    /// # Errors
    ///
    /// Only fatal errors; everything else becomes [`OpenOutcome::Dropped`].
    pub fn open_datagram<I: Timestamp>(
        &self,
        engine: &mut KeyPhaseEngine<I>,
        datagram: &[u8],
        largest_received: Option<u64>,
        now: I,
    ) -> Result<OpenOutcome, KeyUpdateError> {
        match engine.state() {
            EngineState::Active => {},
            EngineState::Closed => return Err(KeyUpdateError::ConnectionClosed),
            EngineState::AwaitingHandshake | EngineState::HandshakeConfirmed => {
                return Ok(OpenOutcome::Dropped(DropReason::KeysUnavailable));
            },
        }

        let header_key = engine.remote_header_key()?.clone();
        let mut packet = datagram.to_vec();
        let header = match unprotect_header(&mut packet, self.local_cid_len, &header_key) {
            Ok(header) => header,
            Err(err) => return Ok(OpenOutcome::Dropped(DropReason::Malformed(err))),
        };

        let expected = largest_received.map_or(0, |largest| largest + 1);
        let packet_number = decode_packet_number(
            header.truncated_packet_number,
            (header.packet_number_len * 8) as u32,
            expected,
        );
        let (aad, ciphertext) = packet.split_at(header.header_len);

        match self.open(engine, aad, header.phase, packet_number, ciphertext, now) {
            Ok(opened) => Ok(OpenOutcome::Opened(opened)),
            Err(err) if err.is_fatal() => Err(err),
            Err(err) => {
                trace!(packet_number, %err, "dropped packet");
                Ok(OpenOutcome::Dropped(DropReason::Undecryptable(err)))
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use keyphase_crypto::{Role, derive_traffic_secrets};

    use super::*;

    fn engine(role: Role, now: Instant) -> KeyPhaseEngine<Instant> {
        let mut engine = KeyPhaseEngine::new(Duration::from_secs(3));
        engine.confirm_handshake();
        engine.initialize(derive_traffic_secrets(b"protector", role), now).unwrap();
        engine
    }

    fn cid() -> ConnectionId {
        ConnectionId::new(vec![0xc1; 8]).unwrap()
    }

    #[test]
    fn sealed_packet_opens_at_peer() {
        let now = Instant::now();
        let mut client = engine(Role::Client, now);
        let mut server = engine(Role::Server, now);
        let protector = PacketProtector::new(8);

        let packet = protector.seal(&mut client, &cid(), 0, b"hello").unwrap();
        let outcome = protector.open_datagram(&mut server, &packet, None, now).unwrap();

        let OpenOutcome::Opened(opened) = outcome else {
            panic!("expected packet to open, got {outcome:?}");
        };
        assert_eq!(opened.payload, b"hello");
        assert_eq!(opened.generation, 0);
        assert_eq!(opened.confirmation, Confirmation::Current { generation: 0 });
    }

    #[test]
    fn phase_bit_follows_local_generation() {
        let now = Instant::now();
        let mut client = engine(Role::Client, now);
        let mut server = engine(Role::Server, now);
        let protector = PacketProtector::new(8);

        client.initiate_local_update(now).unwrap();
        let packet = protector.seal(&mut client, &cid(), 0, b"updated").unwrap();
        let outcome = protector.open_datagram(&mut server, &packet, None, now).unwrap();

        let OpenOutcome::Opened(opened) = outcome else {
            panic!("expected packet to open, got {outcome:?}");
        };
        assert_eq!(opened.phase, KeyPhase::One);
        assert_eq!(
            opened.confirmation,
            Confirmation::PeerUpdate { generation: 1, responded: Some(1) }
        );
    }

    #[test]
    fn corrupted_packet_is_dropped_not_fatal() {
        let now = Instant::now();
        let mut client = engine(Role::Client, now);
        let mut server = engine(Role::Server, now);
        let protector = PacketProtector::new(8);

        let mut packet = protector.seal(&mut client, &cid(), 0, b"hello").unwrap();
        let last = packet.len() - 1;
        packet[last] ^= 0x01;

        let outcome = protector.open_datagram(&mut server, &packet, None, now).unwrap();
        assert!(matches!(outcome, OpenOutcome::Dropped(DropReason::Undecryptable(_))));
        assert_eq!(server.state(), EngineState::Active);
        assert_eq!(server.remote_generation(), Some(0));
    }

    #[test]
    fn truncated_datagram_is_malformed() {
        let now = Instant::now();
        let mut server = engine(Role::Server, now);
        let protector = PacketProtector::new(8);

        let outcome = protector.open_datagram(&mut server, &[0x40; 12], None, now).unwrap();
        assert!(matches!(outcome, OpenOutcome::Dropped(DropReason::Malformed(_))));
    }

    #[test]
    fn packets_before_keys_are_dropped() {
        let now = Instant::now();
        let mut client = engine(Role::Client, now);
        let mut pending = KeyPhaseEngine::<Instant>::new(Duration::from_secs(3));
        let protector = PacketProtector::new(8);

        let packet = protector.seal(&mut client, &cid(), 0, b"early").unwrap();
        assert_eq!(
            protector.open_datagram(&mut pending, &packet, None, now),
            Ok(OpenOutcome::Dropped(DropReason::KeysUnavailable))
        );
    }

    #[test]
    fn seal_before_initialize_fails() {
        let mut pending = KeyPhaseEngine::<Instant>::new(Duration::from_secs(3));
        let protector = PacketProtector::new(8);
        assert_eq!(
            protector.seal(&mut pending, &cid(), 0, b"early"),
            Err(KeyUpdateError::HandshakeNotConfirmed)
        );
    }

    #[test]
    fn reconstructs_packet_numbers_past_32_bits() {
        let now = Instant::now();
        let mut client = engine(Role::Client, now);
        let mut server = engine(Role::Server, now);
        let protector = PacketProtector::new(8);

        let packet_number = (1u64 << 32) + 5;
        let packet = protector.seal(&mut client, &cid(), packet_number, b"far").unwrap();
        let outcome =
            protector.open_datagram(&mut server, &packet, Some(packet_number - 1), now).unwrap();

        let OpenOutcome::Opened(opened) = outcome else {
            panic!("expected packet to open, got {outcome:?}");
        };
        assert_eq!(opened.packet_number, packet_number);
    }
}
