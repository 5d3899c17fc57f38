//! Short-header packet layout and header protection.
//!
//! ```text
//! ┌───────────┬──────────────────┬──────────────────┬──────────────────────┐
//! │ first (1) │ dest conn ID (n) │ packet number (4)│ ciphertext + tag     │
//! └───────────┴──────────────────┴──────────────────┴──────────────────────┘
//! first byte: 0 1 S R R K P P   (form, fixed, spin, reserved, key phase,
//!                                packet number length - 1)
//! ```
//!
//! The low five bits of the first byte and the packet number are masked with
//! bytes derived from a ciphertext sample, so the key phase bit is only
//! visible after [`unprotect_header`].

use keyphase_crypto::{HeaderKey, KeyPhase, SAMPLE_LEN, header_protection_mask};

use crate::error::PacketError;

/// Set for long-header (handshake) packets.
pub const LONG_HEADER_BIT: u8 = 0x80;

/// Must be set in every QUIC v1 packet.
pub const FIXED_BIT: u8 = 0x40;

/// Key phase bit of the short-header first byte.
pub const KEY_PHASE_BIT: u8 = 0x04;

/// Low bits encoding `packet number length - 1`.
pub const PACKET_NUMBER_LENGTH_MASK: u8 = 0x03;

/// Bits of the first byte covered by header protection.
const SHORT_HEADER_PROTECTED_BITS: u8 = 0x1f;

/// Packet numbers are always written as 4 bytes.
pub const PACKET_NUMBER_LEN: usize = 4;

/// Header form, readable without removing protection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderForm {
    /// Handshake packets
    Long,
    /// 1-RTT packets
    Short,
}

impl HeaderForm {
    /// Form encoded in a first byte.
    pub fn of(first_byte: u8) -> Self {
        if first_byte & LONG_HEADER_BIT == 0 { Self::Short } else { Self::Long }
    }
}

/// Build an unprotected short header.
pub fn encode_short_header(phase: KeyPhase, dcid: &[u8], packet_number: u64) -> Vec<u8> {
    let mut first = FIXED_BIT | (PACKET_NUMBER_LEN as u8 - 1);
    if phase.bit() {
        first |= KEY_PHASE_BIT;
    }

    let mut header = Vec::with_capacity(1 + dcid.len() + PACKET_NUMBER_LEN);
    header.push(first);
    header.extend_from_slice(dcid);
    header.extend_from_slice(&(packet_number as u32).to_be_bytes());
    header
}

/// Smallest protected packet for a given connection ID length: header,
/// 4-byte packet number and a full sample.
pub fn min_packet_len(dcid_len: usize) -> usize {
    1 + dcid_len + PACKET_NUMBER_LEN + SAMPLE_LEN
}

fn sample_at(packet: &[u8], pn_offset: usize) -> Result<[u8; SAMPLE_LEN], PacketError> {
    let start = pn_offset + PACKET_NUMBER_LEN;
    packet
        .get(start..start + SAMPLE_LEN)
        .and_then(|bytes| <[u8; SAMPLE_LEN]>::try_from(bytes).ok())
        .ok_or(PacketError::TooShort {
            minimum: start + SAMPLE_LEN,
            actual: packet.len(),
        })
}

/// Apply header protection in place to a sealed short-header packet.
pub fn protect_header(
    packet: &mut [u8],
    dcid_len: usize,
    key: &HeaderKey,
) -> Result<(), PacketError> {
    let pn_offset = 1 + dcid_len;
    let sample = sample_at(packet, pn_offset)?;
    let mask = header_protection_mask(key, &sample);

    let pn_len = usize::from(packet[0] & PACKET_NUMBER_LENGTH_MASK) + 1;
    packet[0] ^= mask[0] & SHORT_HEADER_PROTECTED_BITS;
    for (byte, mask_byte) in packet[pn_offset..pn_offset + pn_len].iter_mut().zip(&mask[1..]) {
        *byte ^= mask_byte;
    }
    Ok(())
}

/// Short header after protection removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnprotectedHeader {
    /// Key phase bit
    pub phase: KeyPhase,
    /// Truncated packet number as sent
    pub truncated_packet_number: u64,
    /// Packet number length in bytes
    pub packet_number_len: usize,
    /// Length of the header including the packet number (the AEAD
    /// associated data)
    pub header_len: usize,
}

/// Remove header protection in place.
///
/// On success `packet[..header_len]` is the plaintext header.
pub fn unprotect_header(
    packet: &mut [u8],
    dcid_len: usize,
    key: &HeaderKey,
) -> Result<UnprotectedHeader, PacketError> {
    let minimum = min_packet_len(dcid_len);
    if packet.len() < minimum {
        return Err(PacketError::TooShort { minimum, actual: packet.len() });
    }
    if HeaderForm::of(packet[0]) == HeaderForm::Long {
        return Err(PacketError::LongHeader);
    }

    let pn_offset = 1 + dcid_len;
    let sample = sample_at(packet, pn_offset)?;
    let mask = header_protection_mask(key, &sample);

    packet[0] ^= mask[0] & SHORT_HEADER_PROTECTED_BITS;
    let first = packet[0];
    if first & FIXED_BIT == 0 {
        return Err(PacketError::FixedBitClear { first_byte: first });
    }

    let packet_number_len = usize::from(first & PACKET_NUMBER_LENGTH_MASK) + 1;
    let mut truncated = 0u64;
    for (byte, mask_byte) in
        packet[pn_offset..pn_offset + packet_number_len].iter_mut().zip(&mask[1..])
    {
        *byte ^= mask_byte;
        truncated = (truncated << 8) | u64::from(*byte);
    }

    Ok(UnprotectedHeader {
        phase: KeyPhase::from_bit(first & KEY_PHASE_BIT != 0),
        truncated_packet_number: truncated,
        packet_number_len,
        header_len: pn_offset + packet_number_len,
    })
}

/// Reconstruct a full packet number from its truncated encoding.
///
/// Picks the candidate closest to `expected` (largest received + 1) within a
/// window of `2^pn_nbits`.
pub fn decode_packet_number(truncated: u64, pn_nbits: u32, expected: u64) -> u64 {
    let pn_win = 1u64 << pn_nbits;
    let pn_hwin = pn_win / 2;
    let pn_mask = pn_win - 1;

    let candidate = (expected & !pn_mask) | truncated;
    if candidate + pn_hwin <= expected && candidate < (1u64 << 62) - pn_win {
        candidate + pn_win
    } else if candidate > expected + pn_hwin && candidate >= pn_win {
        candidate - pn_win
    } else {
        candidate
    }
}

/// Destination connection ID of a short-header packet, readable without
/// keys.
pub fn destination_connection_id(packet: &[u8], dcid_len: usize) -> Option<&[u8]> {
    packet.get(1..1 + dcid_len)
}
