//! Per-generation packet protection material.
//!
//! # Security Properties
//!
//! - Immutability: a [`KeySet`] cannot be modified after construction
//! - Disposal: packet keys, IVs and header keys are zeroized on drop
//! - Redaction: `Debug` prints generation and direction, never key bytes

use std::fmt;

use zeroize::Zeroize;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// AEAD nonce / IV length
pub const IV_LEN: usize = 12;

/// Single bit in the short header selecting between two key generations.
///
/// Not a counter: it only separates "current" from "the other" generation.
/// The true order is the generation number, whose parity is the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPhase {
    /// Bit cleared (even generations)
    Zero,
    /// Bit set (odd generations)
    One,
}

impl KeyPhase {
    /// Phase carried by a header bit.
    pub fn from_bit(bit: bool) -> Self {
        if bit { Self::One } else { Self::Zero }
    }

    /// Header bit for this phase.
    pub fn bit(self) -> bool {
        matches!(self, Self::One)
    }

    /// Phase used by packets protected with `generation`.
    pub fn for_generation(generation: u64) -> Self {
        Self::from_bit(generation & 1 == 1)
    }
}

/// Direction a key set protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Packets this endpoint sends (write keys)
    Local,
    /// Packets the peer sends (read keys)
    Remote,
}

/// Header protection key.
///
/// Derived once from the generation-0 secret and shared by every later
/// generation of the same direction, since the header must be unmasked
/// before the key phase is known.
#[derive(Clone, PartialEq, Eq)]
pub struct HeaderKey {
    key: [u8; KEY_LEN],
}

impl HeaderKey {
    /// Wrap raw header protection key bytes.
    pub fn new(key: [u8; KEY_LEN]) -> Self {
        Self { key }
    }

    /// Raw key bytes.
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.key
    }
}

impl fmt::Debug for HeaderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("HeaderKey(..)")
    }
}

impl Drop for HeaderKey {
    fn drop(&mut self) {
        self.key.zeroize();
    }
}

/// Immutable bundle of protection material for one (direction, generation).
///
/// For [`Direction::Local`] the packet key is a write key, for
/// [`Direction::Remote`] a read key. Exactly one `KeySet` exists per
/// (direction, generation) pair.
pub struct KeySet {
    direction: Direction,
    generation: u64,
    packet_key: [u8; KEY_LEN],
    iv: [u8; IV_LEN],
    header_key: HeaderKey,
}

impl KeySet {
    /// Assemble a key set from already-derived material.
    pub fn new(
        direction: Direction,
        generation: u64,
        packet_key: [u8; KEY_LEN],
        iv: [u8; IV_LEN],
        header_key: HeaderKey,
    ) -> Self {
        Self { direction, generation, packet_key, iv, header_key }
    }

    /// Direction this key set protects.
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Generation number (0 for the handshake-provided secret).
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Key phase bit carried by packets protected with this key set.
    pub fn phase(&self) -> KeyPhase {
        KeyPhase::for_generation(self.generation)
    }

    /// AEAD packet key.
    pub fn packet_key(&self) -> &[u8; KEY_LEN] {
        &self.packet_key
    }

    /// AEAD initialization vector.
    pub fn iv(&self) -> &[u8; IV_LEN] {
        &self.iv
    }

    /// Header protection key.
    pub fn header_key(&self) -> &HeaderKey {
        &self.header_key
    }

    /// Per-packet nonce: the IV XORed with the left-padded packet number.
    pub fn nonce(&self, packet_number: u64) -> [u8; IV_LEN] {
        let mut nonce = self.iv;
        let pn = packet_number.to_be_bytes();
        for (byte, pn_byte) in nonce[IV_LEN - 8..].iter_mut().zip(pn) {
            *byte ^= pn_byte;
        }
        nonce
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeySet")
            .field("direction", &self.direction)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

impl Drop for KeySet {
    fn drop(&mut self) {
        self.packet_key.zeroize();
        self.iv.zeroize();
    }
}
