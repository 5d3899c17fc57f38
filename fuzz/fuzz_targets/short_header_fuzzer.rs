//! Fuzz target for short-header parsing and packet opening
//!
//! Feed arbitrary datagrams to an active engine (HIGH priority)
//!
//! # Strategy
//!
//! - Random bytes: completely arbitrary datagrams of any length
//! - Anchors: arbitrary largest-received packet numbers
//! - Truncation: datagrams shorter than header plus sample
//!
//! # Invariants
//!
//! - NEVER panic
//! - Arbitrary bytes are dropped, never fatal
//! - Engine state unchanged by anything that fails to authenticate

#![no_main]

use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use keyphase_core::{
    packet::{decode_packet_number, destination_connection_id},
    EngineState, KeyPhaseEngine, OpenOutcome, PacketProtector,
};
use keyphase_crypto::{derive_traffic_secrets, Role};
use libfuzzer_sys::fuzz_target;

/// Packet numbers are bounded by the protocol to 62 bits
const MAX_PACKET_NUMBER: u64 = (1 << 62) - 1;

#[derive(Debug, Clone, Arbitrary)]
struct Input {
    cid_len: u8,
    largest_received: Option<u64>,
    datagram: Vec<u8>,
}

fuzz_target!(|input: Input| {
    let now = Instant::now();
    let cid_len = usize::from(input.cid_len % 21);
    let largest_received = input.largest_received.map(|pn| pn % MAX_PACKET_NUMBER);

    let mut engine = KeyPhaseEngine::new(Duration::from_secs(3));
    engine.confirm_handshake();
    engine
        .initialize(derive_traffic_secrets(b"fuzz handshake", Role::Server), now)
        .expect("fresh engine initializes");

    let _ = destination_connection_id(&input.datagram, cid_len);
    if let Some(largest) = largest_received {
        let decoded = decode_packet_number(u64::from(input.cid_len), 32, largest + 1);
        assert!(decoded <= largest + 1 + (1 << 31));
    }

    let protector = PacketProtector::new(cid_len);
    let outcome = protector
        .open_datagram(&mut engine, &input.datagram, largest_received, now)
        .expect("arbitrary bytes are never fatal");

    assert!(matches!(outcome, OpenOutcome::Dropped(_)), "forged packet opened");
    assert_eq!(engine.state(), EngineState::Active);
    assert_eq!(engine.local_generation(), Some(0));
    assert_eq!(engine.remote_generation(), Some(0));
});
