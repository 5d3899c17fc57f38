//! Fuzz target for the key-phase engine and packet protector
//!
//! Drive two engines through arbitrary seal/deliver/tamper/update/ack/time
//! sequences (HIGH priority)
//!
//! # Strategy
//!
//! - Reordering: deliver any in-flight packet, any number of times
//! - Tampering: flip arbitrary bits, including the protected key phase bit
//! - Injection: arbitrary bytes presented as a short-header packet
//! - Updates: local update requests at arbitrary moments
//! - Time: arbitrary jumps across the retention period
//!
//! # Invariants
//!
//! - NEVER panic
//! - Tampered, replayed or injected packets never close an engine
//! - Generations never decrease
//! - A sender is never more than one generation ahead of its receiver

#![no_main]

use std::time::{Duration, Instant};

use arbitrary::Arbitrary;
use keyphase_core::{ConnectionId, KeyPhaseEngine, KeyUpdateError, OpenOutcome, PacketProtector};
use keyphase_crypto::{derive_traffic_secrets, Role};
use libfuzzer_sys::fuzz_target;

const CID_LEN: usize = 8;

#[derive(Debug, Clone, Arbitrary)]
enum Op {
    Seal { from_client: bool, payload: Vec<u8> },
    Deliver { to_client: bool, index: u8, keep: bool },
    Tamper { to_client: bool, index: u8, offset: u16, xor: u8 },
    Inject { to_client: bool, bytes: Vec<u8> },
    Update { client: bool },
    Ack { client: bool },
    Advance { millis: u16 },
}

struct Side {
    engine: KeyPhaseEngine<Instant>,
    next_packet_number: u64,
    largest_received: Option<u64>,
    /// Packets on their way to this side, each with the acknowledgment it
    /// carries
    inbound: Vec<(Vec<u8>, Option<u64>)>,
    /// Largest of our packet numbers the peer acknowledged
    acked: Option<u64>,
    generations: (u64, u64),
}

impl Side {
    fn new(role: Role, now: Instant) -> Self {
        let mut engine = KeyPhaseEngine::new(Duration::from_secs(3));
        engine.confirm_handshake();
        engine
            .initialize(derive_traffic_secrets(b"fuzz handshake", role), now)
            .expect("fresh engine initializes");
        Self {
            engine,
            next_packet_number: 0,
            largest_received: None,
            inbound: Vec::new(),
            acked: None,
            generations: (0, 0),
        }
    }

    fn check_monotonic(&mut self) {
        let current = (
            self.engine.local_generation().unwrap_or(0),
            self.engine.remote_generation().unwrap_or(0),
        );
        assert!(current.0 >= self.generations.0, "local generation decreased");
        assert!(current.1 >= self.generations.1, "remote generation decreased");
        self.generations = current;
    }
}

fuzz_target!(|ops: Vec<Op>| {
    let mut now = Instant::now();
    let protector = PacketProtector::new(CID_LEN);
    let cid = ConnectionId::new(vec![0xc1; CID_LEN]).expect("valid length");
    let mut client = Side::new(Role::Client, now);
    let mut server = Side::new(Role::Server, now);

    for op in ops {
        match op {
            Op::Seal { from_client, payload } => {
                let (from, to) =
                    if from_client { (&mut client, &mut server) } else { (&mut server, &mut client) };
                let packet_number = from.next_packet_number;
                let packet = protector
                    .seal(&mut from.engine, &cid, packet_number, &payload)
                    .expect("active engine seals");
                from.next_packet_number += 1;
                to.inbound.push((packet, from.largest_received));
            },
            Op::Deliver { to_client, index, keep } => {
                let to = if to_client { &mut client } else { &mut server };
                if to.inbound.is_empty() {
                    continue;
                }
                let index = usize::from(index) % to.inbound.len();
                let (packet, ack) =
                    if keep { to.inbound[index].clone() } else { to.inbound.remove(index) };
                let outcome = protector
                    .open_datagram(&mut to.engine, &packet, to.largest_received, now)
                    .expect("genuine packets are never fatal");
                if let OpenOutcome::Opened(opened) = outcome {
                    to.largest_received = Some(
                        to.largest_received.map_or(opened.packet_number, |l| l.max(opened.packet_number)),
                    );
                    if let Some(ack) = ack {
                        to.acked = Some(to.acked.map_or(ack, |l| l.max(ack)));
                    }
                }
            },
            Op::Tamper { to_client, index, offset, xor } => {
                let to = if to_client { &mut client } else { &mut server };
                if to.inbound.is_empty() || xor == 0 {
                    continue;
                }
                let mut packet = to.inbound[usize::from(index) % to.inbound.len()].0.clone();
                let offset = usize::from(offset) % packet.len();
                packet[offset] ^= xor;
                let result = protector.open_datagram(&mut to.engine, &packet, to.largest_received, now);
                assert!(
                    matches!(result, Ok(OpenOutcome::Dropped(_))),
                    "tampered packet was not dropped: {result:?}"
                );
            },
            Op::Inject { to_client, bytes } => {
                let to = if to_client { &mut client } else { &mut server };
                let result = protector.open_datagram(&mut to.engine, &bytes, to.largest_received, now);
                assert!(result.is_ok(), "injected bytes were fatal: {result:?}");
            },
            Op::Update { client: is_client } => {
                let side = if is_client { &mut client } else { &mut server };
                match side.engine.initiate_local_update(now) {
                    Ok(_) | Err(KeyUpdateError::UpdateInProgress { .. }) => {},
                    Err(err) => panic!("unexpected update error: {err}"),
                }
            },
            Op::Ack { client: is_client } => {
                let side = if is_client { &mut client } else { &mut server };
                if let Some(largest) = side.acked {
                    side.engine.on_ack_received(largest);
                }
            },
            Op::Advance { millis } => {
                now += Duration::from_millis(u64::from(millis));
                client.engine.discard_expired(now);
                server.engine.discard_expired(now);
            },
        }

        client.check_monotonic();
        server.check_monotonic();
        for (sender, receiver) in [(&client, &server), (&server, &client)] {
            assert!(sender.generations.0 >= receiver.generations.1);
            assert!(sender.generations.0 - receiver.generations.1 <= 1);
        }
    }
});
