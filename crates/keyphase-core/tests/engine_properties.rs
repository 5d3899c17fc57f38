//! Property-based tests for key updates under arbitrary reordering and loss.
//!
//! Random operation sequences drive a client/server pair through sends,
//! out-of-order deliveries, drops, explicit update requests and time
//! advances. Whatever the schedule, a well-behaved pair must never close
//! and the generations must stay within one of each other.

mod common;

use std::time::Duration;

use common::{TestEnv, ack_payload, connected_pair, delivered, parse_ack, transmitted};
use keyphase_core::{Endpoint, EndpointAction, KeyUpdateConfig, KeyUpdateError};
use proptest::prelude::*;
use tokio::time::Instant;

#[derive(Debug, Clone)]
enum Op {
    Send { from_client: bool },
    Deliver { to_client: bool, index: usize },
    Lose { to_client: bool, index: usize },
    RequestUpdate { client: bool },
    Advance { millis: u64 },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => any::<bool>().prop_map(|from_client| Op::Send { from_client }),
        4 => (any::<bool>(), any::<usize>())
            .prop_map(|(to_client, index)| Op::Deliver { to_client, index }),
        1 => (any::<bool>(), any::<usize>())
            .prop_map(|(to_client, index)| Op::Lose { to_client, index }),
        2 => any::<bool>().prop_map(|client| Op::RequestUpdate { client }),
        1 => (1u64..2_000).prop_map(|millis| Op::Advance { millis }),
    ]
}

struct Side {
    endpoint: Endpoint<Instant>,
    largest: Option<u64>,
    /// Datagrams on their way to this side
    inbound: Vec<Vec<u8>>,
    local_generation: u64,
    remote_generation: u64,
}

impl Side {
    fn new(endpoint: Endpoint<Instant>) -> Self {
        Self { endpoint, largest: None, inbound: Vec::new(), local_generation: 0, remote_generation: 0 }
    }

    fn receive(&mut self, datagram: &[u8], now: Instant) -> Result<(), TestCaseError> {
        let actions = self.endpoint.recv(datagram, now);
        prop_assert!(
            !actions.iter().any(|a| matches!(a, EndpointAction::Close { .. })),
            "closed: {:?}",
            actions
        );
        for (packet_number, payload) in delivered(&actions) {
            self.largest = Some(self.largest.map_or(packet_number, |l| l.max(packet_number)));
            if let Some(acked) = parse_ack(&payload) {
                self.endpoint.on_ack(acked);
            }
        }
        Ok(())
    }

    fn check_monotonic(&mut self) -> Result<(), TestCaseError> {
        let local = self.endpoint.engine().local_generation().unwrap_or(0);
        let remote = self.endpoint.engine().remote_generation().unwrap_or(0);
        prop_assert!(local >= self.local_generation, "local generation went backwards");
        prop_assert!(remote >= self.remote_generation, "remote generation went backwards");
        self.local_generation = local;
        self.remote_generation = remote;
        Ok(())
    }
}

fn run(ops: &[Op], config: &KeyUpdateConfig) -> Result<(Side, Side), TestCaseError> {
    let env = TestEnv::default();
    let mut now = Instant::now();
    let (client, server) = connected_pair(config, &env, now);
    let mut client = Side::new(client);
    let mut server = Side::new(server);

    for op in ops {
        match *op {
            Op::Send { from_client } => {
                let (from, to) =
                    if from_client { (&mut client, &mut server) } else { (&mut server, &mut client) };
                let datagram = transmitted(&from.endpoint.send(&ack_payload(from.largest), now));
                to.inbound.push(datagram);
            },
            Op::Deliver { to_client, index } => {
                let to = if to_client { &mut client } else { &mut server };
                if !to.inbound.is_empty() {
                    let datagram = to.inbound.remove(index % to.inbound.len());
                    to.receive(&datagram, now)?;
                }
            },
            Op::Lose { to_client, index } => {
                let to = if to_client { &mut client } else { &mut server };
                if !to.inbound.is_empty() {
                    let len = to.inbound.len();
                    to.inbound.remove(index % len);
                }
            },
            Op::RequestUpdate { client: is_client } => {
                let side = if is_client { &mut client } else { &mut server };
                match side.endpoint.request_key_update(now) {
                    Ok(_) | Err(KeyUpdateError::UpdateInProgress { .. }) => {},
                    Err(err) => prop_assert!(false, "unexpected error {err}"),
                }
            },
            Op::Advance { millis } => {
                now += Duration::from_millis(millis);
                client.endpoint.on_timeout(now);
                server.endpoint.on_timeout(now);
            },
        }

        client.check_monotonic()?;
        server.check_monotonic()?;

        // A direction only advances on authenticated packets from the peer,
        // and the peer only moves again once that has happened.
        for (sender, receiver) in [(&client, &server), (&server, &client)] {
            prop_assert!(sender.local_generation >= receiver.remote_generation);
            prop_assert!(sender.local_generation - receiver.remote_generation <= 1);
        }
    }

    Ok((client, server))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn prop_reordering_and_loss_never_close(ops in prop::collection::vec(op_strategy(), 1..300)) {
        let (client, server) = run(&ops, &KeyUpdateConfig::default())?;
        prop_assert!(!client.endpoint.is_closed());
        prop_assert!(!server.endpoint.is_closed());
    }

    #[test]
    fn prop_aggressive_trigger_stays_in_lockstep(
        ops in prop::collection::vec(op_strategy(), 1..300)
    ) {
        let (client, server) = run(&ops, &KeyUpdateConfig::every_packet())?;
        prop_assert!(!client.endpoint.is_closed());
        prop_assert!(!server.endpoint.is_closed());
    }

    #[test]
    fn prop_retained_generation_is_previous(ops in prop::collection::vec(op_strategy(), 1..200)) {
        let (client, server) = run(&ops, &KeyUpdateConfig::every_packet())?;
        for side in [&client, &server] {
            let engine = side.endpoint.engine();
            if let (Some(retained), Some(current)) =
                (engine.retained_remote_generation(), engine.remote_generation())
            {
                prop_assert_eq!(retained + 1, current);
            }
        }
    }
}
