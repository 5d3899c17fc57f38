//! Shared fixtures for keyphase-core integration tests.

#![allow(dead_code)]

use std::{
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use keyphase_core::{
    Endpoint, EndpointAction, Environment, KeyUpdateConfig, Role,
};
use keyphase_crypto::derive_traffic_secrets;
use tokio::time::Instant;

/// Deterministic environment on tokio's (pausable) clock.
#[derive(Clone, Default)]
pub struct TestEnv {
    counter: Arc<AtomicU64>,
}

impl Environment for TestEnv {
    type Instant = Instant;

    fn now(&self) -> Instant {
        Instant::now()
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }

    fn random_bytes(&self, buffer: &mut [u8]) {
        for chunk in buffer.chunks_mut(8) {
            let value = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_mul(0x9e37_79b9_7f4a_7c15);
            let bytes = value.to_be_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }
}

/// Client and server endpoints with a completed handshake.
pub fn connected_pair(
    config: &KeyUpdateConfig,
    env: &TestEnv,
    now: Instant,
) -> (Endpoint<Instant>, Endpoint<Instant>) {
    let mut client = Endpoint::new(Role::Client, config.clone(), env).unwrap();
    let mut server = Endpoint::new(Role::Server, config.clone(), env).unwrap();

    let client_cid = client.initial_connection_id().clone();
    let server_cid = server.initial_connection_id().clone();
    let handshake = b"integration handshake secret";

    client
        .complete_handshake(derive_traffic_secrets(handshake, Role::Client), server_cid, now)
        .unwrap();
    server
        .complete_handshake(derive_traffic_secrets(handshake, Role::Server), client_cid, now)
        .unwrap();
    (client, server)
}

/// Payload carrying the largest packet number received so far.
pub fn ack_payload(largest: Option<u64>) -> Vec<u8> {
    largest.map(|pn| pn.to_be_bytes().to_vec()).unwrap_or_default()
}

/// Largest acknowledged packet number carried by a payload.
pub fn parse_ack(payload: &[u8]) -> Option<u64> {
    <[u8; 8]>::try_from(payload).ok().map(u64::from_be_bytes)
}

/// The single transmitted datagram among `actions`.
pub fn transmitted(actions: &[EndpointAction]) -> Vec<u8> {
    actions
        .iter()
        .find_map(|action| match action {
            EndpointAction::Transmit(packet) => Some(packet.clone()),
            _ => None,
        })
        .unwrap_or_else(|| panic!("no datagram in {actions:?}"))
}

/// Delivered payloads among `actions`.
pub fn delivered(actions: &[EndpointAction]) -> Vec<(u64, Vec<u8>)> {
    actions
        .iter()
        .filter_map(|action| match action {
            EndpointAction::Deliver { packet_number, payload } => {
                Some((*packet_number, payload.clone()))
            },
            _ => None,
        })
        .collect()
}
