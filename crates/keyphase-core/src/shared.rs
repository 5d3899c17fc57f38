//! The serialization point for an endpoint.
//!
//! Packet processing, acknowledgements and the periodic update timer all
//! reach the key-phase engine through one lock, so at most one update is
//! ever in flight per direction.

use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::{
    endpoint::{Endpoint, EndpointAction},
    env::{Environment, Timestamp},
};

/// Endpoint shared between tasks.
#[derive(Debug)]
pub struct SharedEndpoint<I: Timestamp> {
    inner: Arc<Mutex<Endpoint<I>>>,
}

impl<I: Timestamp> Clone for SharedEndpoint<I> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<I: Timestamp> SharedEndpoint<I> {
    /// Wrap an endpoint.
    pub fn new(endpoint: Endpoint<I>) -> Self {
        Self { inner: Arc::new(Mutex::new(endpoint)) }
    }

    // Endpoint methods never leave partial state behind; a poisoned lock is
    // still usable.
    fn lock(&self) -> MutexGuard<'_, Endpoint<I>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` with exclusive access to the endpoint.
    pub fn with<R>(&self, f: impl FnOnce(&mut Endpoint<I>) -> R) -> R {
        f(&mut self.lock())
    }

    /// See [`Endpoint::send`].
    pub fn send(&self, payload: &[u8], now: I) -> Vec<EndpointAction> {
        self.lock().send(payload, now)
    }

    /// See [`Endpoint::recv`].
    pub fn recv(&self, datagram: &[u8], now: I) -> Vec<EndpointAction> {
        self.lock().recv(datagram, now)
    }

    /// See [`Endpoint::on_ack`].
    pub fn on_ack(&self, largest_acked: u64) -> Option<u64> {
        self.lock().on_ack(largest_acked)
    }

    /// See [`Endpoint::on_timeout`].
    pub fn on_timeout(&self, now: I) -> Vec<EndpointAction> {
        self.lock().on_timeout(now)
    }

    /// Whether the endpoint is closed.
    pub fn is_closed(&self) -> bool {
        self.lock().is_closed()
    }
}

/// Spawn a task that calls [`Endpoint::on_timeout`] every `period`.
///
/// The task only requests updates through the shared lock; when a request
/// finds an update already in progress nothing happens. It stops once the
/// endpoint is closed. Close actions produced by the timer are logged; the
/// driver observes the closed endpoint on its next call.
pub fn spawn_update_timer<E>(
    endpoint: SharedEndpoint<E::Instant>,
    env: E,
    period: Duration,
) -> JoinHandle<()>
where
    E: Environment,
{
    tokio::spawn(async move {
        loop {
            env.sleep(period).await;
            if endpoint.is_closed() {
                debug!("endpoint closed, stopping update timer");
                break;
            }

            for action in endpoint.on_timeout(env.now()) {
                trace!(?action, "update timer action");
            }
        }
    })
}
