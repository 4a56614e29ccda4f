//! InMemoryTransport - 開発用のトランスポート
//!
//! Sends are buffered per `SendScope` and only become visible in the
//! per-destination inboxes when the scope commits. A scope that is never
//! committed delivers nothing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::debug;
use ulid::Ulid;

use crate::domain::{OutboxError, OutboxResult, TransportMessage};
use crate::ports::{SendScope, Transport};

#[derive(Debug, Default)]
struct TransportState {
    in_flight: HashMap<Ulid, Vec<(String, TransportMessage)>>,
    /// Committed deliveries in commit order.
    delivered: Vec<(String, TransportMessage)>,
    send_attempts: usize,
    send_failures: usize,
    unreachable: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTransport {
    state: Arc<Mutex<TransportState>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` sends regardless of destination.
    pub fn fail_next_sends(&self, n: usize) {
        self.lock().send_failures = n;
    }

    /// Fail every send to `destination` until `restore` is called.
    pub fn make_unreachable(&self, destination: impl Into<String>) {
        self.lock().unreachable.push(destination.into());
    }

    pub fn restore(&self, destination: &str) {
        self.lock().unreachable.retain(|d| d != destination);
    }

    /// Committed messages for `destination`, in delivery order.
    pub fn delivered(&self, destination: &str) -> Vec<TransportMessage> {
        self.lock()
            .delivered
            .iter()
            .filter(|(d, _)| d == destination)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Every committed delivery as `(destination, message)`.
    pub fn all_delivered(&self) -> Vec<(String, TransportMessage)> {
        self.lock().delivered.clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.lock().delivered.len()
    }

    /// Sends attempted so far, failed ones included.
    pub fn send_attempts(&self) -> usize {
        self.lock().send_attempts
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: &SendScope,
    ) -> OutboxResult<()> {
        let mut state = self.lock();
        state.send_attempts += 1;

        if state.send_failures > 0 {
            state.send_failures -= 1;
            return Err(OutboxError::send(destination, "injected send failure"));
        }
        if state.unreachable.iter().any(|d| d == destination) {
            return Err(OutboxError::send(destination, "destination unreachable"));
        }

        state
            .in_flight
            .entry(scope.id())
            .or_default()
            .push((destination.to_string(), message));
        Ok(())
    }

    async fn commit(&self, scope: SendScope) -> OutboxResult<()> {
        let mut state = self.lock();
        if let Some(messages) = state.in_flight.remove(&scope.id()) {
            debug!(scope = %scope.id(), count = messages.len(), "Delivered send scope");
            state.delivered.extend(messages);
        }
        Ok(())
    }
}
