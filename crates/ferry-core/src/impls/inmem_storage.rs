//! InMemoryOutboxStorage - development / test staging store.
//!
//! Behaves like a real table with lease columns:
//! - writes are buffered on the connection and become visible on commit
//! - a lease is time-bounded; an expired lease makes its rows leasable again
//!   and its `complete` fails
//! - dropping a batch releases its lease

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::debug;

use crate::domain::{CorrelationId, OutboxError, OutboxMessage, OutboxResult};
use crate::ports::{
    CleanupPolicy, Clock, OutboxBatch, OutboxConnection, OutboxStorage, SystemClock,
};

/// Default number of messages per lease.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Default lease duration.
pub const DEFAULT_LEASE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Lease {
    id: u64,
    expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct Row {
    message: OutboxMessage,
    lease: Option<Lease>,
}

impl Row {
    fn is_leasable(&self, now: DateTime<Utc>) -> bool {
        self.message.sent_at.is_none() && self.lease.is_none_or(|lease| lease.expires_at <= now)
    }
}

#[derive(Debug, Default)]
struct StorageState {
    /// Committed rows keyed by insertion sequence (lease order).
    rows: BTreeMap<u64, Row>,
    next_seq: u64,
    next_lease_id: u64,
    commit_failures: usize,
    lease_failures: usize,
    complete_failures: usize,
}

impl StorageState {
    fn insert(&mut self, message: OutboxMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.rows.insert(
            seq,
            Row {
                message,
                lease: None,
            },
        );
    }

    fn release(&mut self, lease_id: u64, seqs: &[u64]) {
        for seq in seqs {
            if let Some(row) = self.rows.get_mut(seq)
                && row.lease.is_some_and(|lease| lease.id == lease_id)
            {
                row.lease = None;
            }
        }
    }
}

type SharedState = Arc<Mutex<StorageState>>;

fn lock(state: &SharedState) -> MutexGuard<'_, StorageState> {
    state.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-memory `OutboxStorage`.
///
/// `std::sync::Mutex` rather than the tokio one: abandoning a batch happens in
/// `Drop`, which cannot await.
#[derive(Clone)]
pub struct InMemoryOutboxStorage {
    state: SharedState,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    lease_timeout: Duration,
}

impl InMemoryOutboxStorage {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(StorageState::default())),
            clock: Arc::new(SystemClock),
            batch_size: DEFAULT_BATCH_SIZE,
            lease_timeout: DEFAULT_LEASE_TIMEOUT,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Maximum messages per lease (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_lease_timeout(mut self, lease_timeout: Duration) -> Self {
        self.lease_timeout = lease_timeout;
        self
    }

    /// Make the next `n` transaction commits fail with a storage error. A
    /// failed commit discards its writes.
    pub fn fail_next_commits(&self, n: usize) {
        lock(&self.state).commit_failures = n;
    }

    /// Make the next `n` lease calls fail with a storage error.
    pub fn fail_next_leases(&self, n: usize) {
        lock(&self.state).lease_failures = n;
    }

    /// Make the next `n` batch completions fail with a storage error.
    pub fn fail_next_completions(&self, n: usize) {
        lock(&self.state).complete_failures = n;
    }

    /// Committed messages not yet forwarded.
    pub fn pending_count(&self) -> usize {
        lock(&self.state)
            .rows
            .values()
            .filter(|row| row.message.sent_at.is_none())
            .count()
    }

    /// Committed messages already forwarded and not yet purged.
    pub fn sent_count(&self) -> usize {
        lock(&self.state)
            .rows
            .values()
            .filter(|row| row.message.sent_at.is_some())
            .count()
    }

    /// Snapshot of every committed message in lease order.
    pub fn messages(&self) -> Vec<OutboxMessage> {
        lock(&self.state)
            .rows
            .values()
            .map(|row| row.message.clone())
            .collect()
    }

    fn lease_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let timeout = chrono::Duration::from_std(self.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        now + timeout
    }
}

impl Default for InMemoryOutboxStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Connection with an open transaction. Writes stay invisible until commit.
pub struct InMemoryConnection {
    state: SharedState,
    writes: Vec<OutboxMessage>,
}

#[async_trait]
impl OutboxConnection for InMemoryConnection {
    async fn commit(self) -> OutboxResult<()> {
        let mut state = lock(&self.state);
        if state.commit_failures > 0 {
            state.commit_failures -= 1;
            return Err(OutboxError::storage("injected commit failure"));
        }
        let count = self.writes.len();
        for message in self.writes {
            state.insert(message);
        }
        debug!(count, "Committed outbox transaction");
        Ok(())
    }

    async fn rollback(self) -> OutboxResult<()> {
        debug!(count = self.writes.len(), "Rolled back outbox transaction");
        Ok(())
    }
}

/// A leased batch. Dropping it without `complete` releases the lease.
pub struct InMemoryBatch {
    state: SharedState,
    clock: Arc<dyn Clock>,
    lease_id: u64,
    seqs: Vec<u64>,
    messages: Vec<OutboxMessage>,
    finished: bool,
}

#[async_trait]
impl OutboxBatch for InMemoryBatch {
    fn messages(&self) -> &[OutboxMessage] {
        &self.messages
    }

    async fn complete(mut self) -> OutboxResult<()> {
        if self.seqs.is_empty() {
            self.finished = true;
            return Ok(());
        }

        let result = {
            let mut state = lock(&self.state);
            let now = self.clock.now();

            if state.complete_failures > 0 {
                state.complete_failures -= 1;
                Err(OutboxError::storage("injected completion failure"))
            } else {
                let held = self.seqs.iter().all(|seq| {
                    state.rows.get(seq).is_some_and(|row| {
                        row.lease
                            .is_some_and(|lease| lease.id == self.lease_id && lease.expires_at > now)
                    })
                });

                if held {
                    for seq in &self.seqs {
                        if let Some(row) = state.rows.get_mut(seq) {
                            row.message.mark_sent(now);
                            row.lease = None;
                        }
                    }
                    Ok(())
                } else {
                    Err(OutboxError::storage(format!(
                        "lease {} expired or was released",
                        self.lease_id
                    )))
                }
            }
        };

        // on failure Drop releases whatever we still hold
        if result.is_ok() {
            self.finished = true;
        }
        result
    }
}

impl Drop for InMemoryBatch {
    fn drop(&mut self) {
        if self.finished || self.seqs.is_empty() {
            return;
        }
        lock(&self.state).release(self.lease_id, &self.seqs);
        debug!(lease_id = self.lease_id, count = self.seqs.len(), "Abandoned outbox batch");
    }
}

#[async_trait]
impl OutboxStorage for InMemoryOutboxStorage {
    type Connection = InMemoryConnection;
    type Batch = InMemoryBatch;

    async fn open_connection(&self) -> OutboxResult<InMemoryConnection> {
        Ok(InMemoryConnection {
            state: Arc::clone(&self.state),
            writes: Vec::new(),
        })
    }

    async fn write(
        &self,
        connection: &mut InMemoryConnection,
        messages: Vec<OutboxMessage>,
    ) -> OutboxResult<()> {
        if !Arc::ptr_eq(&connection.state, &self.state) {
            return Err(OutboxError::storage(
                "connection belongs to a different outbox storage",
            ));
        }
        connection.writes.extend(messages);
        Ok(())
    }

    async fn lease_next_batch(
        &self,
        correlation: Option<&CorrelationId>,
    ) -> OutboxResult<InMemoryBatch> {
        let mut state = lock(&self.state);
        if state.lease_failures > 0 {
            state.lease_failures -= 1;
            return Err(OutboxError::storage("injected lease failure"));
        }

        let now = self.clock.now();
        let lease = Lease {
            id: state.next_lease_id,
            expires_at: self.lease_expiry(now),
        };
        state.next_lease_id += 1;

        let mut seqs = Vec::new();
        let mut messages = Vec::new();
        for (seq, row) in state.rows.iter_mut() {
            if seqs.len() >= self.batch_size {
                break;
            }
            if !row.is_leasable(now) {
                continue;
            }
            if correlation.is_some_and(|c| *c != row.message.correlation_id) {
                continue;
            }
            row.lease = Some(lease);
            seqs.push(*seq);
            messages.push(row.message.clone());
        }

        Ok(InMemoryBatch {
            state: Arc::clone(&self.state),
            clock: Arc::clone(&self.clock),
            lease_id: lease.id,
            seqs,
            messages,
            finished: false,
        })
    }

    async fn purge_forwarded(&self, policy: &CleanupPolicy) -> OutboxResult<usize> {
        let retention = chrono::Duration::from_std(policy.retention)
            .map_err(|e| OutboxError::storage(format!("retention out of range: {e}")))?;
        let cutoff = self.clock.now() - retention;
        let limit = policy.max_batch.unwrap_or(usize::MAX);

        let mut state = lock(&self.state);
        let expired: Vec<u64> = state
            .rows
            .iter()
            .filter(|(_, row)| row.message.sent_at.is_some_and(|sent| sent <= cutoff))
            .map(|(seq, _)| *seq)
            .take(limit)
            .collect();

        for seq in &expired {
            state.rows.remove(seq);
        }
        Ok(expired.len())
    }
}
