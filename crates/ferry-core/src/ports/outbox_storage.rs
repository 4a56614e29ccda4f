//! OutboxStorage port - the durable staging store.
//!
//! The physical store (tables, queries, lease columns) lives outside this
//! crate. What the engine relies on:
//!
//! - `write` joins the caller's transaction; it never commits on its own.
//! - `lease_next_batch` is atomic across callers and processes: two leases
//!   never return the same message while either lease is held.
//! - A batch is either completed as a whole or abandoned as a whole.
//!
//! Correctness of concurrent forwarders (eager path vs. forward loop, or
//! several processes) rests on the lease alone. Callers must not add
//! in-process locking on top of it.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{CorrelationId, OutboxMessage, OutboxResult};

/// An open storage connection bound to one business transaction.
///
/// Business code and staged writes share it, so both commit or roll back
/// together.
#[async_trait]
pub trait OutboxConnection: Send + 'static {
    async fn commit(self) -> OutboxResult<()>
    where
        Self: Sized;

    async fn rollback(self) -> OutboxResult<()>
    where
        Self: Sized;
}

/// An exclusively leased, ordered batch of pending messages.
///
/// Dropping the batch without calling `complete` abandons it: the lease is
/// released and every message stays pending for a later lease.
#[async_trait]
pub trait OutboxBatch: Send + Sync + 'static {
    /// Messages in lease order. Sends are attempted in this order.
    fn messages(&self) -> &[OutboxMessage];

    fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    fn len(&self) -> usize {
        self.messages().len()
    }

    /// Mark every message as sent and release the lease.
    ///
    /// Fails with `OutboxError::Storage` when the lease expired or was already
    /// released; the caller must then treat the batch as not sent.
    async fn complete(self) -> OutboxResult<()>
    where
        Self: Sized;
}

/// Purge parameters for forwarded messages.
///
/// The engine only schedules the purge; which rows go is decided by the
/// storage using these values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupPolicy {
    /// How long a forwarded message is kept after its sent timestamp.
    #[serde(with = "duration_secs")]
    pub retention: Duration,

    /// Upper bound on rows removed per cleanup run (`None` = unbounded).
    pub max_batch: Option<usize>,
}

impl Default for CleanupPolicy {
    fn default() -> Self {
        Self {
            retention: Duration::ZERO,
            max_batch: None,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// The staging store contract.
#[async_trait]
pub trait OutboxStorage: Send + Sync + 'static {
    type Connection: OutboxConnection;
    type Batch: OutboxBatch;

    /// Open a connection and begin a transaction on it.
    async fn open_connection(&self) -> OutboxResult<Self::Connection>;

    /// Persist messages as part of `connection`'s transaction.
    ///
    /// Fails with `OutboxError::Storage` if the transaction is no longer open.
    async fn write(
        &self,
        connection: &mut Self::Connection,
        messages: Vec<OutboxMessage>,
    ) -> OutboxResult<()>;

    /// Lease the next pending batch, optionally only messages staged under
    /// `correlation`. Returns an empty batch when nothing is pending.
    async fn lease_next_batch(
        &self,
        correlation: Option<&CorrelationId>,
    ) -> OutboxResult<Self::Batch>;

    /// Remove forwarded messages according to `policy`. Returns how many were
    /// removed.
    async fn purge_forwarded(&self, policy: &CleanupPolicy) -> OutboxResult<usize>;
}
