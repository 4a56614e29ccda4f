//! OutboxForwarder - Outbox メッセージの配送
//!
//! # フロー
//! 1. `lease_next_batch` で pending メッセージを取得
//! 2. バッチ単位の `SendScope` を開き、各メッセージを Retrier 経由で送信
//! 3. scope を commit してから `Batch::complete` で sent にマーク
//! 4. 空のバッチが返るまで 1〜3 を繰り返す
//!
//! Two periodic tasks drive it (forward loop, cleanup loop) plus the eager
//! path triggered by the incoming step. The eager path and the loop race for
//! the same rows; the storage lease decides who sends them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::options::OutboxOptions;
use super::periodic::PeriodicTask;
use super::retrier::Retrier;
use crate::domain::{CorrelationId, MessageId, OutboxError, OutboxResult};
use crate::ports::{OutboxBatch, OutboxStorage, SendScope, Transport};

pub const FORWARD_TASK_NAME: &str = "OutboxForwarder";
pub const CLEANUP_TASK_NAME: &str = "OutboxCleaner";

/// Counters for observing the forwarder.
#[derive(Debug, Default)]
pub struct ForwarderStats {
    forwarded: AtomicU64,
    batches_completed: AtomicU64,
    batches_abandoned: AtomicU64,
    eager_attempts: AtomicU64,
    purged: AtomicU64,
}

/// Point-in-time copy of `ForwarderStats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ForwarderStatsSnapshot {
    pub forwarded: u64,
    pub batches_completed: u64,
    pub batches_abandoned: u64,
    pub eager_attempts: u64,
    pub purged: u64,
}

impl ForwarderStats {
    pub fn forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }

    pub fn batches_completed(&self) -> u64 {
        self.batches_completed.load(Ordering::Relaxed)
    }

    pub fn batches_abandoned(&self) -> u64 {
        self.batches_abandoned.load(Ordering::Relaxed)
    }

    pub fn eager_attempts(&self) -> u64 {
        self.eager_attempts.load(Ordering::Relaxed)
    }

    pub fn purged(&self) -> u64 {
        self.purged.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> ForwarderStatsSnapshot {
        ForwarderStatsSnapshot {
            forwarded: self.forwarded(),
            batches_completed: self.batches_completed(),
            batches_abandoned: self.batches_abandoned(),
            eager_attempts: self.eager_attempts(),
            purged: self.purged(),
        }
    }
}

/// Entry point the incoming step uses once its transaction has committed.
pub trait EagerSend: Send + Sync {
    /// Spawn a best-effort forwarding attempt for `correlation`.
    ///
    /// Returns `None` when nothing was staged or the forwarder is shut down.
    /// Failures inside the spawned task are logged and never reach the caller.
    fn try_eager_send(
        &self,
        correlation: CorrelationId,
        staged: Vec<MessageId>,
    ) -> Option<JoinHandle<()>>;
}

struct ForwarderInner<S, T> {
    storage: Arc<S>,
    transport: Arc<T>,
    retrier: Retrier,
    options: OutboxOptions,
    cancel: CancellationToken,
    stats: ForwarderStats,
}

impl<S, T> ForwarderInner<S, T>
where
    S: OutboxStorage,
    T: Transport,
{
    /// One forward-loop wake-up: lease and send batches until the storage
    /// returns an empty one. Returns the number of messages forwarded.
    async fn forward_pending(&self) -> OutboxResult<usize> {
        let mut forwarded = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Err(OutboxError::Cancelled);
            }

            debug!("Checking outbox for pending messages");
            let batch = self.storage.lease_next_batch(None).await?;
            if batch.is_empty() {
                debug!("No pending messages found");
                return Ok(forwarded);
            }
            forwarded += self.process_batch(batch).await?;
        }
    }

    /// Forward whatever is pending for one correlation group (single lease).
    async fn forward_correlation(&self, correlation: &CorrelationId) -> OutboxResult<usize> {
        let batch = self.storage.lease_next_batch(Some(correlation)).await?;
        if batch.is_empty() {
            return Ok(0);
        }
        self.process_batch(batch).await
    }

    async fn process_batch(&self, batch: S::Batch) -> OutboxResult<usize> {
        let count = batch.len();
        debug!(count, "Sending pending messages");

        if let Err(err) = self.send_batch(&batch).await {
            // batch drops here: lease released, messages stay pending
            self.stats.batches_abandoned.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        if let Err(err) = batch.complete().await {
            self.stats.batches_abandoned.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        self.stats.batches_completed.fetch_add(1, Ordering::Relaxed);
        self.stats
            .forwarded
            .fetch_add(count as u64, Ordering::Relaxed);
        debug!(count, "Outbox batch completed");
        Ok(count)
    }

    async fn send_batch(&self, batch: &S::Batch) -> OutboxResult<()> {
        let scope = SendScope::new();

        for message in batch.messages() {
            let transport = &self.transport;
            let destination = message.destination.as_str();
            let scope = &scope;

            self.retrier
                .execute(
                    move || transport.send(destination, message.to_transport_message(), scope),
                    &self.cancel,
                )
                .await?;
        }

        self.transport.commit(scope).await
    }

    async fn clean_up(&self) -> OutboxResult<usize> {
        let purged = self.storage.purge_forwarded(&self.options.cleanup).await?;
        self.stats.purged.fetch_add(purged as u64, Ordering::Relaxed);
        debug!(purged, "Outbox cleanup finished");
        Ok(purged)
    }
}

/// Background forwarder for staged messages.
///
/// ```ignore
/// let forwarder = OutboxForwarder::new(storage, transport, OutboxOptions::default())?;
/// forwarder.start();
/// // ...
/// forwarder.shutdown().await;
/// ```
pub struct OutboxForwarder<S, T> {
    inner: Arc<ForwarderInner<S, T>>,
    forward_task: PeriodicTask,
    cleanup_task: PeriodicTask,
    stopped: AtomicBool,
}

impl<S, T> OutboxForwarder<S, T>
where
    S: OutboxStorage,
    T: Transport,
{
    /// Validates `options`; nothing is started until `start`.
    pub fn new(storage: Arc<S>, transport: Arc<T>, options: OutboxOptions) -> OutboxResult<Self> {
        Self::with_retrier(storage, transport, options, Retrier::default())
    }

    /// Like `new` with a custom retrier. Its timer also drives both loops.
    pub fn with_retrier(
        storage: Arc<S>,
        transport: Arc<T>,
        options: OutboxOptions,
        retrier: Retrier,
    ) -> OutboxResult<Self> {
        options.validate()?;

        let cancel = CancellationToken::new();
        let timer = retrier.timer();
        let forward_task = PeriodicTask::new(
            FORWARD_TASK_NAME,
            options.forward_interval(),
            Arc::clone(&timer),
            &cancel,
        );
        let cleanup_task =
            PeriodicTask::new(CLEANUP_TASK_NAME, options.cleanup_interval(), timer, &cancel);

        Ok(Self {
            inner: Arc::new(ForwarderInner {
                storage,
                transport,
                retrier,
                options,
                cancel,
                stats: ForwarderStats::default(),
            }),
            forward_task,
            cleanup_task,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn options(&self) -> &OutboxOptions {
        &self.inner.options
    }

    pub fn stats(&self) -> &ForwarderStats {
        &self.inner.stats
    }

    pub fn is_running(&self) -> bool {
        self.forward_task.is_running() || self.cleanup_task.is_running()
    }

    /// Start both loops. Calling it again, or after `shutdown`, does nothing.
    pub fn start(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        self.forward_task.start(move || {
            let inner = Arc::clone(&inner);
            async move {
                match inner.forward_pending().await {
                    Ok(_) | Err(OutboxError::Cancelled) => Ok(()),
                    Err(err) => Err(err),
                }
            }
        });

        let inner = Arc::clone(&self.inner);
        self.cleanup_task.start(move || {
            let inner = Arc::clone(&inner);
            async move { inner.clean_up().await.map(|_| ()) }
        });

        info!(
            forward_interval_secs = self.inner.options.forward_interval_secs,
            cleanup_interval_secs = self.inner.options.cleanup_interval_secs,
            "Outbox forwarder started"
        );
    }

    /// Run one forward-loop wake-up now.
    pub async fn forward_pending(&self) -> OutboxResult<usize> {
        self.inner.forward_pending().await
    }

    /// Run one cleanup wake-up now.
    pub async fn clean_up(&self) -> OutboxResult<usize> {
        self.inner.clean_up().await
    }

    /// Cancel both loops and wait for them. Never fails; safe to repeat.
    pub async fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.forward_task.stop().await;
        self.cleanup_task.stop().await;

        if !self.stopped.swap(true, Ordering::SeqCst) {
            info!("Outbox forwarder stopped");
        }
    }
}

impl<S, T> EagerSend for OutboxForwarder<S, T>
where
    S: OutboxStorage,
    T: Transport,
{
    fn try_eager_send(
        &self,
        correlation: CorrelationId,
        staged: Vec<MessageId>,
    ) -> Option<JoinHandle<()>> {
        if staged.is_empty() || self.inner.cancel.is_cancelled() {
            return None;
        }

        self.inner.stats.eager_attempts.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        Some(tokio::spawn(async move {
            match inner.forward_correlation(&correlation).await {
                Ok(0) => debug!(correlation_id = %correlation, "Nothing left to send eagerly"),
                Ok(count) => debug!(correlation_id = %correlation, count, "Eagerly forwarded messages"),
                Err(err) => warn!(
                    correlation_id = %correlation,
                    staged = staged.len(),
                    error = %err,
                    "Eager send failed; forward loop will pick the messages up"
                ),
            }
        }))
    }
}

impl<S, T> Drop for OutboxForwarder<S, T> {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{OutboxMessage, RetrySchedule, TransportMessage};
    use crate::impls::{InMemoryOutboxStorage, InMemoryTransport};
    use crate::ports::{OutboxConnection, SystemClock, IdGenerator, UlidGenerator};
    use chrono::Utc;
    use std::time::Duration;

    fn no_retry() -> Retrier {
        Retrier::new(RetrySchedule::new([]))
    }

    fn forwarder(
        storage: &Arc<InMemoryOutboxStorage>,
        transport: &Arc<InMemoryTransport>,
    ) -> OutboxForwarder<InMemoryOutboxStorage, InMemoryTransport> {
        OutboxForwarder::with_retrier(
            Arc::clone(storage),
            Arc::clone(transport),
            OutboxOptions::default(),
            no_retry(),
        )
        .unwrap()
    }

    async fn stage(
        storage: &InMemoryOutboxStorage,
        correlation: &str,
        destinations: &[&str],
    ) -> Vec<MessageId> {
        let ids = UlidGenerator::new(SystemClock);
        let messages: Vec<OutboxMessage> = destinations
            .iter()
            .map(|dest| {
                OutboxMessage::new(
                    ids.generate_message_id(),
                    *dest,
                    TransportMessage::default(),
                    CorrelationId::new(correlation),
                    Utc::now(),
                )
            })
            .collect();
        let staged = messages.iter().map(|m| m.id).collect();

        let mut connection = storage.open_connection().await.unwrap();
        storage.write(&mut connection, messages).await.unwrap();
        connection.commit().await.unwrap();
        staged
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_anything_starts() {
        let options = OutboxOptions {
            forward_interval_secs: 0,
            ..OutboxOptions::default()
        };
        let result = OutboxForwarder::new(
            Arc::new(InMemoryOutboxStorage::new()),
            Arc::new(InMemoryTransport::new()),
            options,
        );
        assert!(matches!(result, Err(OutboxError::InvalidConfiguration(_))));
    }

    #[tokio::test]
    async fn forward_pending_drains_every_batch() {
        let storage = Arc::new(InMemoryOutboxStorage::new().with_batch_size(2));
        let transport = Arc::new(InMemoryTransport::new());
        stage(&storage, "C1", &["A", "B", "A"]).await;
        stage(&storage, "C2", &["B", "B"]).await;

        let forwarder = forwarder(&storage, &transport);
        let forwarded = forwarder.forward_pending().await.unwrap();

        assert_eq!(forwarded, 5);
        assert_eq!(transport.delivered("A").len(), 2);
        assert_eq!(transport.delivered("B").len(), 3);
        assert_eq!(storage.pending_count(), 0);
        assert_eq!(forwarder.stats().batches_completed(), 3);
        assert_eq!(forwarder.stats().forwarded(), 5);
    }

    #[tokio::test]
    async fn send_failure_abandons_batch_without_partial_delivery() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        stage(&storage, "C", &["A", "B"]).await;
        transport.make_unreachable("B");

        let forwarder = forwarder(&storage, &transport);
        let err = forwarder.forward_pending().await.unwrap_err();

        assert!(matches!(err, OutboxError::Send { .. }));
        // the scope was never committed, so "A" was not delivered either
        assert_eq!(transport.delivered_count(), 0);
        assert_eq!(storage.pending_count(), 2);
        assert_eq!(forwarder.stats().batches_abandoned(), 1);

        transport.restore("B");
        assert_eq!(forwarder.forward_pending().await.unwrap(), 2);
        assert_eq!(storage.pending_count(), 0);
    }

    #[tokio::test]
    async fn lease_failure_ends_the_wake_up() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        stage(&storage, "C", &["A"]).await;
        storage.fail_next_leases(1);

        let forwarder = forwarder(&storage, &transport);
        assert!(matches!(
            forwarder.forward_pending().await,
            Err(OutboxError::Storage(_))
        ));
        assert_eq!(forwarder.forward_pending().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn eager_send_targets_only_its_correlation() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        let staged = stage(&storage, "C1", &["A"]).await;
        stage(&storage, "C2", &["B"]).await;

        let forwarder = forwarder(&storage, &transport);
        forwarder
            .try_eager_send(CorrelationId::new("C1"), staged)
            .unwrap()
            .await
            .unwrap();

        assert_eq!(transport.delivered("A").len(), 1);
        assert!(transport.delivered("B").is_empty());
        assert_eq!(storage.pending_count(), 1);
        assert_eq!(forwarder.stats().eager_attempts(), 1);
    }

    #[tokio::test]
    async fn eager_send_swallows_failures() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        let staged = stage(&storage, "C", &["A"]).await;
        transport.make_unreachable("A");

        let forwarder = forwarder(&storage, &transport);
        let handle = forwarder
            .try_eager_send(CorrelationId::new("C"), staged)
            .unwrap();

        assert!(handle.await.is_ok());
        assert_eq!(storage.pending_count(), 1);
    }

    #[tokio::test]
    async fn eager_send_without_staged_messages_is_a_no_op() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        let forwarder = forwarder(&storage, &transport);

        assert!(
            forwarder
                .try_eager_send(CorrelationId::new("C"), Vec::new())
                .is_none()
        );
        assert_eq!(forwarder.stats().eager_attempts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn started_loops_forward_and_clean_up() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        stage(&storage, "C", &["A", "B"]).await;

        let forwarder = forwarder(&storage, &transport);
        forwarder.start();
        assert!(forwarder.is_running());

        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(transport.delivered_count(), 2);
        assert_eq!(storage.sent_count(), 2);

        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(storage.sent_count(), 0);
        assert_eq!(forwarder.stats().purged(), 2);

        forwarder.shutdown().await;
        forwarder.shutdown().await;
        assert!(!forwarder.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_a_started_forwarder_stops_both_loops() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        stage(&storage, "C1", &["A"]).await;

        let forwarder = forwarder(&storage, &transport);
        forwarder.start();
        tokio::time::sleep(Duration::from_millis(1_500)).await;
        assert_eq!(transport.delivered_count(), 1);

        drop(forwarder);
        stage(&storage, "C2", &["B"]).await;
        tokio::time::sleep(Duration::from_secs(130)).await;

        assert_eq!(transport.send_attempts(), 1);
        assert_eq!(storage.pending_count(), 1);
        // cleaner never ran either
        assert_eq!(storage.sent_count(), 1);
    }

    #[tokio::test]
    async fn eager_send_after_shutdown_is_refused() {
        let storage = Arc::new(InMemoryOutboxStorage::new());
        let transport = Arc::new(InMemoryTransport::new());
        let staged = stage(&storage, "C", &["A"]).await;

        let forwarder = forwarder(&storage, &transport);
        forwarder.shutdown().await;

        assert!(
            forwarder
                .try_eager_send(CorrelationId::new("C"), staged)
                .is_none()
        );
        forwarder.start();
        assert!(!forwarder.is_running());
    }
}
