//! PeriodicTask - a cancellable repeating background job.
//!
//! One task per loop (forwarder, cleaner). Each owns a child of the shared
//! cancellation token so it can be stopped on its own, while cancelling the
//! parent stops all of them.

use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::OutboxResult;
use crate::ports::Timer;

/// Repeating job with explicit start / stop.
///
/// The job runs once per `interval`, after the interval has elapsed (the
/// first run is one interval after `start`). A failing run is logged and the
/// task keeps its schedule. Stopping does not abort a run in progress; the
/// job sees the cancellation through the token it shares with the caller.
pub struct PeriodicTask {
    name: &'static str,
    interval: Duration,
    timer: Arc<dyn Timer>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl PeriodicTask {
    pub fn new(
        name: &'static str,
        interval: Duration,
        timer: Arc<dyn Timer>,
        parent: &CancellationToken,
    ) -> Self {
        Self {
            name,
            interval,
            timer,
            cancel: parent.child_token(),
            handle: Mutex::new(None),
        }
    }

    pub fn is_running(&self) -> bool {
        self.lock_handle()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Spawn the loop. Calling `start` on a running or stopped task is a no-op.
    pub fn start<F, Fut>(&self, mut job: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = OutboxResult<()>> + Send + 'static,
    {
        let mut slot = self.lock_handle();
        if slot.is_some() || self.cancel.is_cancelled() {
            return;
        }

        let name = self.name;
        let interval = self.interval;
        let timer = Arc::clone(&self.timer);
        let cancel = self.cancel.clone();

        debug!(task = name, interval_ms = interval.as_millis() as u64, "Starting periodic task");
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = timer.sleep(interval) => {}
                }
                if cancel.is_cancelled() {
                    break;
                }
                if let Err(err) = job().await {
                    warn!(task = name, error = %err, "Periodic task run failed");
                }
            }
            debug!(task = name, "Periodic task stopped");
        }));
    }

    /// Cancel the loop and wait for the current run (if any) to finish.
    /// Safe to call more than once.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.lock_handle().take();
        if let Some(handle) = handle
            && let Err(err) = handle.await
            && err.is_panic()
        {
            warn!(task = self.name, "Periodic task panicked");
        }
    }

    fn lock_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.handle.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
