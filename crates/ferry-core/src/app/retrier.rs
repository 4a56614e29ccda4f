//! Retrier - runs an action under a fixed backoff schedule.

use std::future::Future;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::domain::{OutboxError, OutboxResult, RetrySchedule};
use crate::ports::{Timer, TokioTimer};

/// Executes an action, retrying failures according to a `RetrySchedule`.
///
/// # Flow
/// 1. run the action
/// 2. on failure, wait the next scheduled duration (cancellable)
/// 3. repeat until success or the schedule is exhausted
///
/// When the schedule runs out the last failure is returned at once; there is
/// no wait after the final attempt. Cancellation is
/// checked before and after every wait; a cancelled wait returns
/// `OutboxError::Cancelled` and never starts another attempt. An attempt that
/// is already running is not interrupted.
#[derive(Clone)]
pub struct Retrier {
    schedule: RetrySchedule,
    timer: Arc<dyn Timer>,
}

impl Retrier {
    pub fn new(schedule: RetrySchedule) -> Self {
        Self {
            schedule,
            timer: Arc::new(TokioTimer),
        }
    }

    /// Replace the timer used for waits.
    pub fn with_timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = timer;
        self
    }

    pub fn timer(&self) -> Arc<dyn Timer> {
        Arc::clone(&self.timer)
    }

    pub async fn execute<T, F, Fut>(
        &self,
        mut action: F,
        cancel: &CancellationToken,
    ) -> OutboxResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OutboxResult<T>>,
    {
        let delays = self.schedule.delays();
        if delays.is_empty() {
            return action().await;
        }

        let max_attempts = delays.len();
        for (index, delay) in delays.iter().enumerate() {
            if cancel.is_cancelled() {
                return Err(OutboxError::Cancelled);
            }

            let err = match action().await {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };

            let attempt = index + 1;
            if attempt == max_attempts {
                warn!(attempt, max_attempts, error = %err, "Final attempt failed, giving up");
                return Err(err);
            }
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Attempt failed, waiting before retry"
            );

            if cancel.is_cancelled() {
                return Err(OutboxError::Cancelled);
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(OutboxError::Cancelled),
                _ = self.timer.sleep(*delay) => {}
            }
        }

        Err(OutboxError::Cancelled)
    }
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(RetrySchedule::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records every requested wait and returns immediately.
    #[derive(Default)]
    struct RecordingTimer {
        waits: Mutex<Vec<Duration>>,
    }

    #[async_trait]
    impl Timer for RecordingTimer {
        async fn sleep(&self, duration: Duration) {
            self.waits.lock().unwrap().push(duration);
        }
    }

    #[tokio::test]
    async fn succeeds_without_waiting() {
        let timer = Arc::new(RecordingTimer::default());
        let retrier = Retrier::default().with_timer(timer.clone());

        let result = retrier
            .execute(|| async { Ok::<_, OutboxError>(7) }, &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap(), 7);
        assert!(timer.waits.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn retries_until_success() {
        let timer = Arc::new(RecordingTimer::default());
        let retrier = Retrier::default().with_timer(timer.clone());
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result = retrier
            .execute(
                move || async move {
                    if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                        Err(OutboxError::send("A", "unavailable"))
                    } else {
                        Ok(())
                    }
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(
            *timer.waits.lock().unwrap(),
            vec![Duration::from_millis(100); 3]
        );
    }

    #[tokio::test]
    async fn exhausted_schedule_returns_last_error() {
        let timer = Arc::new(RecordingTimer::default());
        let retrier = Retrier::default().with_timer(timer.clone());
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: OutboxResult<()> = retrier
            .execute(
                move || async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    Err(OutboxError::send("A", format!("failure {n}")))
                },
                &CancellationToken::new(),
            )
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 15);
        let schedule = RetrySchedule::default();
        assert_eq!(timer.waits.lock().unwrap().as_slice(), &schedule.delays()[..14]);
        match result {
            Err(OutboxError::Send { reason, .. }) => assert_eq!(reason, "failure 15"),
            other => panic!("expected send failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn empty_schedule_runs_once() {
        let retrier = Retrier::new(RetrySchedule::new([]));
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: OutboxResult<()> = retrier
            .execute(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(OutboxError::send("A", "down"))
                },
                &CancellationToken::new(),
            )
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_token_prevents_first_attempt() {
        let retrier = Retrier::default();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let counter = AtomicUsize::new(0);
        let calls = &counter;

        let result: OutboxResult<()> = retrier
            .execute(
                move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(OutboxError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_during_wait_stops_retrying() {
        let retrier = Retrier::default();
        let cancel = CancellationToken::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let task = tokio::spawn({
            let cancel = cancel.clone();
            let calls = calls.clone();
            async move {
                retrier
                    .execute(
                        || {
                            let calls = calls.clone();
                            async move {
                                calls.fetch_add(1, Ordering::SeqCst);
                                Err::<(), _>(OutboxError::send("A", "down"))
                            }
                        },
                        &cancel,
                    )
                    .await
            }
        });

        // first attempt fails, retrier is now inside the 100ms wait
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(OutboxError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn final_failure_is_returned_without_trailing_wait() {
        let retrier = Retrier::new(RetrySchedule::new([
            Duration::from_millis(100),
            Duration::from_secs(1),
        ]));
        let started = tokio::time::Instant::now();

        let result: OutboxResult<()> = retrier
            .execute(
                || async { Err(OutboxError::send("A", "down")) },
                &CancellationToken::new(),
            )
            .await;

        assert!(matches!(result, Err(OutboxError::Send { .. })));
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_after_final_attempt_keeps_the_send_error() {
        let retrier = Retrier::new(RetrySchedule::new([Duration::from_secs(1)]));
        let cancel = CancellationToken::new();

        let result: OutboxResult<()> = retrier
            .execute(
                || {
                    let cancel = cancel.clone();
                    async move {
                        cancel.cancel();
                        Err(OutboxError::send("A", "down"))
                    }
                },
                &cancel,
            )
            .await;

        assert!(matches!(result, Err(OutboxError::Send { .. })));
    }
}
