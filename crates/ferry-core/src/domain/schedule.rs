//! Retry schedule: the fixed sequence of waits consumed by the `Retrier`.

use std::sync::Arc;
use std::time::Duration;

/// Immutable, ordered list of wait durations.
///
/// Entry `i` is the wait after failed attempt `i + 1`, so a schedule of
/// length `n` allows `n` attempts. An empty schedule means a single attempt
/// with no retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetrySchedule {
    delays: Arc<[Duration]>,
}

impl RetrySchedule {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: delays.into_iter().collect(),
        }
    }

    /// The send schedule used by the forwarder: 100ms x5, 500ms x5, 1s x5.
    pub fn send_default() -> Self {
        let fast = std::iter::repeat_n(Duration::from_millis(100), 5);
        let medium = std::iter::repeat_n(Duration::from_millis(500), 5);
        let slow = std::iter::repeat_n(Duration::from_secs(1), 5);
        Self::new(fast.chain(medium).chain(slow))
    }

    pub fn delays(&self) -> &[Duration] {
        &self.delays
    }

    /// Number of attempts the schedule allows.
    pub fn max_attempts(&self) -> usize {
        self.delays.len().max(1)
    }

    /// Time spent waiting before the last attempt gives up. The final
    /// entry is never waited.
    pub fn total_wait(&self) -> Duration {
        let waited = self.delays.len().saturating_sub(1);
        self.delays[..waited].iter().sum()
    }
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self::send_default()
    }
}
