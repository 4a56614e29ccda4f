//! Timer port - how the engine waits.
//!
//! Retry waits and periodic wake-ups go through this trait instead of calling
//! `tokio::time::sleep` directly, so tests can observe or short-circuit them.

use std::time::Duration;

use async_trait::async_trait;

#[async_trait]
pub trait Timer: Send + Sync {
    async fn sleep(&self, duration: Duration);
}

/// Production timer backed by the tokio time driver.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTimer;

#[async_trait]
impl Timer for TokioTimer {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn tokio_timer_waits_the_requested_duration() {
        let start = tokio::time::Instant::now();
        TokioTimer.sleep(Duration::from_millis(500)).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }
}
