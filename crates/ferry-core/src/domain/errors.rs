//! Errors - failure taxonomy for the outbox.
//!
//! - `InvalidConfiguration`: rejected before anything starts.
//! - `Storage`: lease / write / complete / purge failures. Not retried here;
//!   the next scheduled wake-up heals them.
//! - `Send`: transport failures. Retried by the `Retrier`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error("invalid outbox configuration: {0}")]
    InvalidConfiguration(String),

    #[error("outbox storage failure: {0}")]
    Storage(String),

    #[error("send to '{destination}' failed: {reason}")]
    Send { destination: String, reason: String },

    /// Failure raised further down the incoming pipeline (handler code).
    #[error("incoming message handling failed: {0}")]
    Handler(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl OutboxError {
    pub fn storage(reason: impl Into<String>) -> Self {
        Self::Storage(reason.into())
    }

    pub fn send(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Send {
            destination: destination.into(),
            reason: reason.into(),
        }
    }
}

pub type OutboxResult<T> = Result<T, OutboxError>;
