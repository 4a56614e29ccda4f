//! Incoming pipeline - ordered steps around incoming-message handling.
//!
//! Each step receives the message context and a `Next` continuation for the
//! rest of the pipeline. A step may run code before and after `next`, skip it,
//! or run it more than once (the retry step does).

use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tracing::warn;

use super::decorator::SendStrategy;
use super::transaction::TransactionContext;
use crate::domain::{MessageId, OutboxError, OutboxResult, TransportMessage};

/// Name of the standard failure-handling step. The outbox step is always
/// placed directly after it.
pub const DEFAULT_RETRY_STEP: &str = "DefaultRetryStep";

/// Per-message state flowing through the pipeline.
pub struct IncomingContext<C> {
    message_id: MessageId,
    message: TransportMessage,
    transaction: Option<TransactionContext<C>>,
    eager_send: Option<JoinHandle<()>>,
}

impl<C> IncomingContext<C> {
    pub fn new(message_id: MessageId, message: TransportMessage) -> Self {
        Self {
            message_id,
            message,
            transaction: None,
            eager_send: None,
        }
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    pub fn message(&self) -> &TransportMessage {
        &self.message
    }

    pub fn transaction(&self) -> Option<&TransactionContext<C>> {
        self.transaction.as_ref()
    }

    /// Strategy for sends issued while handling this message: staged when a
    /// transaction is active, direct otherwise.
    pub fn send_strategy(&mut self) -> SendStrategy<'_, C> {
        SendStrategy::from(self.transaction.as_mut())
    }

    /// Handle of the eager send spawned after the last successful commit.
    pub fn take_eager_send(&mut self) -> Option<JoinHandle<()>> {
        self.eager_send.take()
    }

    pub(crate) fn begin_transaction(&mut self, transaction: TransactionContext<C>) {
        self.transaction = Some(transaction);
    }

    pub(crate) fn end_transaction(&mut self) -> Option<TransactionContext<C>> {
        self.transaction.take()
    }

    pub(crate) fn set_eager_send(&mut self, handle: Option<JoinHandle<()>>) {
        self.eager_send = handle;
    }
}

#[async_trait]
pub trait IncomingStep<C: Send + 'static>: Send + Sync {
    fn name(&self) -> &str;

    async fn process(&self, ctx: &mut IncomingContext<C>, next: Next<'_, C>) -> OutboxResult<()>;
}

/// The remaining steps of the pipeline.
pub struct Next<'a, C> {
    steps: &'a [Arc<dyn IncomingStep<C>>],
}

impl<C> Clone for Next<'_, C> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<C> Copy for Next<'_, C> {}

impl<'a, C: Send + 'static> Next<'a, C> {
    pub async fn run(self, ctx: &mut IncomingContext<C>) -> OutboxResult<()> {
        match self.steps.split_first() {
            Some((step, rest)) => step.process(ctx, Next { steps: rest }).await,
            None => Ok(()),
        }
    }
}

/// Ordered incoming steps.
pub struct Pipeline<C> {
    steps: Vec<Arc<dyn IncomingStep<C>>>,
}

impl<C: Send + 'static> Pipeline<C> {
    pub fn new() -> Self {
        Self { steps: Vec::new() }
    }

    /// Append a step at the end.
    pub fn push(&mut self, step: Arc<dyn IncomingStep<C>>) -> &mut Self {
        self.steps.push(step);
        self
    }

    /// Insert `step` directly after the step named `anchor`.
    pub fn insert_after(
        &mut self,
        anchor: &str,
        step: Arc<dyn IncomingStep<C>>,
    ) -> OutboxResult<()> {
        let position = self
            .steps
            .iter()
            .position(|s| s.name() == anchor)
            .ok_or_else(|| {
                OutboxError::InvalidConfiguration(format!("pipeline has no step named `{anchor}`"))
            })?;
        self.steps.insert(position + 1, step);
        Ok(())
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name()).collect()
    }

    pub async fn run(&self, ctx: &mut IncomingContext<C>) -> OutboxResult<()> {
        Next { steps: &self.steps }.run(ctx).await
    }
}

impl<C: Send + 'static> Default for Pipeline<C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Standard failure handling: re-runs the rest of the pipeline until it
/// succeeds or `max_deliveries` attempts were made, then gives up with the
/// last error.
#[derive(Debug, Clone, Copy)]
pub struct DefaultRetryStep {
    max_deliveries: usize,
}

impl DefaultRetryStep {
    pub fn new(max_deliveries: usize) -> Self {
        Self {
            max_deliveries: max_deliveries.max(1),
        }
    }
}

impl Default for DefaultRetryStep {
    fn default() -> Self {
        Self::new(5)
    }
}

#[async_trait]
impl<C: Send + 'static> IncomingStep<C> for DefaultRetryStep {
    fn name(&self) -> &str {
        DEFAULT_RETRY_STEP
    }

    async fn process(&self, ctx: &mut IncomingContext<C>, next: Next<'_, C>) -> OutboxResult<()> {
        let mut delivery = 1;
        loop {
            match next.run(ctx).await {
                Ok(()) => return Ok(()),
                Err(err) if delivery >= self.max_deliveries => {
                    warn!(
                        message_id = %ctx.message_id(),
                        deliveries = delivery,
                        error = %err,
                        "Giving up on incoming message"
                    );
                    return Err(err);
                }
                Err(err) => {
                    warn!(
                        message_id = %ctx.message_id(),
                        delivery,
                        error = %err,
                        "Incoming message handling failed"
                    );
                    delivery += 1;
                }
            }
        }
    }
}
