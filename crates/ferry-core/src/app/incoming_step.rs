//! OutboxIncomingStep - scopes a storage transaction around handling.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::forwarder::EagerSend;
use super::pipeline::{IncomingContext, IncomingStep, Next};
use super::transaction::TransactionContext;
use crate::domain::{CorrelationId, OutboxError, OutboxResult};
use crate::ports::{OutboxConnection, OutboxStorage};

pub const OUTBOX_INCOMING_STEP: &str = "OutboxIncomingStep";

/// Pipeline step that gives downstream handling an open transaction.
///
/// # Flow
/// 1. open a storage connection, install a `TransactionContext` whose
///    correlation id is the incoming message id
/// 2. run the rest of the pipeline
/// 3. success: commit, then hand the staged ids to the eager path
/// 4. failure: roll back and return the downstream error unchanged
pub struct OutboxIncomingStep<S> {
    storage: Arc<S>,
    eager: Arc<dyn EagerSend>,
}

impl<S: OutboxStorage> OutboxIncomingStep<S> {
    pub fn new(storage: Arc<S>, eager: Arc<dyn EagerSend>) -> Self {
        Self { storage, eager }
    }
}

#[async_trait]
impl<S: OutboxStorage> IncomingStep<S::Connection> for OutboxIncomingStep<S> {
    fn name(&self) -> &str {
        OUTBOX_INCOMING_STEP
    }

    async fn process(
        &self,
        ctx: &mut IncomingContext<S::Connection>,
        next: Next<'_, S::Connection>,
    ) -> OutboxResult<()> {
        // already inside a transaction (step installed twice): join it
        if ctx.transaction().is_some() {
            return next.run(ctx).await;
        }

        let connection = self.storage.open_connection().await?;
        let correlation = CorrelationId::from(ctx.message_id());
        ctx.begin_transaction(TransactionContext::new(correlation, connection));

        let result = next.run(ctx).await;

        let Some(transaction) = ctx.end_transaction() else {
            return Err(OutboxError::InvalidConfiguration(
                "transaction context was removed during handling".to_string(),
            ));
        };
        let (correlation, connection, staged) = transaction.into_parts();

        match result {
            Ok(()) => {
                connection.commit().await?;
                debug!(
                    correlation_id = %correlation,
                    count = staged.len(),
                    "Committed incoming transaction"
                );
                ctx.set_eager_send(self.eager.try_eager_send(correlation, staged));
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = connection.rollback().await {
                    warn!(
                        correlation_id = %correlation,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                debug!(
                    correlation_id = %correlation,
                    discarded = staged.len(),
                    "Rolled back incoming transaction"
                );
                Err(err)
            }
        }
    }
}
