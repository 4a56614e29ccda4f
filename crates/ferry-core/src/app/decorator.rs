//! OutboxTransportDecorator - redirects in-flight sends into the outbox.

use std::sync::Arc;

use tracing::debug;

use super::transaction::TransactionContext;
use crate::domain::{OutboxMessage, OutboxResult, TransportMessage};
use crate::ports::{
    Clock, IdGenerator, OutboxStorage, SendScope, SystemClock, Transport, UlidGenerator,
};

/// How a single send is carried out.
///
/// Chosen per call from whether the caller holds an active
/// `TransactionContext`; there is no ambient state.
pub enum SendStrategy<'a, C> {
    /// No incoming-message transaction: hand the message to the transport.
    Direct,
    /// Inside incoming-message handling: stage the message in the outbox.
    Staged(&'a mut TransactionContext<C>),
}

impl<'a, C> From<Option<&'a mut TransactionContext<C>>> for SendStrategy<'a, C> {
    fn from(context: Option<&'a mut TransactionContext<C>>) -> Self {
        match context {
            Some(context) => SendStrategy::Staged(context),
            None => SendStrategy::Direct,
        }
    }
}

/// Wraps a transport. Staged sends are written to storage under the
/// caller's transaction; direct sends pass through unchanged.
///
/// Not a `Transport` itself; every send goes through `dispatch`.
pub struct OutboxTransportDecorator<S, T> {
    inner: Arc<T>,
    storage: Arc<S>,
    ids: Arc<dyn IdGenerator>,
    clock: Arc<dyn Clock>,
}

impl<S, T> OutboxTransportDecorator<S, T>
where
    S: OutboxStorage,
    T: Transport,
{
    pub fn new(inner: Arc<T>, storage: Arc<S>) -> Self {
        Self {
            inner,
            storage,
            ids: Arc::new(UlidGenerator::new(SystemClock)),
            clock: Arc::new(SystemClock),
        }
    }

    /// Use `clock` for `created_at` stamps and for the id timestamp part.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.ids = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        self.clock = clock;
        self
    }

    pub fn inner(&self) -> &Arc<T> {
        &self.inner
    }

    /// Send under `strategy`: straight to the wrapped transport, or staged in
    /// the outbox under the caller's transaction.
    pub async fn dispatch(
        &self,
        destination: &str,
        message: TransportMessage,
        strategy: SendStrategy<'_, S::Connection>,
        scope: &SendScope,
    ) -> OutboxResult<()> {
        match strategy {
            SendStrategy::Direct => self.inner.send(destination, message, scope).await,
            SendStrategy::Staged(context) => {
                let staged = OutboxMessage::new(
                    self.ids.generate_message_id(),
                    destination,
                    message,
                    context.correlation_id().clone(),
                    self.clock.now(),
                );
                let id = staged.id;

                self.storage
                    .write(context.connection_mut(), vec![staged])
                    .await?;
                context.record_staged(id);

                debug!(
                    message_id = %id,
                    destination = %destination,
                    correlation_id = %context.correlation_id(),
                    "Staged outgoing message in outbox"
                );
                Ok(())
            }
        }
    }
}
