//! Transport port - the outbound network send path.

use async_trait::async_trait;
use ulid::Ulid;

use crate::domain::{OutboxResult, TransportMessage};

/// A transactional send scope.
///
/// Transports may buffer sends made under a scope and only hand them to the
/// wire when the scope is committed. The forwarder opens one scope per batch
/// and commits it after every message in the batch was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SendScope {
    id: Ulid,
}

impl SendScope {
    pub fn new() -> Self {
        Self { id: Ulid::new() }
    }

    pub fn id(&self) -> Ulid {
        self.id
    }
}

impl Default for SendScope {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Submit `message` for `destination` under `scope`.
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: &SendScope,
    ) -> OutboxResult<()>;

    /// Commit everything submitted under `scope`.
    async fn commit(&self, scope: SendScope) -> OutboxResult<()> {
        let _ = scope;
        Ok(())
    }
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for std::sync::Arc<T> {
    async fn send(
        &self,
        destination: &str,
        message: TransportMessage,
        scope: &SendScope,
    ) -> OutboxResult<()> {
        (**self).send(destination, message, scope).await
    }

    async fn commit(&self, scope: SendScope) -> OutboxResult<()> {
        (**self).commit(scope).await
    }
}
