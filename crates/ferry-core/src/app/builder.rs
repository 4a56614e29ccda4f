//! OutboxBuilder - outbox のワイヤリング
//!
//! Collaborators are passed in explicitly; `build` validates everything
//! before any background task exists (fail-fast).

use std::sync::Arc;

use super::decorator::OutboxTransportDecorator;
use super::forwarder::{EagerSend, OutboxForwarder};
use super::incoming_step::OutboxIncomingStep;
use super::options::OutboxOptions;
use super::pipeline::{DEFAULT_RETRY_STEP, Pipeline};
use super::retrier::Retrier;
use crate::domain::OutboxError;
use crate::ports::{Clock, OutboxStorage, Transport};

/// Wiring errors.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    InvalidConfiguration(#[from] OutboxError),

    #[error("Pipeline has no `{0}` step; the outbox step must be placed after it.")]
    MissingRetryStep(String),
}

/// Builds the outbox subsystem around a transport.
///
/// # 使用例
/// ```ignore
/// let outbox = OutboxBuilder::new(transport)
///     .storage(storage)
///     .options(OutboxOptions::default())
///     .build()?;
/// if let Outbox::Enabled(components) = &outbox {
///     components.install(&mut pipeline)?;
///     components.forwarder.start();
/// }
/// ```
pub struct OutboxBuilder<S, T> {
    transport: Arc<T>,
    storage: Option<Arc<S>>,
    options: OutboxOptions,
    retrier: Option<Retrier>,
    clock: Option<Arc<dyn Clock>>,
}

impl<S, T> OutboxBuilder<S, T>
where
    S: OutboxStorage,
    T: Transport,
{
    pub fn new(transport: Arc<T>) -> Self {
        Self {
            transport,
            storage: None,
            options: OutboxOptions::default(),
            retrier: None,
            clock: None,
        }
    }

    /// Storage backend. Without one the outbox is disabled.
    pub fn storage(mut self, storage: Arc<S>) -> Self {
        self.storage = Some(storage);
        self
    }

    pub fn options(mut self, options: OutboxOptions) -> Self {
        self.options = options;
        self
    }

    pub fn retrier(mut self, retrier: Retrier) -> Self {
        self.retrier = Some(retrier);
        self
    }

    /// Clock used for staged message timestamps.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn build(self) -> Result<Outbox<S, T>, BuildError> {
        self.options.validate()?;

        let Some(storage) = self.storage else {
            return Ok(Outbox::Disabled {
                transport: self.transport,
            });
        };

        let forwarder = Arc::new(OutboxForwarder::with_retrier(
            Arc::clone(&storage),
            Arc::clone(&self.transport),
            self.options,
            self.retrier.unwrap_or_default(),
        )?);

        let mut decorator = OutboxTransportDecorator::new(self.transport, Arc::clone(&storage));
        if let Some(clock) = self.clock {
            decorator = decorator.with_clock(clock);
        }

        let step = Arc::new(OutboxIncomingStep::new(
            storage,
            Arc::clone(&forwarder) as Arc<dyn EagerSend>,
        ));

        Ok(Outbox::Enabled(OutboxComponents {
            forwarder,
            transport: Arc::new(decorator),
            step,
        }))
    }
}

/// Result of `OutboxBuilder::build`.
pub enum Outbox<S, T> {
    Enabled(OutboxComponents<S, T>),
    /// No storage configured: use the bare transport.
    Disabled { transport: Arc<T> },
}

impl<S, T> Outbox<S, T> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Outbox::Enabled(_))
    }
}

/// The wired parts of an enabled outbox.
pub struct OutboxComponents<S, T> {
    pub forwarder: Arc<OutboxForwarder<S, T>>,
    pub transport: Arc<OutboxTransportDecorator<S, T>>,
    pub step: Arc<OutboxIncomingStep<S>>,
}

impl<S, T> OutboxComponents<S, T>
where
    S: OutboxStorage,
    T: Transport,
{
    /// Place the incoming step directly after the default retry step.
    pub fn install(&self, pipeline: &mut Pipeline<S::Connection>) -> Result<(), BuildError> {
        pipeline
            .insert_after(DEFAULT_RETRY_STEP, Arc::clone(&self.step) as _)
            .map_err(|_| BuildError::MissingRetryStep(DEFAULT_RETRY_STEP.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::incoming_step::OUTBOX_INCOMING_STEP;
    use crate::app::pipeline::DefaultRetryStep;
    use crate::impls::{InMemoryConnection, InMemoryOutboxStorage, InMemoryTransport};

    type Builder = OutboxBuilder<InMemoryOutboxStorage, InMemoryTransport>;

    #[tokio::test]
    async fn build_with_storage_enables_outbox() {
        let outbox = Builder::new(Arc::new(InMemoryTransport::new()))
            .storage(Arc::new(InMemoryOutboxStorage::new()))
            .build()
            .unwrap();

        assert!(outbox.is_enabled());
    }

    #[test]
    fn build_without_storage_disables_outbox() {
        let transport = Arc::new(InMemoryTransport::new());
        let outbox = Builder::new(Arc::clone(&transport)).build().unwrap();

        match outbox {
            Outbox::Disabled { transport: bare } => assert!(Arc::ptr_eq(&bare, &transport)),
            Outbox::Enabled(_) => panic!("outbox should be disabled without storage"),
        }
    }

    #[test]
    fn build_rejects_invalid_interval() {
        let options = OutboxOptions {
            forward_interval_secs: -1,
            ..OutboxOptions::default()
        };
        let result = Builder::new(Arc::new(InMemoryTransport::new()))
            .storage(Arc::new(InMemoryOutboxStorage::new()))
            .options(options)
            .build();

        assert!(matches!(
            result,
            Err(BuildError::InvalidConfiguration(OutboxError::InvalidConfiguration(_)))
        ));
    }

    #[tokio::test]
    async fn install_places_step_after_retry_step() {
        let outbox = Builder::new(Arc::new(InMemoryTransport::new()))
            .storage(Arc::new(InMemoryOutboxStorage::new()))
            .build()
            .unwrap();
        let Outbox::Enabled(components) = outbox else {
            panic!("expected enabled outbox");
        };

        let mut pipeline: Pipeline<InMemoryConnection> = Pipeline::new();
        pipeline.push(Arc::new(DefaultRetryStep::default()));
        components.install(&mut pipeline).unwrap();

        assert_eq!(
            pipeline.step_names(),
            vec![DEFAULT_RETRY_STEP, OUTBOX_INCOMING_STEP]
        );
    }

    #[tokio::test]
    async fn install_without_retry_step_fails() {
        let outbox = Builder::new(Arc::new(InMemoryTransport::new()))
            .storage(Arc::new(InMemoryOutboxStorage::new()))
            .build()
            .unwrap();
        let Outbox::Enabled(components) = outbox else {
            panic!("expected enabled outbox");
        };

        let mut pipeline: Pipeline<InMemoryConnection> = Pipeline::new();
        assert!(matches!(
            components.install(&mut pipeline),
            Err(BuildError::MissingRetryStep(_))
        ));
    }
}
