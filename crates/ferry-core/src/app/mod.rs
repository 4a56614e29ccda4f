//! App - アプリケーション層
//!
//! The outbox engine, built from the ports.
//!
//! # 主要コンポーネント
//! - **Retrier**: fixed-schedule retries for transport sends
//! - **PeriodicTask**: cancellable repeating job (forward loop, cleanup loop)
//! - **OutboxForwarder**: batch leasing, sending, eager path, cleanup
//! - **OutboxTransportDecorator**: stages sends made inside a transaction
//! - **OutboxIncomingStep** / **Pipeline**: transaction scope around handling
//! - **OutboxBuilder**: wiring and fail-fast validation

pub mod builder;
pub mod decorator;
pub mod forwarder;
pub mod incoming_step;
pub mod options;
pub mod periodic;
pub mod pipeline;
pub mod retrier;
pub mod transaction;

// 主要な型を再エクスポート
pub use self::builder::{BuildError, Outbox, OutboxBuilder, OutboxComponents};
pub use self::decorator::{OutboxTransportDecorator, SendStrategy};
pub use self::forwarder::{EagerSend, ForwarderStats, ForwarderStatsSnapshot, OutboxForwarder};
pub use self::incoming_step::{OUTBOX_INCOMING_STEP, OutboxIncomingStep};
pub use self::options::OutboxOptions;
pub use self::periodic::PeriodicTask;
pub use self::pipeline::{
    DEFAULT_RETRY_STEP, DefaultRetryStep, IncomingContext, IncomingStep, Next, Pipeline,
};
pub use self::retrier::Retrier;
pub use self::transaction::TransactionContext;
