//! ferry-core
//!
//! Transactional outbox for a message-processing runtime.
//!
//! Messages sent while an incoming message is handled are written to a
//! staging store in the same transaction as the business change, then
//! forwarded to the transport in the background.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, message, schedule, errors）
//! - **ports**: 抽象化レイヤー（OutboxStorage, Transport, Clock, Timer）
//! - **app**: エンジン（forwarder, decorator, incoming step, builder）
//! - **impls**: 実装（InMemoryOutboxStorage, InMemoryTransport など開発用）

pub mod app;
pub mod domain;
pub mod impls;
pub mod ports;

pub use app::{
    BuildError, IncomingContext, IncomingStep, Next, Outbox, OutboxBuilder, OutboxComponents,
    OutboxForwarder, OutboxIncomingStep, OutboxOptions, OutboxTransportDecorator, Pipeline,
    Retrier, SendStrategy,
};
pub use domain::{
    CorrelationId, MessageId, OutboxError, OutboxMessage, OutboxResult, RetrySchedule,
    TransportMessage,
};
