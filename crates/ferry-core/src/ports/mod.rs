//! Ports - seams to the collaborators this crate does not own.
//!
//! Storage engines and transports are implemented elsewhere; `impls` only
//! carries in-memory versions for tests and local runs.

pub mod clock;
pub mod id_generator;
pub mod outbox_storage;
pub mod timer;
pub mod transport;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::outbox_storage::{CleanupPolicy, OutboxBatch, OutboxConnection, OutboxStorage};
pub use self::timer::{Timer, TokioTimer};
pub use self::transport::{SendScope, Transport};
