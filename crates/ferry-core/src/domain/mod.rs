//! Domain model (ids, messages, retry schedule, errors).

pub mod errors;
pub mod ids;
pub mod message;
pub mod schedule;

pub use self::errors::{OutboxError, OutboxResult};
pub use self::ids::{CorrelationId, Id, IdMarker, MessageId};
pub use self::message::{OutboxMessage, TransportMessage};
pub use self::schedule::RetrySchedule;
