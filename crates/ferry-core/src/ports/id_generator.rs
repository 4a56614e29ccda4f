//! IdGenerator port - message id generation.

use crate::domain::MessageId;
use crate::ports::Clock;
use ulid::Ulid;

/// Generates ids for staged messages.
///
/// `Send + Sync` because one generator is shared by every concurrent handler.
pub trait IdGenerator: Send + Sync {
    fn generate_message_id(&self) -> MessageId;
}

/// ULID generator whose timestamp part comes from a `Clock`.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_message_id(&self) -> MessageId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        MessageId::from(ulid)
    }
}
