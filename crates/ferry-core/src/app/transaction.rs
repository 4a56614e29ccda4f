//! TransactionContext - ties one incoming-message transaction to its open
//! storage connection.

use crate::domain::{CorrelationId, MessageId};

/// Created by the incoming step when handling starts, handed to every
/// outbound send made during handling, consumed when the step commits or
/// rolls back.
#[derive(Debug)]
pub struct TransactionContext<C> {
    correlation_id: CorrelationId,
    connection: C,
    staged: Vec<MessageId>,
}

impl<C> TransactionContext<C> {
    pub fn new(correlation_id: CorrelationId, connection: C) -> Self {
        Self {
            correlation_id,
            connection,
            staged: Vec::new(),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// The open connection. Handlers use it for their own business writes so
    /// they commit together with the staged messages.
    pub fn connection_mut(&mut self) -> &mut C {
        &mut self.connection
    }

    /// Ids of messages staged through this context, in staging order.
    pub fn staged(&self) -> &[MessageId] {
        &self.staged
    }

    pub(crate) fn record_staged(&mut self, id: MessageId) {
        self.staged.push(id);
    }

    /// Split into correlation id, connection and staged ids so the caller can
    /// commit or roll back.
    pub fn into_parts(self) -> (CorrelationId, C, Vec<MessageId>) {
        (self.correlation_id, self.connection, self.staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    #[test]
    fn staged_ids_keep_order() {
        let mut ctx = TransactionContext::new(CorrelationId::new("C"), ());
        let first = MessageId::from_ulid(Ulid::new());
        let second = MessageId::from_ulid(Ulid::new());

        ctx.record_staged(first);
        ctx.record_staged(second);

        assert_eq!(ctx.staged(), &[first, second]);
        let (correlation, (), staged) = ctx.into_parts();
        assert_eq!(correlation, CorrelationId::new("C"));
        assert_eq!(staged.len(), 2);
    }
}
