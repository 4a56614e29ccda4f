//! Message model: what the transport carries and what the outbox stages.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{CorrelationId, MessageId};

/// A message as the transport sees it: headers plus an opaque body.
///
/// Serialization and routing happen before this point; the outbox never looks
/// inside `body`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TransportMessage {
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl TransportMessage {
    pub fn new(headers: HashMap<String, String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            headers,
            body: body.into(),
        }
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// One staged outgoing message.
///
/// Lifecycle:
/// - created by the transport decorator inside an open transaction
/// - `sent_at` assigned exactly once, when the batch holding it completes
/// - purged by the cleanup loop afterwards
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxMessage {
    pub id: MessageId,
    pub destination: String,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxMessage {
    pub fn new(
        id: MessageId,
        destination: impl Into<String>,
        message: TransportMessage,
        correlation_id: CorrelationId,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            destination: destination.into(),
            headers: message.headers,
            body: message.body,
            correlation_id,
            created_at,
            sent_at: None,
        }
    }

    /// Rebuild the transport-level message for forwarding.
    pub fn to_transport_message(&self) -> TransportMessage {
        TransportMessage {
            headers: self.headers.clone(),
            body: self.body.clone(),
        }
    }

    pub fn is_sent(&self) -> bool {
        self.sent_at.is_some()
    }

    /// Stamp the sent time. Returns `false` (and leaves the stamp untouched)
    /// when the message was already marked.
    pub fn mark_sent(&mut self, at: DateTime<Utc>) -> bool {
        if self.sent_at.is_some() {
            return false;
        }
        self.sent_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ulid::Ulid;

    fn staged() -> OutboxMessage {
        let created = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        OutboxMessage::new(
            MessageId::from_ulid(Ulid::new()),
            "A",
            TransportMessage::default()
                .with_header("rbs2-msg-type", "Greeting")
                .with_header("rbs2-content-type", "text/plain"),
            CorrelationId::new("C"),
            created,
        )
    }

    #[test]
    fn transport_message_is_rebuilt_from_staged_fields() {
        let mut msg = staged();
        msg.body = b"hello".to_vec();

        let transport = msg.to_transport_message();
        assert_eq!(transport.header("rbs2-msg-type"), Some("Greeting"));
        assert_eq!(transport.body, b"hello");
    }

    #[test]
    fn sent_timestamp_is_set_at_most_once() {
        let mut msg = staged();
        let first = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 1).unwrap();
        let second = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 2).unwrap();

        assert!(!msg.is_sent());
        assert!(msg.mark_sent(first));
        assert!(!msg.mark_sent(second));
        assert_eq!(msg.sent_at, Some(first));
    }
}
