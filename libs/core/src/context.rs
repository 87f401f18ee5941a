//! Per-delivery metadata handed to middleware and subscribers.

use time::OffsetDateTime;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::ErrorKind;

/// Everything a handler may want to know about a delivery besides the payload.
#[derive(Debug, Clone)]
pub struct MessageContext {
    pub subject: String,
    pub stream: String,
    pub stream_seq: u64,
    /// 1-based delivery attempt reported by the broker.
    pub deliveries: i64,

    pub event_id: Uuid,
    pub topic: String,
    pub producer: String,
    pub schema_version: u32,
    pub occurred_at: OffsetDateTime,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub message_type: Option<String>,
    pub domain: Option<String>,
    pub resource: Option<String>,
    pub action: Option<String>,
    pub resource_id: Option<String>,
}

impl MessageContext {
    pub fn from_envelope(
        envelope: &Envelope,
        subject: impl Into<String>,
        stream: impl Into<String>,
        stream_seq: u64,
        deliveries: i64,
    ) -> Self {
        Self {
            subject: subject.into(),
            stream: stream.into(),
            stream_seq,
            deliveries,
            event_id: envelope.event_id,
            topic: envelope.topic.clone(),
            producer: envelope.producer.clone(),
            schema_version: envelope.schema_version,
            occurred_at: envelope.occurred_at,
            trace_id: envelope.trace_id.clone(),
            correlation_id: envelope.correlation_id.clone(),
            message_type: envelope.message_type.clone(),
            domain: envelope.domain.clone(),
            resource: envelope.resource.clone(),
            action: envelope.action.clone(),
            resource_id: envelope.resource_id.clone(),
        }
    }
}

/// Context passed to a subscriber's `on_error` override.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub error: String,
    pub kind: ErrorKind,
    pub attempt: i64,
    pub max_attempts: i64,
    pub message: MessageContext,
}
