//! Canonical wire format wrapping user messages with event metadata.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::Error;

/// JSON envelope carried on every events subject.
///
/// `event_id` doubles as the broker message-id for publish deduplication.
/// Unknown top-level fields are preserved in `extra` so foreign producers can
/// extend the envelope; strict decode mode rejects them instead.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Envelope {
    pub event_id: Uuid,
    pub schema_version: u32,
    pub topic: String,
    pub producer: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_type: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,

    /// The user value. `payload` is accepted as an alias on decode.
    #[serde(default, alias = "payload")]
    pub message: Value,

    #[serde(flatten, default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, Value>,
}

impl Envelope {
    /// Fresh envelope with a v4 `event_id` and `occurred_at = now`.
    pub fn new(topic: impl Into<String>, producer: impl Into<String>, message: Value) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            schema_version: 1,
            topic: topic.into(),
            producer: producer.into(),
            occurred_at: OffsetDateTime::now_utc(),
            trace_id: None,
            correlation_id: None,
            message_type: None,
            domain: None,
            resource: None,
            action: None,
            resource_id: None,
            message,
            extra: BTreeMap::new(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, Error> {
        serde_json::to_vec(self).map_err(|e| Error::publish(format!("encode envelope: {e}")))
    }

    /// Decodes an envelope, enforcing the required field set.
    ///
    /// With `strict` set, unknown top-level fields fail the decode instead of
    /// being preserved.
    pub fn decode(bytes: &[u8], strict: bool) -> Result<Self, Error> {
        let envelope: Envelope = serde_json::from_slice(bytes)
            .map_err(|e| Error::malformed(format!("decode envelope: {e}")))?;
        if envelope.schema_version < 1 {
            return Err(Error::malformed(format!(
                "schema_version {} must be >= 1",
                envelope.schema_version
            )));
        }
        if envelope.topic.is_empty() {
            return Err(Error::malformed("topic must not be empty"));
        }
        if strict && !envelope.extra.is_empty() {
            let keys: Vec<&str> = envelope.extra.keys().map(String::as_str).collect();
            return Err(Error::malformed(format!(
                "unknown envelope fields: {}",
                keys.join(", ")
            )));
        }
        Ok(envelope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> Envelope {
        let mut e = Envelope::new("users.user.created", "app1", json!({"id": "u1"}));
        e.trace_id = Some("trace-1".into());
        e.domain = Some("users".into());
        e.resource = Some("user".into());
        e.action = Some("created".into());
        e
    }

    #[test]
    fn roundtrips() {
        let e = sample();
        let bytes = e.encode().unwrap();
        let back = Envelope::decode(&bytes, true).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn accepts_payload_alias() {
        let bytes = serde_json::to_vec(&json!({
            "event_id": Uuid::new_v4(),
            "schema_version": 2,
            "topic": "orders.order.placed",
            "producer": "shop",
            "occurred_at": "2025-06-01T12:00:00Z",
            "payload": {"id": "o1"},
        }))
        .unwrap();
        let e = Envelope::decode(&bytes, true).unwrap();
        assert_eq!(e.message, json!({"id": "o1"}));
        assert_eq!(e.schema_version, 2);
    }

    #[test]
    fn missing_required_fields_are_malformed() {
        let bytes = serde_json::to_vec(&json!({"topic": "t", "message": 1})).unwrap();
        let err = Envelope::decode(&bytes, false).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));

        let err = Envelope::decode(b"not json", false).unwrap_err();
        assert!(matches!(err, Error::Malformed(_)));
    }

    #[test]
    fn zero_schema_version_is_rejected() {
        let bytes = serde_json::to_vec(&json!({
            "event_id": Uuid::new_v4(),
            "schema_version": 0,
            "topic": "t.x",
            "producer": "p",
            "occurred_at": "2025-06-01T12:00:00Z",
        }))
        .unwrap();
        assert!(Envelope::decode(&bytes, false).is_err());
    }

    #[test]
    fn strict_mode_rejects_unknown_fields() {
        let bytes = serde_json::to_vec(&json!({
            "event_id": Uuid::new_v4(),
            "schema_version": 1,
            "topic": "t.x",
            "producer": "p",
            "occurred_at": "2025-06-01T12:00:00Z",
            "message": 1,
            "shard": 7,
        }))
        .unwrap();

        let lenient = Envelope::decode(&bytes, false).unwrap();
        assert_eq!(lenient.extra.get("shard"), Some(&json!(7)));

        let err = Envelope::decode(&bytes, true).unwrap_err();
        assert!(err.to_string().contains("shard"));
    }

    #[test]
    fn scalar_messages_are_legal() {
        let mut e = Envelope::new("metrics.tick", "app1", json!(42));
        e.message_type = Some("counter".into());
        let back = Envelope::decode(&e.encode().unwrap(), true).unwrap();
        assert_eq!(back.message, json!(42));
    }
}
