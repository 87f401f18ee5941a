//! Envelope construction and broker publishing.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_nats::jetstream;
use async_trait::async_trait;
use metrics::counter;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use crate::envelope::Envelope;
use crate::error::Error;
use crate::outbox::{NewOutboxRecord, OutboxTx};
use crate::subject;

/// Header carrying the broker-side dedup key.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";

/// Outcome of one wire publish.
#[derive(Debug, Clone, Copy)]
pub struct WireAck {
    pub stream_seq: u64,
    /// Set when the broker's dedup window already saw this message-id.
    pub duplicate: bool,
}

/// Narrow seam over JetStream publishing, so the relay and the tests run
/// without a broker.
#[async_trait]
pub trait WirePublisher: Send + Sync {
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        headers: &BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<WireAck, Error>;
}

/// The real thing.
pub struct JetStreamPublisher {
    js: jetstream::Context,
}

impl JetStreamPublisher {
    pub fn new(js: jetstream::Context) -> Self {
        Self { js }
    }
}

#[async_trait]
impl WirePublisher for JetStreamPublisher {
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        headers: &BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<WireAck, Error> {
        let mut header_map = async_nats::HeaderMap::new();
        header_map.insert(MSG_ID_HEADER, msg_id);
        for (name, value) in headers {
            header_map.insert(name.as_str(), value.as_str());
        }
        let ack = self
            .js
            .publish_with_headers(subject.to_string(), header_map, payload.into())
            .await
            .map_err(|e| Error::publish(format!("publish to {subject}: {e}")))?
            .await
            .map_err(|e| Error::publish(format!("await ack for {subject}: {e}")))?;
        Ok(WireAck {
            stream_seq: ack.sequence,
            duplicate: ack.duplicate,
        })
    }
}

/// Caller-facing options for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    pub event_id: Option<Uuid>,
    pub trace_id: Option<String>,
    pub correlation_id: Option<String>,
    pub occurred_at: Option<OffsetDateTime>,
    pub message_type: Option<String>,
    pub schema_version: Option<u32>,
    /// Extra wire headers; the message-id header is always set by the engine.
    pub headers: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishStatus {
    /// Accepted by the broker.
    Published,
    /// Staged in the outbox; the relay delivers it after commit.
    Pending,
}

#[derive(Debug, Clone)]
pub struct PublishResult {
    pub event_id: Uuid,
    pub status: PublishStatus,
    pub duplicate: bool,
    pub stream_seq: Option<u64>,
}

/// Builds envelopes and hands them to the wire or the outbox.
#[derive(Clone)]
pub struct Publisher {
    env: String,
    app: String,
    wire: Arc<dyn WirePublisher>,
}

impl Publisher {
    pub fn new(env: impl Into<String>, app: impl Into<String>, wire: Arc<dyn WirePublisher>) -> Self {
        Self {
            env: env.into(),
            app: app.into(),
            wire,
        }
    }

    /// Stamps missing envelope fields and computes the wire subject.
    fn build(
        &self,
        topic: &str,
        message: Value,
        options: &PublishOptions,
    ) -> Result<(String, Envelope), Error> {
        let topic = subject::normalize(topic);
        let wire_subject = subject::build(&self.env, &self.app, &topic)?;
        let mut envelope = Envelope::new(topic, self.app.clone(), message);
        if let Some(event_id) = options.event_id {
            envelope.event_id = event_id;
        }
        if let Some(at) = options.occurred_at {
            envelope.occurred_at = at;
        }
        if let Some(version) = options.schema_version {
            if version < 1 {
                return Err(Error::publish("schema_version must be >= 1"));
            }
            envelope.schema_version = version;
        }
        envelope.trace_id = options.trace_id.clone();
        envelope.correlation_id = options.correlation_id.clone();
        envelope.message_type = options.message_type.clone();
        Ok((wire_subject, envelope))
    }

    /// Publishes one event directly to the broker.
    ///
    /// The envelope's `event_id` rides in the message-id header, so the
    /// broker's dedup window suppresses replays of the same logical event.
    pub async fn publish(
        &self,
        topic: &str,
        message: Value,
        options: PublishOptions,
    ) -> Result<PublishResult, Error> {
        let (wire_subject, envelope) = self.build(topic, message, &options)?;
        self.publish_envelope(&wire_subject, &envelope, &options.headers)
            .await
    }

    /// Domain/resource/action convenience form: topic is
    /// `{domain}.{resource}.{action}` and the triple rides in the envelope.
    pub async fn publish_resource(
        &self,
        domain: &str,
        resource: &str,
        action: &str,
        resource_id: Option<&str>,
        message: Value,
        options: PublishOptions,
    ) -> Result<PublishResult, Error> {
        let topic = format!("{domain}.{resource}.{action}");
        let (wire_subject, mut envelope) = self.build(&topic, message, &options)?;
        envelope.domain = Some(subject::normalize(domain));
        envelope.resource = Some(subject::normalize(resource));
        envelope.action = Some(subject::normalize(action));
        envelope.resource_id = resource_id.map(String::from);
        self.publish_envelope(&wire_subject, &envelope, &options.headers)
            .await
    }

    async fn publish_envelope(
        &self,
        wire_subject: &str,
        envelope: &Envelope,
        headers: &BTreeMap<String, String>,
    ) -> Result<PublishResult, Error> {
        let payload = envelope.encode()?;
        let msg_id = envelope.event_id.to_string();
        let ack = self
            .wire
            .publish(wire_subject, &msg_id, headers, payload)
            .await?;
        counter!("courier_published_total", "topic" => envelope.topic.clone()).increment(1);
        if ack.duplicate {
            counter!("courier_publish_duplicate_total", "topic" => envelope.topic.clone())
                .increment(1);
        }
        debug!(
            subject = %wire_subject,
            event_id = %envelope.event_id,
            duplicate = ack.duplicate,
            "event published"
        );
        Ok(PublishResult {
            event_id: envelope.event_id,
            status: PublishStatus::Published,
            duplicate: ack.duplicate,
            stream_seq: Some(ack.stream_seq),
        })
    }

    /// Stages one event into the caller's transaction instead of touching the
    /// broker; the outbox relay delivers it iff the transaction commits.
    pub async fn publish_staged(
        &self,
        tx: &mut dyn OutboxTx,
        topic: &str,
        message: Value,
        options: PublishOptions,
    ) -> Result<PublishResult, Error> {
        let (wire_subject, envelope) = self.build(topic, message, &options)?;
        let record = NewOutboxRecord {
            event_id: envelope.event_id,
            subject: wire_subject,
            payload: envelope.encode()?,
            headers: options.headers.clone(),
        };
        tx.stage(record).await?;
        counter!("courier_outbox_staged_total", "topic" => envelope.topic.clone()).increment(1);
        Ok(PublishResult {
            event_id: envelope.event_id,
            status: PublishStatus::Pending,
            duplicate: false,
            stream_seq: None,
        })
    }

    /// Starts a batch sharing one `trace_id` across its entries.
    pub fn batch(&self) -> PublishBatch {
        PublishBatch {
            publisher: self.clone(),
            trace_id: Uuid::new_v4().to_string(),
            entries: Vec::new(),
        }
    }
}

struct BatchEntry {
    topic: String,
    message: Value,
    options: PublishOptions,
}

/// Accumulates entries, then publishes them with a shared `trace_id`.
///
/// Against the broker the batch is best-effort with per-entry results; staged
/// into an outbox transaction it is all-or-nothing with the transaction.
pub struct PublishBatch {
    publisher: Publisher,
    trace_id: String,
    entries: Vec<BatchEntry>,
}

#[derive(Debug)]
pub struct BatchOutcome {
    pub topic: String,
    pub result: Result<PublishResult, Error>,
}

impl PublishBatch {
    pub fn add(mut self, topic: impl Into<String>, message: Value, mut options: PublishOptions) -> Self {
        options.trace_id.get_or_insert_with(|| self.trace_id.clone());
        self.entries.push(BatchEntry {
            topic: topic.into(),
            message,
            options,
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn publish(self) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let result = self
                .publisher
                .publish(&entry.topic, entry.message, entry.options)
                .await;
            outcomes.push(BatchOutcome {
                topic: entry.topic,
                result,
            });
        }
        outcomes
    }

    /// Stages the whole batch into one transaction; the first failure aborts
    /// and the caller rolls back, keeping all-or-nothing semantics.
    pub async fn stage(self, tx: &mut dyn OutboxTx) -> Result<Vec<PublishResult>, Error> {
        let mut results = Vec::with_capacity(self.entries.len());
        for entry in self.entries {
            let result = self
                .publisher
                .publish_staged(tx, &entry.topic, entry.message, entry.options)
                .await?;
            results.push(result);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeWire {
        published: Mutex<Vec<(String, String, Vec<u8>)>>,
        seen_ids: Mutex<std::collections::HashSet<String>>,
        fail: bool,
    }

    #[async_trait]
    impl WirePublisher for FakeWire {
        async fn publish(
            &self,
            subject: &str,
            msg_id: &str,
            _headers: &BTreeMap<String, String>,
            payload: Vec<u8>,
        ) -> Result<WireAck, Error> {
            if self.fail {
                return Err(Error::publish("broker unavailable"));
            }
            let duplicate = !self.seen_ids.lock().unwrap().insert(msg_id.to_string());
            let mut published = self.published.lock().unwrap();
            published.push((subject.to_string(), msg_id.to_string(), payload));
            Ok(WireAck {
                stream_seq: published.len() as u64,
                duplicate,
            })
        }
    }

    fn publisher(wire: Arc<FakeWire>) -> Publisher {
        Publisher::new("test", "app1", wire)
    }

    #[tokio::test]
    async fn publishes_with_event_id_as_msg_id() {
        let wire = Arc::new(FakeWire::default());
        let result = publisher(wire.clone())
            .publish("users.user.created", serde_json::json!({"id": "u1"}), PublishOptions::default())
            .await
            .unwrap();

        assert_eq!(result.status, PublishStatus::Published);
        assert!(!result.duplicate);
        let published = wire.published.lock().unwrap();
        let (subject, msg_id, payload) = &published[0];
        assert_eq!(subject, "test.app1.users.user.created");
        assert_eq!(msg_id, &result.event_id.to_string());
        let envelope = Envelope::decode(payload, true).unwrap();
        assert_eq!(envelope.topic, "users.user.created");
        assert_eq!(envelope.producer, "app1");
    }

    #[tokio::test]
    async fn repeated_event_id_reports_duplicate() {
        let wire = Arc::new(FakeWire::default());
        let publisher = publisher(wire);
        let options = PublishOptions {
            event_id: Some(Uuid::new_v4()),
            ..Default::default()
        };
        let first = publisher
            .publish("t.x", serde_json::json!(1), options.clone())
            .await
            .unwrap();
        let second = publisher
            .publish("t.x", serde_json::json!(1), options)
            .await
            .unwrap();
        assert!(!first.duplicate);
        assert!(second.duplicate);
        assert_eq!(first.event_id, second.event_id);
    }

    #[tokio::test]
    async fn resource_form_fills_the_triple() {
        let wire = Arc::new(FakeWire::default());
        publisher(wire.clone())
            .publish_resource(
                "users",
                "user",
                "created",
                Some("u1"),
                serde_json::json!({}),
                PublishOptions::default(),
            )
            .await
            .unwrap();
        let published = wire.published.lock().unwrap();
        let envelope = Envelope::decode(&published[0].2, true).unwrap();
        assert_eq!(envelope.domain.as_deref(), Some("users"));
        assert_eq!(envelope.resource.as_deref(), Some("user"));
        assert_eq!(envelope.action.as_deref(), Some("created"));
        assert_eq!(envelope.resource_id.as_deref(), Some("u1"));
        assert_eq!(published[0].0, "test.app1.users.user.created");
    }

    #[tokio::test]
    async fn wildcard_publish_is_rejected() {
        let wire = Arc::new(FakeWire::default());
        let err = publisher(wire)
            .publish("users.>", serde_json::json!({}), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
    }

    #[tokio::test]
    async fn broker_failure_propagates_without_outbox() {
        let wire = Arc::new(FakeWire {
            fail: true,
            ..Default::default()
        });
        let err = publisher(wire)
            .publish("t.x", serde_json::json!(1), PublishOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Publish(_)));
    }

    #[tokio::test]
    async fn batch_shares_trace_id() {
        let wire = Arc::new(FakeWire::default());
        let outcomes = publisher(wire.clone())
            .batch()
            .add("a.b", serde_json::json!(1), PublishOptions::default())
            .add("c.d", serde_json::json!(2), PublishOptions::default())
            .publish()
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.result.is_ok()));

        let published = wire.published.lock().unwrap();
        let first = Envelope::decode(&published[0].2, true).unwrap();
        let second = Envelope::decode(&published[1].2, true).unwrap();
        assert!(first.trace_id.is_some());
        assert_eq!(first.trace_id, second.trace_id);
    }
}
