//! Dead-letter routing: failure records, the sink contract, and admin helpers.

use std::collections::BTreeMap;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy},
};
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use futures::TryStreamExt;
use metrics::counter;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::MessageContext;
use crate::error::Error;

pub const HEADER_DEAD_LETTER: &str = "x-dead-letter";
pub const HEADER_REASON: &str = "x-dlq-reason";
pub const HEADER_DELIVERIES: &str = "x-deliveries";
pub const HEADER_EVENT_ID: &str = "x-event-id";
pub const HEADER_TRACE_ID: &str = "x-trace-id";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqReason {
    HandlerError,
    MaxDeliverExceeded,
    ValidationFailed,
    Unrecoverable,
}

impl DlqReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DlqReason::HandlerError => "handler_error",
            DlqReason::MaxDeliverExceeded => "max_deliver_exceeded",
            DlqReason::ValidationFailed => "validation_failed",
            DlqReason::Unrecoverable => "unrecoverable",
        }
    }
}

/// Body published on the DLQ subject for every parked message.
///
/// The raw payload rides along base64-encoded so the original bytes survive
/// even when JSON decoding is what failed in the first place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    pub original_subject: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    pub payload_base64: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub deliveries: i64,
    pub reason: DlqReason,
    pub error: String,
    #[serde(with = "time::serde::rfc3339")]
    pub occurred_at: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl DlqRecord {
    /// Record for a delivery whose envelope decoded fine.
    pub fn from_context(
        ctx: &MessageContext,
        raw_payload: &[u8],
        reason: DlqReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_id: Some(ctx.event_id),
            original_subject: ctx.subject.clone(),
            payload: serde_json::from_slice(raw_payload).ok(),
            payload_base64: BASE64.encode(raw_payload),
            headers: BTreeMap::new(),
            deliveries: ctx.deliveries,
            reason,
            error: error.into(),
            occurred_at: OffsetDateTime::now_utc(),
            trace_id: ctx.trace_id.clone(),
        }
    }

    /// Record for bytes that never became an envelope.
    pub fn from_raw(
        subject: impl Into<String>,
        raw_payload: &[u8],
        deliveries: i64,
        reason: DlqReason,
        error: impl Into<String>,
    ) -> Self {
        Self {
            event_id: None,
            original_subject: subject.into(),
            payload: serde_json::from_slice(raw_payload).ok(),
            payload_base64: BASE64.encode(raw_payload),
            headers: BTreeMap::new(),
            deliveries,
            reason,
            error: error.into(),
            occurred_at: OffsetDateTime::now_utc(),
            trace_id: None,
        }
    }

    pub fn raw_payload(&self) -> Result<Vec<u8>, Error> {
        BASE64
            .decode(&self.payload_base64)
            .map_err(|e| Error::dlq(format!("decode payload_base64: {e}")))
    }
}

/// Narrow seam the processor publishes through; failures must propagate so
/// the caller degrades the action to a nak.
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn publish(&self, record: &DlqRecord) -> Result<(), Error>;
}

/// JetStream-backed sink publishing to the application's DLQ subject.
pub struct JetStreamDlq {
    js: jetstream::Context,
    subject: String,
    max_attempts: u32,
}

impl JetStreamDlq {
    pub fn new(js: jetstream::Context, subject: impl Into<String>, max_attempts: u32) -> Self {
        Self {
            js,
            subject: subject.into(),
            max_attempts: max_attempts.max(1),
        }
    }

    fn headers_for(record: &DlqRecord) -> async_nats::HeaderMap {
        let mut headers = async_nats::HeaderMap::new();
        headers.insert(HEADER_DEAD_LETTER, "true");
        headers.insert(HEADER_REASON, record.reason.as_str());
        headers.insert(HEADER_DELIVERIES, record.deliveries.to_string().as_str());
        if let Some(event_id) = record.event_id {
            headers.insert(HEADER_EVENT_ID, event_id.to_string().as_str());
        }
        if let Some(trace_id) = record.trace_id.as_deref() {
            headers.insert(HEADER_TRACE_ID, trace_id);
        }
        headers
    }
}

#[async_trait]
impl DeadLetterSink for JetStreamDlq {
    async fn publish(&self, record: &DlqRecord) -> Result<(), Error> {
        let payload =
            serde_json::to_vec(record).map_err(|e| Error::dlq(format!("encode record: {e}")))?;
        let headers = Self::headers_for(record);

        let mut last_err = None;
        for attempt in 1..=self.max_attempts {
            let publish = self
                .js
                .publish_with_headers(self.subject.clone(), headers.clone(), payload.clone().into())
                .await;
            match publish {
                Ok(ack_future) => match ack_future.await {
                    Ok(_) => {
                        counter!(
                            "courier_dlq_total",
                            "subject" => record.original_subject.clone(),
                            "reason" => record.reason.as_str()
                        )
                        .increment(1);
                        info!(
                            subject = %record.original_subject,
                            reason = record.reason.as_str(),
                            deliveries = record.deliveries,
                            "message routed to dead letters"
                        );
                        return Ok(());
                    }
                    Err(e) => last_err = Some(e.to_string()),
                },
                Err(e) => last_err = Some(e.to_string()),
            }
            if attempt < self.max_attempts {
                tokio::time::sleep(Duration::from_millis(50 * attempt as u64)).await;
            }
        }
        Err(Error::dlq(format!(
            "publish to {} after {} attempts: {}",
            self.subject,
            self.max_attempts,
            last_err.unwrap_or_else(|| "unknown".into())
        )))
    }
}

/// One stored DLQ message plus its stream sequence.
#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub record: DlqRecord,
    pub sequence: u64,
}

/// Reads up to `limit` records off the DLQ subject via an ephemeral consumer.
pub async fn list_entries(
    js: &jetstream::Context,
    stream_name: &str,
    dlq_subject: &str,
    limit: usize,
) -> Result<Vec<DlqEntry>, Error> {
    let stream = js
        .get_stream(stream_name)
        .await
        .map_err(|e| Error::dlq(format!("get stream {stream_name}: {e}")))?;
    let consumer = stream
        .create_consumer(PullConfig {
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::None,
            filter_subject: dlq_subject.to_string(),
            ..Default::default()
        })
        .await
        .map_err(|e| Error::dlq(format!("create DLQ reader: {e}")))?;

    let mut messages = consumer
        .fetch()
        .max_messages(limit)
        .messages()
        .await
        .map_err(|e| Error::dlq(format!("fetch DLQ entries: {e}")))?;

    let mut entries = Vec::new();
    while let Some(msg) = messages
        .try_next()
        .await
        .map_err(|e| Error::dlq(format!("read DLQ entry: {e}")))?
    {
        match serde_json::from_slice::<DlqRecord>(&msg.payload) {
            Ok(record) => entries.push(DlqEntry {
                sequence: msg.info().map(|i| i.stream_sequence).unwrap_or(0),
                record,
            }),
            Err(err) => warn!(error = %err, "skipping unparseable DLQ entry"),
        }
    }
    Ok(entries)
}

/// Re-publishes a parked message onto its original subject.
pub async fn replay_entry(js: &jetstream::Context, entry: &DlqEntry) -> Result<(), Error> {
    let payload = entry.record.raw_payload()?;
    js.publish(entry.record.original_subject.clone(), payload.into())
        .await
        .map_err(|e| Error::dlq(format!("replay publish: {e}")))?
        .await
        .map_err(|e| Error::dlq(format!("replay ack: {e}")))?;
    info!(
        subject = %entry.record.original_subject,
        sequence = entry.sequence,
        "DLQ entry replayed"
    );
    Ok(())
}
