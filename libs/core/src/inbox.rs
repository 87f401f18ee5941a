//! Idempotent inbox: claim-before-handle deduplication keyed by `event_id`.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxStatus {
    Received,
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InboxStatus::Received => "received",
            InboxStatus::Processing => "processing",
            InboxStatus::Processed => "processed",
            InboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "received" => Ok(InboxStatus::Received),
            "processing" => Ok(InboxStatus::Processing),
            "processed" => Ok(InboxStatus::Processed),
            "failed" => Ok(InboxStatus::Failed),
            other => Err(Error::configuration(format!("unknown inbox status {other:?}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub event_id: Uuid,
    pub subject: String,
    pub stream: String,
    pub stream_seq: u64,
    pub status: InboxStatus,
    pub deliveries: i32,
    pub received_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub last_error: Option<String>,
}

/// Outcome of the claim primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// First sighting (or a retry of a failed attempt); run the handler.
    New,
    /// Another worker is on it right now; nak with a short delay.
    InProgress,
    /// Already handled successfully; ack without invoking anything.
    Processed,
}

/// Store contract backing the inbox.
///
/// `claim` is the single primitive the processor uses: one unique-constraint
/// insert (or a status update for redeliveries of failed attempts) decides
/// between the three outcomes.
#[async_trait]
pub trait InboxStore: Send + Sync {
    async fn claim(
        &self,
        event_id: Uuid,
        subject: &str,
        stream: &str,
        stream_seq: u64,
    ) -> Result<ClaimOutcome, Error>;
    async fn mark_processed(&self, event_id: Uuid) -> Result<(), Error>;
    async fn mark_failed(&self, event_id: Uuid, last_error: &str) -> Result<(), Error>;
    /// Deletes processed rows older than the cutoff; returns the count.
    async fn sweep(&self, older_than: OffsetDateTime) -> Result<u64, Error>;
}

/// Emits the dedup-hit counter alongside a claim; thin helper so the
/// processor and tests share the metric name.
pub async fn claim_with_metrics(
    store: &dyn InboxStore,
    event_id: Uuid,
    subject: &str,
    stream: &str,
    stream_seq: u64,
) -> Result<ClaimOutcome, Error> {
    let outcome = store.claim(event_id, subject, stream, stream_seq).await?;
    if outcome == ClaimOutcome::Processed {
        counter!("courier_inbox_dedup_total").increment(1);
        debug!(event_id = %event_id, "duplicate delivery suppressed by inbox");
    }
    Ok(outcome)
}

/// Background retention sweep for processed rows.
pub struct InboxSweeper {
    store: Arc<dyn InboxStore>,
    retention: Duration,
    interval: Duration,
}

impl InboxSweeper {
    pub fn new(store: Arc<dyn InboxStore>, retention: Duration) -> Self {
        Self {
            store,
            retention,
            interval: Duration::from_secs(3600),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub async fn run(&self, token: CancellationToken) {
        info!(retention = ?self.retention, "inbox sweeper started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
            let cutoff = OffsetDateTime::now_utc() - self.retention;
            match self.store.sweep(cutoff).await {
                Ok(0) => {}
                Ok(deleted) => info!(deleted, "inbox rows swept"),
                Err(err) => warn!(error = %err, "inbox sweep failed"),
            }
        }
        info!("inbox sweeper stopped");
    }
}
