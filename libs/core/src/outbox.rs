//! Transactional outbox: record model, store contract, and the relay worker.
//!
//! The store itself lives in a persistence crate (`courier-outbox` ships the
//! Postgres one); the relay here only drives the contract.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use metrics::counter;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::OutboxSettings;
use crate::error::Error;
use crate::publish::WirePublisher;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Published,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "pending",
            OutboxStatus::Publishing => "publishing",
            OutboxStatus::Published => "published",
            OutboxStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Result<Self, Error> {
        match s {
            "pending" => Ok(OutboxStatus::Pending),
            "publishing" => Ok(OutboxStatus::Publishing),
            "published" => Ok(OutboxStatus::Published),
            "failed" => Ok(OutboxStatus::Failed),
            other => Err(Error::configuration(format!("unknown outbox status {other:?}"))),
        }
    }
}

/// Row staged by the publisher inside the caller's transaction.
#[derive(Debug, Clone)]
pub struct NewOutboxRecord {
    pub event_id: Uuid,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
}

/// Full row as the relay sees it.
#[derive(Debug, Clone)]
pub struct OutboxRecord {
    pub id: i64,
    pub event_id: Uuid,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: BTreeMap<String, String>,
    pub status: OutboxStatus,
    pub attempts: i32,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub next_attempt_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct OutboxStats {
    pub pending: i64,
    pub failed: i64,
    pub oldest_pending_seconds: i64,
}

/// Staging seam inside an application transaction.
///
/// `courier-outbox` implements this over a live `sqlx` transaction, so the
/// row commits or rolls back with the caller's business writes.
#[async_trait]
pub trait OutboxTx: Send {
    async fn stage(&mut self, record: NewOutboxRecord) -> Result<(), Error>;
}

/// Relay-facing store contract.
///
/// `claim_batch` must flip claimed rows `pending -> publishing` atomically
/// (SKIP LOCKED or a compare-and-swap on status) so no two relay workers
/// publish the same `event_id` concurrently.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    async fn claim_batch(&self, limit: u32, now: OffsetDateTime) -> Result<Vec<OutboxRecord>, Error>;
    async fn mark_published(&self, event_id: Uuid) -> Result<(), Error>;
    /// Returns the row to `pending` with a future `next_attempt_at`.
    async fn reschedule(
        &self,
        event_id: Uuid,
        attempts: i32,
        next_attempt_at: OffsetDateTime,
        last_error: &str,
    ) -> Result<(), Error>;
    async fn mark_failed(&self, event_id: Uuid, last_error: &str) -> Result<(), Error>;
    async fn stats(&self) -> Result<OutboxStats, Error>;
}

/// Per-attempt delay schedule; the last entry caps everything after it.
#[derive(Debug, Clone)]
pub struct BackoffSchedule {
    delays: Vec<Duration>,
}

impl BackoffSchedule {
    pub fn new(delays: Vec<Duration>) -> Self {
        debug_assert!(!delays.is_empty());
        Self { delays }
    }

    /// Delay before the next try, given how many attempts already failed.
    pub fn delay_after(&self, failed_attempts: u32) -> Duration {
        let index = (failed_attempts.max(1) as usize - 1).min(self.delays.len() - 1);
        self.delays[index]
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct RelayPass {
    pub published: usize,
    pub rescheduled: usize,
    pub exhausted: usize,
}

/// Recurring worker moving committed outbox rows onto the broker.
pub struct OutboxRelay {
    store: Arc<dyn OutboxStore>,
    wire: Arc<dyn WirePublisher>,
    settings: OutboxSettings,
    schedule: BackoffSchedule,
}

impl OutboxRelay {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        wire: Arc<dyn WirePublisher>,
        settings: OutboxSettings,
    ) -> Self {
        let schedule = BackoffSchedule::new(settings.backoff.clone());
        Self {
            store,
            wire,
            settings,
            schedule,
        }
    }

    /// Runs until cancelled; the current batch always completes before exit.
    pub async fn run(&self, token: CancellationToken) {
        info!(
            batch_size = self.settings.batch_size,
            poll_interval = ?self.settings.poll_interval,
            "outbox relay started"
        );
        loop {
            match self.run_once().await {
                Ok(pass) if pass.published > 0 || pass.rescheduled > 0 || pass.exhausted > 0 => {
                    debug!(
                        published = pass.published,
                        rescheduled = pass.rescheduled,
                        exhausted = pass.exhausted,
                        "outbox relay pass"
                    );
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "outbox relay pass failed");
                }
            }
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }
        }
        info!("outbox relay stopped");
    }

    /// One claim-publish-settle pass over due pending rows.
    pub async fn run_once(&self) -> Result<RelayPass, Error> {
        let now = OffsetDateTime::now_utc();
        let batch = self.store.claim_batch(self.settings.batch_size, now).await?;
        let mut pass = RelayPass::default();

        for record in batch {
            let msg_id = record.event_id.to_string();
            match self
                .wire
                .publish(&record.subject, &msg_id, &record.headers, record.payload.clone())
                .await
            {
                Ok(ack) => {
                    self.store.mark_published(record.event_id).await?;
                    counter!("courier_outbox_published_total").increment(1);
                    if ack.duplicate {
                        debug!(event_id = %record.event_id, "outbox row deduplicated by broker");
                    }
                    pass.published += 1;
                }
                Err(err) => {
                    let attempts = record.attempts + 1;
                    if attempts as u32 >= self.settings.max_attempts {
                        self.store
                            .mark_failed(record.event_id, &err.to_string())
                            .await?;
                        counter!("courier_outbox_exhausted_total").increment(1);
                        error!(
                            event_id = %record.event_id,
                            attempts,
                            error = %err,
                            "outbox row exhausted its attempts"
                        );
                        pass.exhausted += 1;
                    } else {
                        let delay = self.schedule.delay_after(attempts as u32);
                        let next = OffsetDateTime::now_utc() + delay;
                        self.store
                            .reschedule(record.event_id, attempts, next, &err.to_string())
                            .await?;
                        warn!(
                            event_id = %record.event_id,
                            attempts,
                            retry_in = ?delay,
                            "outbox publish failed, rescheduled"
                        );
                        pass.rescheduled += 1;
                    }
                }
            }
        }
        Ok(pass)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publish::WireAck;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryStore {
        rows: Mutex<Vec<OutboxRecord>>,
    }

    impl MemoryStore {
        fn push_pending(&self, event_id: Uuid) {
            let mut rows = self.rows.lock().unwrap();
            let id = rows.len() as i64 + 1;
            rows.push(OutboxRecord {
                id,
                event_id,
                subject: "test.app1.orders.order.placed".into(),
                payload: b"{}".to_vec(),
                headers: BTreeMap::new(),
                status: OutboxStatus::Pending,
                attempts: 0,
                last_error: None,
                created_at: OffsetDateTime::now_utc(),
                next_attempt_at: OffsetDateTime::now_utc(),
            });
        }

        fn status_of(&self, event_id: Uuid) -> OutboxStatus {
            self.rows
                .lock()
                .unwrap()
                .iter()
                .find(|r| r.event_id == event_id)
                .map(|r| r.status)
                .unwrap()
        }
    }

    #[async_trait]
    impl OutboxStore for MemoryStore {
        async fn claim_batch(
            &self,
            limit: u32,
            now: OffsetDateTime,
        ) -> Result<Vec<OutboxRecord>, Error> {
            let mut rows = self.rows.lock().unwrap();
            let mut claimed = Vec::new();
            for row in rows.iter_mut() {
                if claimed.len() as u32 >= limit {
                    break;
                }
                if row.status == OutboxStatus::Pending && row.next_attempt_at <= now {
                    row.status = OutboxStatus::Publishing;
                    claimed.push(row.clone());
                }
            }
            Ok(claimed)
        }

        async fn mark_published(&self, event_id: Uuid) -> Result<(), Error> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.event_id == event_id).unwrap();
            row.status = OutboxStatus::Published;
            Ok(())
        }

        async fn reschedule(
            &self,
            event_id: Uuid,
            attempts: i32,
            next_attempt_at: OffsetDateTime,
            last_error: &str,
        ) -> Result<(), Error> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.event_id == event_id).unwrap();
            row.status = OutboxStatus::Pending;
            row.attempts = attempts;
            row.next_attempt_at = next_attempt_at;
            row.last_error = Some(last_error.to_string());
            Ok(())
        }

        async fn mark_failed(&self, event_id: Uuid, last_error: &str) -> Result<(), Error> {
            let mut rows = self.rows.lock().unwrap();
            let row = rows.iter_mut().find(|r| r.event_id == event_id).unwrap();
            row.status = OutboxStatus::Failed;
            row.last_error = Some(last_error.to_string());
            Ok(())
        }

        async fn stats(&self) -> Result<OutboxStats, Error> {
            Ok(OutboxStats::default())
        }
    }

    struct FlakyWire {
        failures_left: Mutex<u32>,
    }

    #[async_trait]
    impl WirePublisher for FlakyWire {
        async fn publish(
            &self,
            _subject: &str,
            _msg_id: &str,
            _headers: &BTreeMap<String, String>,
            _payload: Vec<u8>,
        ) -> Result<WireAck, Error> {
            let mut left = self.failures_left.lock().unwrap();
            if *left > 0 {
                *left -= 1;
                return Err(Error::publish("broker down"));
            }
            Ok(WireAck {
                stream_seq: 1,
                duplicate: false,
            })
        }
    }

    fn settings(max_attempts: u32) -> OutboxSettings {
        OutboxSettings {
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            max_attempts,
            backoff: vec![Duration::from_millis(0)],
        }
    }

    #[test]
    fn backoff_schedule_caps_at_last_entry() {
        let schedule = BackoffSchedule::new(vec![
            Duration::from_secs(1),
            Duration::from_secs(5),
            Duration::from_secs(15),
        ]);
        assert_eq!(schedule.delay_after(1), Duration::from_secs(1));
        assert_eq!(schedule.delay_after(2), Duration::from_secs(5));
        assert_eq!(schedule.delay_after(3), Duration::from_secs(15));
        assert_eq!(schedule.delay_after(9), Duration::from_secs(15));
    }

    #[tokio::test]
    async fn relay_publishes_pending_rows() {
        let store = Arc::new(MemoryStore::default());
        let event_id = Uuid::new_v4();
        store.push_pending(event_id);
        let relay = OutboxRelay::new(
            store.clone(),
            Arc::new(FlakyWire {
                failures_left: Mutex::new(0),
            }),
            settings(5),
        );

        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass.published, 1);
        assert_eq!(store.status_of(event_id), OutboxStatus::Published);
    }

    #[tokio::test]
    async fn relay_reschedules_then_succeeds() {
        let store = Arc::new(MemoryStore::default());
        let event_id = Uuid::new_v4();
        store.push_pending(event_id);
        let relay = OutboxRelay::new(
            store.clone(),
            Arc::new(FlakyWire {
                failures_left: Mutex::new(1),
            }),
            settings(5),
        );

        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass.rescheduled, 1);
        assert_eq!(store.status_of(event_id), OutboxStatus::Pending);

        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass.published, 1);
        assert_eq!(store.status_of(event_id), OutboxStatus::Published);
    }

    #[tokio::test]
    async fn relay_marks_rows_failed_after_max_attempts() {
        let store = Arc::new(MemoryStore::default());
        let event_id = Uuid::new_v4();
        store.push_pending(event_id);
        let relay = OutboxRelay::new(
            store.clone(),
            Arc::new(FlakyWire {
                failures_left: Mutex::new(u32::MAX),
            }),
            settings(2),
        );

        assert_eq!(relay.run_once().await.unwrap().rescheduled, 1);
        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass.exhausted, 1);
        assert_eq!(store.status_of(event_id), OutboxStatus::Failed);

        // Failed rows are terminal for the relay.
        let pass = relay.run_once().await.unwrap();
        assert_eq!(pass, RelayPass::default());
    }

    #[test]
    fn status_strings_roundtrip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Publishing,
            OutboxStatus::Published,
            OutboxStatus::Failed,
        ] {
            assert_eq!(OutboxStatus::parse(status.as_str()).unwrap(), status);
        }
        assert!(OutboxStatus::parse("gone").is_err());
    }
}
