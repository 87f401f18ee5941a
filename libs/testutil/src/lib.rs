//! In-memory doubles for testing Courier applications without a broker or a
//! database: a wire publisher with a dedup window, outbox and inbox stores,
//! a capturing dead-letter sink, and a recording handler.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use courier_core::context::{ErrorContext, MessageContext};
use courier_core::dlq::{DeadLetterSink, DlqRecord};
use courier_core::error::{Error, ErrorAction};
use courier_core::inbox::{ClaimOutcome, InboxRecord, InboxStatus, InboxStore};
use courier_core::outbox::{
    NewOutboxRecord, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore, OutboxTx,
};
use courier_core::publish::{WireAck, WirePublisher};
use courier_core::registry::{Handler, SubscriptionOptions};
use serde_json::Value;
use time::OffsetDateTime;
use uuid::Uuid;

/// One message as the fake broker saw it.
#[derive(Debug, Clone)]
pub struct PublishedMessage {
    pub subject: String,
    pub msg_id: String,
    pub headers: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

/// Wire publisher double with a broker-style dedup window on message-id.
#[derive(Default)]
pub struct MemoryWire {
    published: Mutex<Vec<PublishedMessage>>,
    seen_ids: Mutex<HashSet<String>>,
    failures_left: AtomicUsize,
}

impl MemoryWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// The next `n` publishes fail with a transient publish error.
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().unwrap().clone()
    }

    pub fn take_published(&self) -> Vec<PublishedMessage> {
        std::mem::take(&mut *self.published.lock().unwrap())
    }
}

#[async_trait]
impl WirePublisher for MemoryWire {
    async fn publish(
        &self,
        subject: &str,
        msg_id: &str,
        headers: &BTreeMap<String, String>,
        payload: Vec<u8>,
    ) -> Result<WireAck, Error> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::publish("memory wire: scripted failure"));
        }
        let duplicate = !self.seen_ids.lock().unwrap().insert(msg_id.to_string());
        let mut published = self.published.lock().unwrap();
        if !duplicate {
            published.push(PublishedMessage {
                subject: subject.to_string(),
                msg_id: msg_id.to_string(),
                headers: headers.clone(),
                payload,
            });
        }
        Ok(WireAck {
            stream_seq: published.len() as u64,
            duplicate,
        })
    }
}

/// Outbox store double; `tx()` yields a staging handle whose rows only become
/// visible on `commit()`, mirroring the transactional contract.
#[derive(Default)]
pub struct MemoryOutbox {
    rows: Mutex<Vec<OutboxRecord>>,
    next_id: AtomicUsize,
}

impl MemoryOutbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn tx(self: &Arc<Self>) -> MemoryOutboxTx {
        MemoryOutboxTx {
            store: self.clone(),
            staged: Vec::new(),
        }
    }

    pub fn rows(&self) -> Vec<OutboxRecord> {
        self.rows.lock().unwrap().clone()
    }

    pub fn status_of(&self, event_id: Uuid) -> Option<OutboxStatus> {
        self.rows
            .lock()
            .unwrap()
            .iter()
            .find(|r| r.event_id == event_id)
            .map(|r| r.status)
    }
}

#[async_trait]
impl OutboxStore for MemoryOutbox {
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
        self.update(event_id, |row| {
            row.status = OutboxStatus::Published;
            row.last_error = None;
        })
    }

    async fn reschedule(
        &self,
        event_id: Uuid,
        attempts: i32,
        next_attempt_at: OffsetDateTime,
        last_error: &str,
    ) -> Result<(), Error> {
        self.update(event_id, |row| {
            row.status = OutboxStatus::Pending;
            row.attempts = attempts;
            row.next_attempt_at = next_attempt_at;
            row.last_error = Some(last_error.to_string());
        })
    }

    async fn mark_failed(&self, event_id: Uuid, last_error: &str) -> Result<(), Error> {
        self.update(event_id, |row| {
            row.status = OutboxStatus::Failed;
            row.attempts += 1;
            row.last_error = Some(last_error.to_string());
        })
    }

    async fn stats(&self) -> Result<OutboxStats, Error> {
        let rows = self.rows.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        let mut stats = OutboxStats::default();
        for row in rows.iter() {
            match row.status {
                OutboxStatus::Pending => {
                    stats.pending += 1;
                    let age = (now - row.created_at).whole_seconds();
                    stats.oldest_pending_seconds = stats.oldest_pending_seconds.max(age);
                }
                OutboxStatus::Failed => stats.failed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }
}

impl MemoryOutbox {
    fn update(&self, event_id: Uuid, apply: impl FnOnce(&mut OutboxRecord)) -> Result<(), Error> {
        let mut rows = self.rows.lock().unwrap();
        match rows.iter_mut().find(|r| r.event_id == event_id) {
            Some(row) => {
                apply(row);
                Ok(())
            }
            None => Err(Error::publish(format!("outbox row {event_id} not found"))),
        }
    }
}

/// Staging handle; discard it without committing to emulate a rollback.
pub struct MemoryOutboxTx {
    store: Arc<MemoryOutbox>,
    staged: Vec<NewOutboxRecord>,
}

impl MemoryOutboxTx {
    pub fn commit(self) {
        let mut rows = self.store.rows.lock().unwrap();
        let now = OffsetDateTime::now_utc();
        for record in self.staged {
            let id = self.store.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            rows.push(OutboxRecord {
                id,
                event_id: record.event_id,
                subject: record.subject,
                payload: record.payload,
                headers: record.headers,
                status: OutboxStatus::Pending,
                attempts: 0,
                last_error: None,
                created_at: now,
                next_attempt_at: now,
            });
        }
    }

    pub fn rollback(self) {}
}

#[async_trait]
impl OutboxTx for MemoryOutboxTx {
    async fn stage(&mut self, record: NewOutboxRecord) -> Result<(), Error> {
        let duplicate = self.staged.iter().any(|r| r.event_id == record.event_id)
            || self
                .store
                .rows
                .lock()
                .unwrap()
                .iter()
                .any(|r| r.event_id == record.event_id);
        if duplicate {
            return Err(Error::publish(format!(
                "event {} is already staged",
                record.event_id
            )));
        }
        self.staged.push(record);
        Ok(())
    }
}

/// Inbox store double implementing the claim state machine in memory.
#[derive(Default)]
pub struct MemoryInbox {
    rows: Mutex<HashMap<Uuid, InboxRecord>>,
}

impl MemoryInbox {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status_of(&self, event_id: Uuid) -> Option<InboxStatus> {
        self.rows.lock().unwrap().get(&event_id).map(|r| r.status)
    }

    pub fn record(&self, event_id: Uuid) -> Option<InboxRecord> {
        self.rows.lock().unwrap().get(&event_id).cloned()
    }
}

#[async_trait]
impl InboxStore for MemoryInbox {
    async fn claim(
        &self,
        event_id: Uuid,
        subject: &str,
        stream: &str,
        stream_seq: u64,
    ) -> Result<ClaimOutcome, Error> {
        let mut rows = self.rows.lock().unwrap();
        match rows.get_mut(&event_id) {
            None => {
                rows.insert(
                    event_id,
                    InboxRecord {
                        event_id,
                        subject: subject.to_string(),
                        stream: stream.to_string(),
                        stream_seq,
                        status: InboxStatus::Processing,
                        deliveries: 1,
                        received_at: OffsetDateTime::now_utc(),
                        processed_at: None,
                        last_error: None,
                    },
                );
                Ok(ClaimOutcome::New)
            }
            Some(row) => match row.status {
                InboxStatus::Processed => Ok(ClaimOutcome::Processed),
                InboxStatus::Failed => {
                    row.status = InboxStatus::Processing;
                    row.deliveries += 1;
                    Ok(ClaimOutcome::New)
                }
                InboxStatus::Processing | InboxStatus::Received => Ok(ClaimOutcome::InProgress),
            },
        }
    }

    async fn mark_processed(&self, event_id: Uuid) -> Result<(), Error> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&event_id) {
            row.status = InboxStatus::Processed;
            row.processed_at = Some(OffsetDateTime::now_utc());
            row.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, event_id: Uuid, last_error: &str) -> Result<(), Error> {
        let mut rows = self.rows.lock().unwrap();
        if let Some(row) = rows.get_mut(&event_id) {
            row.status = InboxStatus::Failed;
            row.last_error = Some(last_error.to_string());
        }
        Ok(())
    }

    async fn sweep(&self, older_than: OffsetDateTime) -> Result<u64, Error> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|_, row| {
            !(row.status == InboxStatus::Processed
                && row.processed_at.map(|at| at < older_than).unwrap_or(false))
        });
        Ok((before - rows.len()) as u64)
    }
}

/// Dead-letter sink double capturing records in memory.
#[derive(Default)]
pub struct CaptureSink {
    records: Mutex<Vec<DlqRecord>>,
    failures_left: AtomicUsize,
}

impl CaptureSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn records(&self) -> Vec<DlqRecord> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait]
impl DeadLetterSink for CaptureSink {
    async fn publish(&self, record: &DlqRecord) -> Result<(), Error> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(Error::dlq("capture sink: scripted failure"));
        }
        self.records.lock().unwrap().push(record.clone());
        Ok(())
    }
}

/// What a [`TestDelivery`] ended up as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Acked,
    Naked,
}

/// Delivery double for driving the message processor without a broker.
pub struct TestDelivery {
    payload: Vec<u8>,
    subject: String,
    stream_seq: u64,
    deliveries: i64,
    settlements: Mutex<Vec<Settlement>>,
}

impl TestDelivery {
    pub fn new(subject: impl Into<String>, payload: Vec<u8>, deliveries: i64) -> Self {
        Self {
            payload,
            subject: subject.into(),
            stream_seq: 1,
            deliveries,
            settlements: Mutex::new(Vec::new()),
        }
    }

    /// Delivery built from a message the [`MemoryWire`] captured.
    pub fn from_published(message: &PublishedMessage, deliveries: i64) -> Self {
        Self::new(message.subject.clone(), message.payload.clone(), deliveries)
    }

    pub fn with_stream_seq(mut self, stream_seq: u64) -> Self {
        self.stream_seq = stream_seq;
        self
    }

    pub fn settlements(&self) -> Vec<Settlement> {
        self.settlements.lock().unwrap().clone()
    }

    pub fn was_acked(&self) -> bool {
        self.settlements() == vec![Settlement::Acked]
    }

    pub fn was_naked(&self) -> bool {
        self.settlements() == vec![Settlement::Naked]
    }
}

#[async_trait]
impl courier_core::processor::Delivery for TestDelivery {
    fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn stream_sequence(&self) -> u64 {
        self.stream_seq
    }

    fn deliveries(&self) -> i64 {
        self.deliveries
    }

    async fn ack(&self) -> Result<(), Error> {
        self.settlements.lock().unwrap().push(Settlement::Acked);
        Ok(())
    }

    async fn nak(&self, _delay: Option<std::time::Duration>) -> Result<(), Error> {
        self.settlements.lock().unwrap().push(Settlement::Naked);
        Ok(())
    }
}

/// Handler double: records every invocation and can fail the first N.
pub struct RecordingHandler {
    filters: Vec<String>,
    options: SubscriptionOptions,
    fail_first: AtomicUsize,
    forced_action: Mutex<Option<ErrorAction>>,
    received: Mutex<Vec<(Value, MessageContext)>>,
}

impl RecordingHandler {
    pub fn new(filters: Vec<&str>) -> Arc<Self> {
        Arc::new(Self {
            filters: filters.into_iter().map(String::from).collect(),
            options: SubscriptionOptions::default(),
            fail_first: AtomicUsize::new(0),
            forced_action: Mutex::new(None),
            received: Mutex::new(Vec::new()),
        })
    }

    pub fn with_options(filters: Vec<&str>, options: SubscriptionOptions) -> Arc<Self> {
        Arc::new(Self {
            filters: filters.into_iter().map(String::from).collect(),
            options,
            fail_first: AtomicUsize::new(0),
            forced_action: Mutex::new(None),
            received: Mutex::new(Vec::new()),
        })
    }

    /// The first `n` invocations fail with a plain error.
    pub fn fail_first(&self, n: usize) {
        self.fail_first.store(n, Ordering::SeqCst);
    }

    pub fn force_action(&self, action: ErrorAction) {
        *self.forced_action.lock().unwrap() = Some(action);
    }

    pub fn received(&self) -> Vec<(Value, MessageContext)> {
        self.received.lock().unwrap().clone()
    }

    pub fn invocations(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[async_trait]
impl Handler for RecordingHandler {
    fn filters(&self) -> Vec<String> {
        self.filters.clone()
    }

    fn options(&self) -> SubscriptionOptions {
        self.options.clone()
    }

    async fn handle(&self, message: Value, ctx: &MessageContext) -> anyhow::Result<()> {
        self.received.lock().unwrap().push((message, ctx.clone()));
        let left = self.fail_first.load(Ordering::SeqCst);
        if left > 0 {
            self.fail_first.store(left - 1, Ordering::SeqCst);
            anyhow::bail!("connection reset");
        }
        Ok(())
    }

    fn on_error(&self, _ctx: &ErrorContext) -> Option<ErrorAction> {
        *self.forced_action.lock().unwrap()
    }
}
