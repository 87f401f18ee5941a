//! Per-message processing: decode, dedup, dispatch, settle.
//!
//! Nothing throws past this module. Every failure collapses into an
//! [`ErrorAction`] and ends in exactly one ack or nak.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use metrics::counter;
use tracing::{debug, error, warn};

use crate::config::{MalformedPolicy, MaxDeliverPolicy};
use crate::context::{ErrorContext, MessageContext};
use crate::dlq::{DeadLetterSink, DlqReason, DlqRecord};
use crate::envelope::Envelope;
use crate::error::{classify, default_action, Error, ErrorAction, ErrorKind};
use crate::inbox::{claim_with_metrics, ClaimOutcome, InboxStore};
use crate::middleware::Chain;
use crate::registry::Handler;

/// One in-flight broker delivery, abstracted so tests run without JetStream.
#[async_trait]
pub trait Delivery: Send + Sync {
    fn payload(&self) -> &[u8];
    fn subject(&self) -> &str;
    fn stream_sequence(&self) -> u64;
    /// 1-based delivery attempt.
    fn deliveries(&self) -> i64;
    async fn ack(&self) -> Result<(), Error>;
    async fn nak(&self, delay: Option<Duration>) -> Result<(), Error>;
}

/// The JetStream-backed delivery.
pub struct JsDelivery {
    message: jetstream::Message,
    subject: String,
    stream_sequence: u64,
    deliveries: i64,
}

impl JsDelivery {
    pub fn new(message: jetstream::Message) -> Result<Self, Error> {
        let info = message
            .info()
            .map_err(|e| Error::subscription(format!("message info: {e}")))?;
        let stream_sequence = info.stream_sequence;
        let deliveries = info.delivered;
        let subject = message.subject.to_string();
        Ok(Self {
            message,
            subject,
            stream_sequence,
            deliveries,
        })
    }
}

#[async_trait]
impl Delivery for JsDelivery {
    fn payload(&self) -> &[u8] {
        &self.message.payload
    }

    fn subject(&self) -> &str {
        &self.subject
    }

    fn stream_sequence(&self) -> u64 {
        self.stream_sequence
    }

    fn deliveries(&self) -> i64 {
        self.deliveries
    }

    async fn ack(&self) -> Result<(), Error> {
        self.message
            .ack()
            .await
            .map_err(|e| Error::subscription(format!("ack: {e}")))
    }

    async fn nak(&self, delay: Option<Duration>) -> Result<(), Error> {
        self.message
            .ack_with(AckKind::Nak(delay))
            .await
            .map_err(|e| Error::subscription(format!("nak: {e}")))
    }
}

/// One handler with its composed middleware chain.
pub struct SubscriptionRuntime {
    pub handler: Arc<dyn Handler>,
    pub chain: Chain,
}

/// Everything the processor needs for one filter subject.
pub struct Subscription {
    pub filter: String,
    pub max_deliver: i64,
    /// Handler budget; a dispatch still running past this would be
    /// redelivered by the broker anyway, so it is cancelled and retried.
    pub ack_wait: Duration,
    pub runtimes: Vec<SubscriptionRuntime>,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("filter", &self.filter)
            .field("max_deliver", &self.max_deliver)
            .field("ack_wait", &self.ack_wait)
            .field("runtimes", &self.runtimes.len())
            .finish()
    }
}

#[derive(Clone)]
pub struct ProcessorSettings {
    pub stream: String,
    pub strict_envelope: bool,
    pub on_malformed: MalformedPolicy,
    pub on_max_deliver: MaxDeliverPolicy,
    /// Nak delay when the inbox reports another worker mid-flight.
    pub inbox_busy_delay: Duration,
}

pub struct MessageProcessor {
    settings: ProcessorSettings,
    dlq: Option<Arc<dyn DeadLetterSink>>,
    inbox: Option<Arc<dyn InboxStore>>,
}

impl MessageProcessor {
    pub fn new(
        settings: ProcessorSettings,
        dlq: Option<Arc<dyn DeadLetterSink>>,
        inbox: Option<Arc<dyn InboxStore>>,
    ) -> Self {
        Self {
            settings,
            dlq,
            inbox,
        }
    }

    /// Processes one delivery to completion: exactly one ack or nak happens.
    pub async fn process(&self, delivery: &dyn Delivery, subscription: &Subscription) {
        let envelope = match Envelope::decode(delivery.payload(), self.settings.strict_envelope) {
            Ok(envelope) => envelope,
            Err(err) => {
                self.settle_malformed(delivery, &err).await;
                return;
            }
        };
        let ctx = MessageContext::from_envelope(
            &envelope,
            delivery.subject(),
            self.settings.stream.clone(),
            delivery.stream_sequence(),
            delivery.deliveries(),
        );

        if let Some(inbox) = &self.inbox {
            match claim_with_metrics(
                inbox.as_ref(),
                ctx.event_id,
                &ctx.subject,
                &ctx.stream,
                ctx.stream_seq,
            )
            .await
            {
                Ok(ClaimOutcome::New) => {}
                Ok(ClaimOutcome::Processed) => {
                    self.ack(delivery).await;
                    return;
                }
                Ok(ClaimOutcome::InProgress) => {
                    debug!(event_id = %ctx.event_id, "event claimed by another worker");
                    self.nak(delivery, Some(self.settings.inbox_busy_delay)).await;
                    return;
                }
                Err(err) => {
                    // Without a claim we cannot guarantee at-most-once, so
                    // leave the delivery to a later attempt.
                    warn!(error = %err, event_id = %ctx.event_id, "inbox claim failed");
                    self.nak(delivery, None).await;
                    return;
                }
            }
        }

        let mut failure = None;
        for runtime in &subscription.runtimes {
            let dispatch = runtime
                .chain
                .dispatch(&envelope.message, &ctx, runtime.handler.as_ref());
            let outcome = match tokio::time::timeout(subscription.ack_wait, dispatch).await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::Error::new(Error::Timeout(
                    subscription.ack_wait,
                    "handler exceeded its ack budget".into(),
                ))),
            };
            if let Err(err) = outcome {
                failure = Some((err, runtime));
                break;
            }
        }

        match failure {
            None => {
                if let Some(inbox) = &self.inbox {
                    if let Err(err) = inbox.mark_processed(ctx.event_id).await {
                        warn!(error = %err, event_id = %ctx.event_id, "inbox mark_processed failed");
                    }
                }
                counter!("courier_processed_total", "topic" => ctx.topic.clone()).increment(1);
                self.ack(delivery).await;
            }
            Some((err, runtime)) => {
                if let Some(inbox) = &self.inbox {
                    if let Err(mark_err) =
                        inbox.mark_failed(ctx.event_id, &err.to_string()).await
                    {
                        warn!(error = %mark_err, event_id = %ctx.event_id, "inbox mark_failed failed");
                    }
                }
                self.settle_failure(delivery, subscription, runtime, &ctx, err)
                    .await;
            }
        }
    }

    /// Decode failures have no envelope to attribute, so the record carries
    /// the raw bytes and no event id.
    async fn settle_malformed(&self, delivery: &dyn Delivery, err: &Error) {
        counter!("courier_malformed_total").increment(1);
        warn!(
            subject = %delivery.subject(),
            error = %err,
            "undecodable message"
        );
        let route_to_dlq =
            self.settings.on_malformed == MalformedPolicy::DeadLetter && self.dlq.is_some();
        if route_to_dlq {
            let record = DlqRecord::from_raw(
                delivery.subject(),
                delivery.payload(),
                delivery.deliveries(),
                DlqReason::HandlerError,
                format!("{err}"),
            );
            if let Err(publish_err) = self.publish_dead_letter(&record).await {
                warn!(error = %publish_err, "DLQ publish failed, leaving message redeliverable");
                self.nak(delivery, None).await;
                return;
            }
        }
        self.ack(delivery).await;
    }

    async fn settle_failure(
        &self,
        delivery: &dyn Delivery,
        subscription: &Subscription,
        runtime: &SubscriptionRuntime,
        ctx: &MessageContext,
        err: anyhow::Error,
    ) {
        let kind = classify(&err);
        let attempt = ctx.deliveries;
        let max_attempts = subscription.max_deliver;
        let exhausted = attempt >= max_attempts;

        let error_ctx = ErrorContext {
            error: display_error(&err),
            kind,
            attempt,
            max_attempts,
            message: ctx.clone(),
        };
        let mut action = self
            .subscriber_override(runtime.handler.as_ref(), &error_ctx)
            .unwrap_or_else(|| default_action(kind, attempt, max_attempts));

        // A message out of broker attempts must not stay redeliverable unless
        // the operator explicitly chose nak-and-park.
        if exhausted && action == ErrorAction::Retry {
            action = match self.settings.on_max_deliver {
                MaxDeliverPolicy::Drop => ErrorAction::Dlq,
                MaxDeliverPolicy::Nak => {
                    warn!(
                        event_id = %ctx.event_id,
                        deliveries = attempt,
                        "max deliveries exhausted, leaving message parked at the broker"
                    );
                    self.nak(delivery, None).await;
                    return;
                }
            };
        }

        match action {
            ErrorAction::Retry => {
                counter!("courier_retry_total", "topic" => ctx.topic.clone()).increment(1);
                debug!(
                    event_id = %ctx.event_id,
                    deliveries = attempt,
                    error = %error_ctx.error,
                    "handler failed, redelivering"
                );
                self.nak(delivery, None).await;
            }
            ErrorAction::Discard => {
                counter!("courier_discarded_total", "topic" => ctx.topic.clone()).increment(1);
                warn!(
                    event_id = %ctx.event_id,
                    error = %error_ctx.error,
                    "message discarded"
                );
                self.ack(delivery).await;
            }
            ErrorAction::Dlq => {
                let reason = if exhausted {
                    DlqReason::MaxDeliverExceeded
                } else {
                    match kind {
                        ErrorKind::Malformed => DlqReason::ValidationFailed,
                        ErrorKind::Unrecoverable => DlqReason::Unrecoverable,
                        _ => DlqReason::HandlerError,
                    }
                };
                let record =
                    DlqRecord::from_context(ctx, delivery.payload(), reason, error_ctx.error);
                match self.publish_dead_letter(&record).await {
                    Ok(()) => self.ack(delivery).await,
                    Err(publish_err) => {
                        // Degrade to a nak so the original stays retriable.
                        warn!(
                            error = %publish_err,
                            event_id = %ctx.event_id,
                            "DLQ publish failed, leaving message redeliverable"
                        );
                        self.nak(delivery, None).await;
                    }
                }
            }
        }
    }

    fn subscriber_override(
        &self,
        handler: &dyn Handler,
        error_ctx: &ErrorContext,
    ) -> Option<ErrorAction> {
        match catch_unwind(AssertUnwindSafe(|| handler.on_error(error_ctx))) {
            Ok(choice) => choice,
            Err(_) => {
                error!(
                    event_id = %error_ctx.message.event_id,
                    "on_error panicked, falling back to the default policy"
                );
                None
            }
        }
    }

    async fn publish_dead_letter(&self, record: &DlqRecord) -> Result<(), Error> {
        match &self.dlq {
            Some(sink) => sink.publish(record).await,
            // DLQ disabled: the drop policy degrades to ack-and-drop.
            None => {
                warn!(
                    subject = %record.original_subject,
                    reason = record.reason.as_str(),
                    "DLQ disabled, dropping message"
                );
                Ok(())
            }
        }
    }

    async fn ack(&self, delivery: &dyn Delivery) {
        if let Err(err) = delivery.ack().await {
            warn!(error = %err, "ack failed");
        }
    }

    async fn nak(&self, delivery: &dyn Delivery, delay: Option<Duration>) {
        if let Err(err) = delivery.nak(delay).await {
            warn!(error = %err, "nak failed");
        }
    }
}

/// `class: message` rendering for error records.
fn display_error(err: &anyhow::Error) -> String {
    match err.downcast_ref::<Error>() {
        Some(typed) => typed.to_string(),
        None => format!("Error: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inbox::InboxStatus;
    use crate::registry::Handler;
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[derive(Debug, PartialEq, Clone, Copy)]
    enum Settled {
        Acked,
        Naked,
    }

    struct FakeDelivery {
        payload: Vec<u8>,
        subject: String,
        deliveries: i64,
        settled: Mutex<Vec<Settled>>,
    }

    impl FakeDelivery {
        fn new(payload: Vec<u8>, deliveries: i64) -> Self {
            Self {
                payload,
                subject: "test.app1.users.user.created".into(),
                deliveries,
                settled: Mutex::new(Vec::new()),
            }
        }

        fn outcome(&self) -> Vec<Settled> {
            self.settled.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Delivery for FakeDelivery {
        fn payload(&self) -> &[u8] {
            &self.payload
        }

        fn subject(&self) -> &str {
            &self.subject
        }

        fn stream_sequence(&self) -> u64 {
            7
        }

        fn deliveries(&self) -> i64 {
            self.deliveries
        }

        async fn ack(&self) -> Result<(), Error> {
            self.settled.lock().unwrap().push(Settled::Acked);
            Ok(())
        }

        async fn nak(&self, _delay: Option<Duration>) -> Result<(), Error> {
            self.settled.lock().unwrap().push(Settled::Naked);
            Ok(())
        }
    }

    struct ScriptedHandler {
        calls: AtomicUsize,
        fail_first: usize,
        unrecoverable: bool,
        forced_action: Option<ErrorAction>,
    }

    impl ScriptedHandler {
        fn always_ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first: 0,
                unrecoverable: false,
                forced_action: None,
            }
        }

        fn failing(fail_first: usize) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_first,
                unrecoverable: false,
                forced_action: None,
            }
        }
    }

    #[async_trait]
    impl Handler for ScriptedHandler {
        fn filters(&self) -> Vec<String> {
            vec!["users.user.created".into()]
        }

        async fn handle(&self, _message: Value, _ctx: &MessageContext) -> anyhow::Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.fail_first {
                if self.unrecoverable {
                    anyhow::bail!(Error::unrecoverable("tenant not found"));
                }
                anyhow::bail!("boom");
            }
            Ok(())
        }

        fn on_error(&self, _ctx: &ErrorContext) -> Option<ErrorAction> {
            self.forced_action
        }
    }

    #[derive(Default)]
    struct CaptureSink {
        records: Mutex<Vec<DlqRecord>>,
        fail: bool,
    }

    #[async_trait]
    impl DeadLetterSink for CaptureSink {
        async fn publish(&self, record: &DlqRecord) -> Result<(), Error> {
            if self.fail {
                return Err(Error::dlq("dlq stream gone"));
            }
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[derive(Default)]
    struct MemoryInbox {
        rows: Mutex<HashMap<Uuid, InboxStatus>>,
    }

    #[async_trait]
    impl InboxStore for MemoryInbox {
        async fn claim(
            &self,
            event_id: Uuid,
            _subject: &str,
            _stream: &str,
            _stream_seq: u64,
        ) -> Result<ClaimOutcome, Error> {
            let mut rows = self.rows.lock().unwrap();
            match rows.get(&event_id) {
                None => {
                    rows.insert(event_id, InboxStatus::Processing);
                    Ok(ClaimOutcome::New)
                }
                Some(InboxStatus::Processed) => Ok(ClaimOutcome::Processed),
                Some(InboxStatus::Failed) => {
                    rows.insert(event_id, InboxStatus::Processing);
                    Ok(ClaimOutcome::New)
                }
                Some(_) => Ok(ClaimOutcome::InProgress),
            }
        }

        async fn mark_processed(&self, event_id: Uuid) -> Result<(), Error> {
            self.rows
                .lock()
                .unwrap()
                .insert(event_id, InboxStatus::Processed);
            Ok(())
        }

        async fn mark_failed(&self, event_id: Uuid, _last_error: &str) -> Result<(), Error> {
            self.rows
                .lock()
                .unwrap()
                .insert(event_id, InboxStatus::Failed);
            Ok(())
        }

        async fn sweep(&self, _older_than: OffsetDateTime) -> Result<u64, Error> {
            Ok(0)
        }
    }

    fn settings() -> ProcessorSettings {
        ProcessorSettings {
            stream: "app1-test".into(),
            strict_envelope: false,
            on_malformed: MalformedPolicy::DeadLetter,
            on_max_deliver: MaxDeliverPolicy::Drop,
            inbox_busy_delay: Duration::from_millis(100),
        }
    }

    fn subscription(handler: Arc<dyn Handler>, max_deliver: i64) -> Subscription {
        Subscription {
            filter: "test.app1.users.user.created".into(),
            max_deliver,
            ack_wait: Duration::from_secs(5),
            runtimes: vec![SubscriptionRuntime {
                handler,
                chain: Chain::new(),
            }],
        }
    }

    fn envelope_bytes(event_id: Option<Uuid>) -> Vec<u8> {
        let mut envelope = Envelope::new("users.user.created", "app1", json!({"id": "u1"}));
        if let Some(id) = event_id {
            envelope.event_id = id;
        }
        envelope.encode().unwrap()
    }

    #[tokio::test]
    async fn success_acks_once() {
        let handler = Arc::new(ScriptedHandler::always_ok());
        let processor = MessageProcessor::new(settings(), None, None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 1);

        processor
            .process(&delivery, &subscription(handler.clone(), 5))
            .await;
        assert_eq!(delivery.outcome(), vec![Settled::Acked]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_below_max_deliver_naks() {
        let handler = Arc::new(ScriptedHandler::failing(usize::MAX));
        let sink = Arc::new(CaptureSink::default());
        let processor = MessageProcessor::new(settings(), Some(sink.clone()), None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 2);

        processor.process(&delivery, &subscription(handler, 5)).await;
        assert_eq!(delivery.outcome(), vec![Settled::Naked]);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn exhausted_deliveries_go_to_dlq_and_ack() {
        let handler = Arc::new(ScriptedHandler::failing(usize::MAX));
        let sink = Arc::new(CaptureSink::default());
        let processor = MessageProcessor::new(settings(), Some(sink.clone()), None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 3);

        processor.process(&delivery, &subscription(handler, 3)).await;
        assert_eq!(delivery.outcome(), vec![Settled::Acked]);

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].reason, DlqReason::MaxDeliverExceeded);
        assert_eq!(records[0].deliveries, 3);
        assert_eq!(records[0].error, "Error: boom");
        assert!(records[0].event_id.is_some());
    }

    #[tokio::test]
    async fn exhausted_deliveries_with_nak_policy_stay_parked() {
        let handler = Arc::new(ScriptedHandler::failing(usize::MAX));
        let mut config = settings();
        config.on_max_deliver = MaxDeliverPolicy::Nak;
        let sink = Arc::new(CaptureSink::default());
        let processor = MessageProcessor::new(config, Some(sink.clone()), None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 3);

        processor.process(&delivery, &subscription(handler, 3)).await;
        assert_eq!(delivery.outcome(), vec![Settled::Naked]);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unrecoverable_errors_skip_retries() {
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            unrecoverable: true,
            forced_action: None,
        });
        let sink = Arc::new(CaptureSink::default());
        let processor = MessageProcessor::new(settings(), Some(sink.clone()), None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 1);

        processor.process(&delivery, &subscription(handler, 5)).await;
        assert_eq!(delivery.outcome(), vec![Settled::Acked]);
        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].reason, DlqReason::Unrecoverable);
        assert!(records[0].error.contains("tenant not found"));
    }

    #[tokio::test]
    async fn malformed_payload_is_dead_lettered_with_raw_bytes() {
        let sink = Arc::new(CaptureSink::default());
        let processor = MessageProcessor::new(settings(), Some(sink.clone()), None);
        let handler = Arc::new(ScriptedHandler::always_ok());
        let delivery = FakeDelivery::new(b"not json".to_vec(), 1);

        processor
            .process(&delivery, &subscription(handler.clone(), 5))
            .await;
        assert_eq!(delivery.outcome(), vec![Settled::Acked]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);

        let records = sink.records.lock().unwrap();
        assert_eq!(records[0].reason, DlqReason::HandlerError);
        assert_eq!(records[0].raw_payload().unwrap(), b"not json");
        assert!(records[0].event_id.is_none());
    }

    #[tokio::test]
    async fn malformed_payload_discard_policy_just_acks() {
        let mut config = settings();
        config.on_malformed = MalformedPolicy::Discard;
        let sink = Arc::new(CaptureSink::default());
        let processor = MessageProcessor::new(config, Some(sink.clone()), None);
        let delivery = FakeDelivery::new(b"not json".to_vec(), 1);

        processor
            .process(&delivery, &subscription(Arc::new(ScriptedHandler::always_ok()), 5))
            .await;
        assert_eq!(delivery.outcome(), vec![Settled::Acked]);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dlq_publish_failure_degrades_to_nak() {
        let handler = Arc::new(ScriptedHandler::failing(usize::MAX));
        let sink = Arc::new(CaptureSink {
            fail: true,
            ..Default::default()
        });
        let processor = MessageProcessor::new(settings(), Some(sink), None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 3);

        processor.process(&delivery, &subscription(handler, 3)).await;
        assert_eq!(delivery.outcome(), vec![Settled::Naked]);
    }

    #[tokio::test]
    async fn inbox_deduplicates_processed_events() {
        let inbox = Arc::new(MemoryInbox::default());
        let handler = Arc::new(ScriptedHandler::always_ok());
        let processor = MessageProcessor::new(settings(), None, Some(inbox.clone()));
        let event_id = Uuid::new_v4();
        let subscription = subscription(handler.clone(), 5);

        let first = FakeDelivery::new(envelope_bytes(Some(event_id)), 1);
        processor.process(&first, &subscription).await;
        assert_eq!(first.outcome(), vec![Settled::Acked]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);

        let second = FakeDelivery::new(envelope_bytes(Some(event_id)), 2);
        processor.process(&second, &subscription).await;
        assert_eq!(second.outcome(), vec![Settled::Acked]);
        // The duplicate never reached the handler.
        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn inbox_busy_claim_naks_with_delay() {
        let inbox = Arc::new(MemoryInbox::default());
        let event_id = Uuid::new_v4();
        inbox
            .rows
            .lock()
            .unwrap()
            .insert(event_id, InboxStatus::Processing);
        let handler = Arc::new(ScriptedHandler::always_ok());
        let processor = MessageProcessor::new(settings(), None, Some(inbox));
        let delivery = FakeDelivery::new(envelope_bytes(Some(event_id)), 1);

        processor.process(&delivery, &subscription(handler.clone(), 5)).await;
        assert_eq!(delivery.outcome(), vec![Settled::Naked]);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 0);
    }

    struct SlowHandler;

    #[async_trait]
    impl Handler for SlowHandler {
        fn filters(&self) -> Vec<String> {
            vec!["users.user.created".into()]
        }

        async fn handle(&self, _message: Value, _ctx: &MessageContext) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn handler_over_budget_is_retried() {
        let processor = MessageProcessor::new(settings(), None, None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 1);
        let subscription = Subscription {
            filter: "test.app1.users.user.created".into(),
            max_deliver: 5,
            ack_wait: Duration::from_millis(20),
            runtimes: vec![SubscriptionRuntime {
                handler: Arc::new(SlowHandler),
                chain: Chain::new(),
            }],
        };

        processor.process(&delivery, &subscription).await;
        assert_eq!(delivery.outcome(), vec![Settled::Naked]);
    }

    #[tokio::test]
    async fn on_error_override_wins() {
        let handler = Arc::new(ScriptedHandler {
            calls: AtomicUsize::new(0),
            fail_first: usize::MAX,
            unrecoverable: false,
            forced_action: Some(ErrorAction::Discard),
        });
        let sink = Arc::new(CaptureSink::default());
        let processor = MessageProcessor::new(settings(), Some(sink.clone()), None);
        let delivery = FakeDelivery::new(envelope_bytes(None), 1);

        processor.process(&delivery, &subscription(handler, 5)).await;
        assert_eq!(delivery.outcome(), vec![Settled::Acked]);
        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn second_handler_failure_settles_once() {
        let ok = Arc::new(ScriptedHandler::always_ok());
        let failing = Arc::new(ScriptedHandler::failing(usize::MAX));
        let processor = MessageProcessor::new(settings(), None, None);
        let subscription = Subscription {
            filter: "test.app1.users.user.created".into(),
            max_deliver: 5,
            ack_wait: Duration::from_secs(5),
            runtimes: vec![
                SubscriptionRuntime {
                    handler: ok.clone(),
                    chain: Chain::new(),
                },
                SubscriptionRuntime {
                    handler: failing,
                    chain: Chain::new(),
                },
            ],
        };
        let delivery = FakeDelivery::new(envelope_bytes(None), 1);

        processor.process(&delivery, &subscription).await;
        assert_eq!(delivery.outcome(), vec![Settled::Naked]);
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
    }
}
