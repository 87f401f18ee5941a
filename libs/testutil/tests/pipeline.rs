//! End-to-end message-plane scenarios over the in-memory doubles: publisher
//! into the fake wire, redeliveries through the processor, outbox and inbox
//! semantics observable from the outside.

use std::sync::Arc;
use std::time::Duration;

use courier_core::config::{MalformedPolicy, MaxDeliverPolicy, OutboxSettings};
use courier_core::dlq::DlqReason;
use courier_core::middleware::Chain;
use courier_core::outbox::{OutboxRelay, OutboxStatus};
use courier_core::processor::{
    MessageProcessor, ProcessorSettings, Subscription, SubscriptionRuntime,
};
use courier_core::publish::{PublishOptions, PublishStatus, Publisher};
use courier_core::registry::Handler;
use courier_testutil::{
    CaptureSink, MemoryInbox, MemoryOutbox, MemoryWire, RecordingHandler, TestDelivery,
};
use serde_json::json;
use uuid::Uuid;

fn processor_settings() -> ProcessorSettings {
    ProcessorSettings {
        stream: "app1-test".into(),
        strict_envelope: false,
        on_malformed: MalformedPolicy::DeadLetter,
        on_max_deliver: MaxDeliverPolicy::Drop,
        inbox_busy_delay: Duration::from_millis(50),
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

#[tokio::test]
async fn happy_publish_subscribe_round_trip() {
    let wire = MemoryWire::new();
    let publisher = Publisher::new("test", "app1", wire.clone());

    publisher
        .publish_resource(
            "users",
            "user",
            "created",
            Some("u1"),
            json!({"id": "u1", "name": "Alice"}),
            PublishOptions::default(),
        )
        .await
        .unwrap();

    let published = wire.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].subject, "test.app1.users.user.created");

    let handler = RecordingHandler::new(vec!["users.user.created"]);
    let processor = MessageProcessor::new(processor_settings(), None, None);
    let delivery = TestDelivery::from_published(&published[0], 1);

    processor
        .process(&delivery, &subscription(handler.clone(), 5))
        .await;

    assert!(delivery.was_acked());
    let received = handler.received();
    assert_eq!(received.len(), 1);
    let (message, ctx) = &received[0];
    assert_eq!(message, &json!({"id": "u1", "name": "Alice"}));
    assert_eq!(ctx.subject, "test.app1.users.user.created");
    assert_eq!(ctx.domain.as_deref(), Some("users"));
    assert_eq!(ctx.action.as_deref(), Some("created"));
    assert_eq!(ctx.resource_id.as_deref(), Some("u1"));
}

#[tokio::test]
async fn retry_then_success_acks_on_the_third_attempt() {
    let wire = MemoryWire::new();
    let publisher = Publisher::new("test", "app1", wire.clone());
    publisher
        .publish("users.user.created", json!({"id": "u1"}), PublishOptions::default())
        .await
        .unwrap();
    let message = &wire.published()[0];

    let handler = RecordingHandler::new(vec!["users.user.created"]);
    handler.fail_first(2);
    let sink = CaptureSink::new();
    let processor = MessageProcessor::new(processor_settings(), Some(sink.clone()), None);
    let subscription = subscription(handler.clone(), 5);

    for attempt in 1..=2 {
        let delivery = TestDelivery::from_published(message, attempt);
        processor.process(&delivery, &subscription).await;
        assert!(delivery.was_naked(), "attempt {attempt} should be naked");
    }
    let third = TestDelivery::from_published(message, 3);
    processor.process(&third, &subscription).await;

    assert!(third.was_acked());
    assert_eq!(handler.invocations(), 3);
    assert_eq!(handler.received()[2].1.deliveries, 3);
    assert!(sink.records().is_empty());
}

#[tokio::test]
async fn max_deliver_routes_to_the_dead_letter_queue() {
    let wire = MemoryWire::new();
    let publisher = Publisher::new("test", "app1", wire.clone());
    let result = publisher
        .publish("users.user.created", json!({"id": "u1"}), PublishOptions::default())
        .await
        .unwrap();
    let message = &wire.published()[0];

    let handler = RecordingHandler::new(vec!["users.user.created"]);
    handler.fail_first(usize::MAX);
    let sink = CaptureSink::new();
    let processor = MessageProcessor::new(processor_settings(), Some(sink.clone()), None);

    let delivery = TestDelivery::from_published(message, 3);
    processor
        .process(&delivery, &subscription(handler, 3))
        .await;

    assert!(delivery.was_acked());
    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].reason, DlqReason::MaxDeliverExceeded);
    assert_eq!(records[0].deliveries, 3);
    assert_eq!(records[0].event_id, Some(result.event_id));
}

#[tokio::test]
async fn outbox_rows_flow_pending_to_published_through_the_relay() {
    let wire = MemoryWire::new();
    let outbox = MemoryOutbox::new();
    let publisher = Publisher::new("test", "app1", wire.clone());

    let mut tx = outbox.tx();
    let staged = publisher
        .publish_staged(
            &mut tx,
            "orders.order.placed",
            json!({"id": "o1"}),
            PublishOptions::default(),
        )
        .await
        .unwrap();
    assert_eq!(staged.status, PublishStatus::Pending);
    // Nothing reaches the broker before the transaction commits.
    assert!(wire.published().is_empty());
    tx.commit();

    let relay = OutboxRelay::new(
        outbox.clone(),
        wire.clone(),
        OutboxSettings {
            batch_size: 10,
            poll_interval: Duration::from_millis(10),
            max_attempts: 5,
            backoff: vec![Duration::from_millis(0)],
        },
    );
    let pass = relay.run_once().await.unwrap();
    assert_eq!(pass.published, 1);

    assert_eq!(outbox.status_of(staged.event_id), Some(OutboxStatus::Published));
    let published = wire.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].msg_id, staged.event_id.to_string());
    assert_eq!(published[0].subject, "test.app1.orders.order.placed");
}

#[tokio::test]
async fn inbox_invokes_the_handler_exactly_once_per_event_id() {
    let wire = MemoryWire::new();
    let publisher = Publisher::new("test", "app1", wire.clone());
    let event_id = Uuid::new_v4();
    publisher
        .publish(
            "users.user.created",
            json!({"id": "u1"}),
            PublishOptions {
                event_id: Some(event_id),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    let message = &wire.published()[0];

    let inbox = MemoryInbox::new();
    let handler = RecordingHandler::new(vec!["users.user.created"]);
    let processor = MessageProcessor::new(processor_settings(), None, Some(inbox.clone()));
    let subscription = subscription(handler.clone(), 5);

    let first = TestDelivery::from_published(message, 1);
    processor.process(&first, &subscription).await;
    assert!(first.was_acked());

    // A second delivery of the same event id is acked without invocation.
    let second = TestDelivery::from_published(message, 2);
    processor.process(&second, &subscription).await;
    assert!(second.was_acked());
    assert_eq!(handler.invocations(), 1);
}

#[tokio::test]
async fn malformed_bytes_park_in_the_dlq_with_raw_payload() {
    let sink = CaptureSink::new();
    let processor = MessageProcessor::new(processor_settings(), Some(sink.clone()), None);
    let handler = RecordingHandler::new(vec!["users.user.created"]);

    let delivery = TestDelivery::new("test.app1.users.user.created", b"not json".to_vec(), 1);
    processor
        .process(&delivery, &subscription(handler.clone(), 5))
        .await;

    assert!(delivery.was_acked());
    assert_eq!(handler.invocations(), 0);
    let records = sink.records();
    assert_eq!(records[0].reason, DlqReason::HandlerError);
    assert_eq!(records[0].raw_payload().unwrap(), b"not json");
}
