//! Courier: a declarative publish/subscribe runtime on NATS JetStream.
//!
//! Application code publishes to topics and registers handlers on subject
//! filters; the engine owns topology provisioning, at-least-once delivery
//! with bounded retries and backoff, dead-letter routing, the transactional
//! outbox, and the idempotent inbox.
//!
//! ```no_run
//! use std::sync::Arc;
//! use async_trait::async_trait;
//! use courier_core::{Config, Engine, Handler, MessageContext, PublishOptions};
//! use serde_json::Value;
//!
//! struct UserCreated;
//!
//! #[async_trait]
//! impl Handler for UserCreated {
//!     fn filters(&self) -> Vec<String> {
//!         vec!["users.user.created".into()]
//!     }
//!
//!     async fn handle(&self, message: Value, ctx: &MessageContext) -> anyhow::Result<()> {
//!         tracing::info!(subject = %ctx.subject, ?message, "user created");
//!         Ok(())
//!     }
//! }
//!
//! # async fn run() -> anyhow::Result<()> {
//! let engine = Engine::builder(Config::new("dev", "accounts"))
//!     .register(Arc::new(UserCreated))
//!     .build()?;
//! engine.start().await?;
//! engine
//!     .publisher()
//!     .await?
//!     .publish("users.user.created", serde_json::json!({"id": "u1"}), PublishOptions::default())
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod breaker;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod context;
pub mod dlq;
pub mod duration;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod global;
pub mod health;
pub mod inbox;
pub mod middleware;
pub mod outbox;
pub mod processor;
pub mod publish;
pub mod registry;
pub mod schema;
pub mod shutdown;
pub mod subject;
pub mod topology;

pub use breaker::{BreakerSettings, BreakerState, CircuitBreaker};
pub use config::{Config, MalformedPolicy, MaxDeliverPolicy, OutboxSettings};
pub use connection::{Connection, Handle};
pub use context::{ErrorContext, MessageContext};
pub use dlq::{DeadLetterSink, DlqReason, DlqRecord};
pub use engine::{Engine, EngineBuilder, EngineState};
pub use envelope::Envelope;
pub use error::{Error, ErrorAction, ErrorKind};
pub use health::{ComponentStatus, HealthReport};
pub use inbox::{ClaimOutcome, InboxRecord, InboxStatus, InboxStore};
pub use middleware::{Chain, Middleware, Next, ResourceScope};
pub use outbox::{
    NewOutboxRecord, OutboxRecord, OutboxRelay, OutboxStats, OutboxStatus, OutboxStore, OutboxTx,
};
pub use processor::{Delivery, MessageProcessor, Subscription};
pub use publish::{
    PublishBatch, PublishOptions, PublishResult, PublishStatus, Publisher, WireAck, WirePublisher,
};
pub use registry::{Handler, Registry, SubscriptionOptions};
pub use schema::{FieldError, JsonSchema, SchemaValidator};
pub use topology::{ensure_topology, Topology};
