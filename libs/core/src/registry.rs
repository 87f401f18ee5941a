//! Declarative subscriber registration.
//!
//! Registration is explicit: the embedding application constructs its
//! handlers and hands them to the registry before the engine starts. There is
//! no import-time magic and no global mutable state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::breaker::BreakerSettings;
use crate::context::{ErrorContext, MessageContext};
use crate::error::{Error, ErrorAction};
use crate::subject;

/// Per-subscription tuning; unset fields fall back to the engine config.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionOptions {
    pub max_deliver: Option<i64>,
    pub ack_wait: Option<Duration>,
    pub concurrency: Option<usize>,
    /// Redelivery delay schedule declared on the durable consumer.
    pub backoff: Option<Vec<Duration>>,
    /// JSON schema the decoded payload must satisfy before the handler runs.
    pub schema: Option<Value>,
    pub circuit_breaker: Option<BreakerSettings>,
}

/// A subscriber: one or more topic filters plus the handling logic.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Topic-level filters, e.g. `users.user.created`, `users.*.created`,
    /// `users.>`. The engine prefixes `{env}.{app}.` to form wire filters.
    fn filters(&self) -> Vec<String>;

    fn options(&self) -> SubscriptionOptions {
        SubscriptionOptions::default()
    }

    /// A normal return is success; an error routes through the error policy.
    async fn handle(&self, message: Value, ctx: &MessageContext) -> anyhow::Result<()>;

    /// Per-subscriber error policy override. `None` defers to the default.
    fn on_error(&self, _ctx: &ErrorContext) -> Option<ErrorAction> {
        None
    }
}

/// Maps wire filter -> ordered handlers. Written before start, read-only after.
pub struct Registry {
    env: String,
    app: String,
    entries: HashMap<String, Vec<Arc<dyn Handler>>>,
}

impl Registry {
    pub fn new(env: impl Into<String>, app: impl Into<String>) -> Self {
        Self {
            env: env.into(),
            app: app.into(),
            entries: HashMap::new(),
        }
    }

    /// Adds the handler under every filter it declares. The same handler may
    /// appear under multiple filters, and multiple handlers may share one.
    pub fn register(&mut self, handler: Arc<dyn Handler>) -> Result<(), Error> {
        let filters = handler.filters();
        if filters.is_empty() {
            return Err(Error::configuration("handler declares no filters"));
        }
        for topic in filters {
            let wire = subject::build_filter(&self.env, &self.app, &topic)?;
            self.entries.entry(wire).or_default().push(handler.clone());
        }
        Ok(())
    }

    /// Distinct wire filters; the consumer creates exactly one durable each.
    pub fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self.entries.keys().cloned().collect();
        filters.sort();
        filters
    }

    pub fn handlers_for(&self, wire_filter: &str) -> &[Arc<dyn Handler>] {
        self.entries
            .get(wire_filter)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn handler_count(&self) -> usize {
        self.entries.values().map(Vec::len).sum()
    }
}
