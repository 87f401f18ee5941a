//! Middleware chain around subscriber handlers.
//!
//! Middleware runs in insertion order; each one may short-circuit by not
//! invoking `next`. Errors from `next` propagate upward unless a middleware
//! catches them. The chain terminal calls `handler(payload, metadata)`.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{debug, warn};

use crate::breaker::CircuitBreaker;
use crate::context::MessageContext;
use crate::error::Error;
use crate::registry::Handler;
use crate::schema::{describe, SchemaValidator};

#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    async fn call(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> anyhow::Result<()>;
}

/// Continuation handed to each middleware.
pub struct Next<'a> {
    middleware: &'a [Arc<dyn Middleware>],
    handler: &'a dyn Handler,
}

impl<'a> Next<'a> {
    pub fn run<'b>(
        self,
        payload: &'b Value,
        ctx: &'b MessageContext,
    ) -> BoxFuture<'b, anyhow::Result<()>>
    where
        'a: 'b,
    {
        Box::pin(async move {
            match self.middleware.split_first() {
                Some((head, rest)) => {
                    head.call(
                        payload,
                        ctx,
                        Next {
                            middleware: rest,
                            handler: self.handler,
                        },
                    )
                    .await
                }
                None => self.handler.handle(payload.clone(), ctx).await,
            }
        })
    }
}

/// Immutable after engine start.
#[derive(Clone, Default)]
pub struct Chain {
    middleware: Vec<Arc<dyn Middleware>>,
}

impl Chain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, middleware: Arc<dyn Middleware>) {
        self.middleware.push(middleware);
    }

    pub fn with(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.push(middleware);
        self
    }

    /// Copy of this chain with subscription-specific middleware appended.
    pub fn extended(&self, extra: Vec<Arc<dyn Middleware>>) -> Chain {
        let mut middleware = self.middleware.clone();
        middleware.extend(extra);
        Chain { middleware }
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    pub async fn dispatch(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        handler: &dyn Handler,
    ) -> anyhow::Result<()> {
        Next {
            middleware: &self.middleware,
            handler,
        }
        .run(payload, ctx)
        .await
    }
}

/// Structured logging around each handler invocation.
pub struct LoggingMiddleware;

#[async_trait]
impl Middleware for LoggingMiddleware {
    async fn call(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        debug!(
            subject = %ctx.subject,
            event_id = %ctx.event_id,
            deliveries = ctx.deliveries,
            "handling message"
        );
        let result = next.run(payload, ctx).await;
        match &result {
            Ok(()) => debug!(
                subject = %ctx.subject,
                event_id = %ctx.event_id,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "message handled"
            ),
            Err(err) => warn!(
                subject = %ctx.subject,
                event_id = %ctx.event_id,
                error = %err,
                "handler failed"
            ),
        }
        result
    }
}

/// Flags redeliveries so retry storms are visible in the logs.
pub struct RetryLoggerMiddleware;

#[async_trait]
impl Middleware for RetryLoggerMiddleware {
    async fn call(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        if ctx.deliveries > 1 {
            warn!(
                subject = %ctx.subject,
                event_id = %ctx.event_id,
                deliveries = ctx.deliveries,
                "redelivered message"
            );
            counter!("courier_redelivery_total", "topic" => ctx.topic.clone()).increment(1);
        }
        next.run(payload, ctx).await
    }
}

/// Handler throughput and latency counters.
pub struct MetricsMiddleware;

#[async_trait]
impl Middleware for MetricsMiddleware {
    async fn call(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        let started = Instant::now();
        let result = next.run(payload, ctx).await;
        let outcome = if result.is_ok() { "ok" } else { "error" };
        counter!(
            "courier_handled_total",
            "topic" => ctx.topic.clone(),
            "outcome" => outcome
        )
        .increment(1);
        histogram!("courier_handle_seconds", "topic" => ctx.topic.clone())
            .record(started.elapsed().as_secs_f64());
        result
    }
}

/// Rejects payloads that fail the subscription's schema before the handler
/// ever sees them.
pub struct SchemaMiddleware {
    validator: Arc<dyn SchemaValidator>,
}

impl SchemaMiddleware {
    pub fn new(validator: Arc<dyn SchemaValidator>) -> Self {
        Self { validator }
    }
}

#[async_trait]
impl Middleware for SchemaMiddleware {
    async fn call(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        if let Err(errors) = self.validator.validate(payload) {
            return Err(Error::malformed(format!(
                "schema validation failed: {}",
                describe(&errors)
            ))
            .into());
        }
        next.run(payload, ctx).await
    }
}

/// Short-circuits handler calls while the breaker is open.
pub struct BreakerMiddleware {
    breaker: Arc<CircuitBreaker>,
}

impl BreakerMiddleware {
    pub fn new(breaker: Arc<CircuitBreaker>) -> Self {
        Self { breaker }
    }
}

#[async_trait]
impl Middleware for BreakerMiddleware {
    async fn call(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        self.breaker.try_enter()?;
        match next.run(payload, ctx).await {
            Ok(()) => {
                self.breaker.on_success();
                Ok(())
            }
            Err(err) => {
                self.breaker.on_failure();
                Err(err)
            }
        }
    }
}

/// Scoped acquisition of a pooled resource for the duration of one handler
/// execution. The guard drops on every exit path.
#[async_trait]
pub trait ResourceScope: Send + Sync {
    async fn acquire(&self) -> anyhow::Result<Box<dyn Any + Send>>;
}

pub struct ScopeMiddleware {
    scope: Arc<dyn ResourceScope>,
}

impl ScopeMiddleware {
    pub fn new(scope: Arc<dyn ResourceScope>) -> Self {
        Self { scope }
    }
}

#[async_trait]
impl Middleware for ScopeMiddleware {
    async fn call(
        &self,
        payload: &Value,
        ctx: &MessageContext,
        next: Next<'_>,
    ) -> anyhow::Result<()> {
        let _guard = self.scope.acquire().await?;
        next.run(payload, ctx).await
    }
}
