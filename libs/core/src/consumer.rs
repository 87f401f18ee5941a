//! Durable pull consumers: one per distinct filter subject, each feeding a
//! bounded worker pool.

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{
    self,
    consumer::{pull::Config as PullConfig, AckPolicy, DeliverPolicy, ReplayPolicy},
};
use futures::StreamExt;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::breaker::CircuitBreaker;
use crate::config::Config;
use crate::error::Error;
use crate::middleware::{BreakerMiddleware, Chain, Middleware, SchemaMiddleware};
use crate::processor::{JsDelivery, MessageProcessor, Subscription, SubscriptionRuntime};
use crate::registry::Registry;
use crate::schema::JsonSchema;
use crate::subject;

/// Fetch deadline per pull; short enough to notice shutdown promptly.
const FETCH_EXPIRES: Duration = Duration::from_secs(5);
/// Pause after a failed pull so a disconnected consumer does not spin.
const FETCH_RETRY_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct StartedConsumer {
    pub filter: String,
    pub durable: String,
}

/// Builds the runtime state for one filter: every handler gets the shared
/// chain extended with its own schema and breaker middleware.
pub(crate) fn build_subscription(
    filter: &str,
    registry: &Registry,
    base_chain: &Chain,
    config: &Config,
) -> Result<Subscription, Error> {
    let handlers = registry.handlers_for(filter);
    let mut runtimes = Vec::with_capacity(handlers.len());
    for handler in handlers {
        let options = handler.options();
        let mut extras: Vec<Arc<dyn Middleware>> = Vec::new();
        if let Some(schema) = &options.schema {
            let compiled = JsonSchema::compile(schema)?;
            extras.push(Arc::new(SchemaMiddleware::new(Arc::new(compiled))));
        }
        if let Some(breaker) = &options.circuit_breaker {
            let breaker = CircuitBreaker::new(filter.to_string(), breaker.clone());
            extras.push(Arc::new(BreakerMiddleware::new(Arc::new(breaker))));
        }
        runtimes.push(SubscriptionRuntime {
            handler: handler.clone(),
            chain: base_chain.extended(extras),
        });
    }
    let lead_options = handlers.first().map(|h| h.options()).unwrap_or_default();
    Ok(Subscription {
        filter: filter.to_string(),
        max_deliver: lead_options.max_deliver.unwrap_or(config.max_deliver),
        ack_wait: lead_options.ack_wait.unwrap_or(config.ack_wait),
        runtimes,
    })
}

/// Consumer-level settings come from the first handler registered under the
/// filter; unset fields fall back to the engine config.
pub(crate) fn pull_config(filter: &str, config: &Config, subscription: &Subscription) -> PullConfig {
    let options = subscription
        .runtimes
        .first()
        .map(|r| r.handler.options())
        .unwrap_or_default();
    let concurrency = options.concurrency.unwrap_or(config.concurrency);
    PullConfig {
        durable_name: Some(subject::durable_name(&config.app_name, filter)),
        deliver_policy: DeliverPolicy::All,
        ack_policy: AckPolicy::Explicit,
        replay_policy: ReplayPolicy::Instant,
        filter_subject: filter.to_string(),
        max_deliver: subscription.max_deliver,
        ack_wait: options.ack_wait.unwrap_or(config.ack_wait),
        // Backpressure is enforced at the source: the broker never hands out
        // more un-acked messages than the worker pool can hold.
        max_ack_pending: concurrency as i64,
        backoff: options.backoff.unwrap_or_else(|| config.backoff.clone()),
        ..Default::default()
    }
}

/// Creates the durables and spawns one fetch loop per filter subject.
pub async fn start_consumers(
    js: &jetstream::Context,
    config: &Config,
    registry: &Registry,
    base_chain: &Chain,
    processor: Arc<MessageProcessor>,
    token: CancellationToken,
    tracker: &TaskTracker,
) -> Result<Vec<StartedConsumer>, Error> {
    let stream = js
        .get_stream(config.stream_name())
        .await
        .map_err(|e| Error::subscription(format!("get stream {}: {e}", config.stream_name())))?;

    let mut started = Vec::new();
    for filter in registry.filters() {
        let subscription = Arc::new(build_subscription(&filter, registry, base_chain, config)?);
        let pull = pull_config(&filter, config, &subscription);
        let durable = pull
            .durable_name
            .clone()
            .unwrap_or_else(|| subject::durable_name(&config.app_name, &filter));
        let concurrency = pull.max_ack_pending as usize;

        let consumer = stream
            .get_or_create_consumer(&durable, pull)
            .await
            .map_err(|e| Error::subscription(format!("create consumer {durable}: {e}")))?;

        info!(
            filter = %filter,
            durable = %durable,
            concurrency,
            "consumer listening"
        );

        let loop_token = token.clone();
        let loop_tracker = tracker.clone();
        let loop_processor = processor.clone();
        let loop_subscription = subscription.clone();
        tracker.spawn(fetch_loop(
            consumer,
            loop_subscription,
            loop_processor,
            concurrency,
            loop_token,
            loop_tracker,
        ));

        started.push(StartedConsumer { filter, durable });
    }
    Ok(started)
}

/// Pulls batches and fans deliveries out to the worker pool until cancelled.
async fn fetch_loop(
    consumer: jetstream::consumer::Consumer<PullConfig>,
    subscription: Arc<Subscription>,
    processor: Arc<MessageProcessor>,
    concurrency: usize,
    token: CancellationToken,
    tracker: TaskTracker,
) {
    let workers = Arc::new(Semaphore::new(concurrency));
    loop {
        if token.is_cancelled() {
            break;
        }
        let batch = tokio::select! {
            _ = token.cancelled() => break,
            batch = consumer
                .batch()
                .max_messages(concurrency)
                .expires(FETCH_EXPIRES)
                .messages() => batch,
        };
        let mut messages = match batch {
            Ok(messages) => messages,
            Err(err) => {
                // Likely a broker outage; the loop resumes once the shared
                // connection reconnects.
                warn!(
                    filter = %subscription.filter,
                    error = %err,
                    "pull failed, retrying"
                );
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(FETCH_RETRY_PAUSE) => continue,
                }
            }
        };

        while let Some(next) = messages.next().await {
            let message = match next {
                Ok(message) => message,
                Err(err) => {
                    warn!(filter = %subscription.filter, error = %err, "batch read error");
                    break;
                }
            };
            let delivery = match JsDelivery::new(message) {
                Ok(delivery) => delivery,
                Err(err) => {
                    // No delivery info, no ack; the broker redelivers after
                    // the ack wait.
                    error!(filter = %subscription.filter, error = %err, "dropping unreadable delivery");
                    continue;
                }
            };
            let permit = match workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let task_processor = processor.clone();
            let task_subscription = subscription.clone();
            tracker.spawn(async move {
                task_processor
                    .process(&delivery, task_subscription.as_ref())
                    .await;
                drop(permit);
            });
        }
    }
    info!(filter = %subscription.filter, "fetch loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::breaker::BreakerSettings;
    use crate::context::MessageContext;
    use crate::registry::{Handler, SubscriptionOptions};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct Configurable {
        filters: Vec<String>,
        options: SubscriptionOptions,
    }

    #[async_trait]
    impl Handler for Configurable {
        fn filters(&self) -> Vec<String> {
            self.filters.clone()
        }

        fn options(&self) -> SubscriptionOptions {
            self.options.clone()
        }

        async fn handle(&self, _message: Value, _ctx: &MessageContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn registry_with(options: SubscriptionOptions) -> Registry {
        let mut registry = Registry::new("test", "app1");
        registry
            .register(Arc::new(Configurable {
                filters: vec!["users.user.created".into()],
                options,
            }))
            .unwrap();
        registry
    }

    #[test]
    fn pull_config_defaults_from_engine_config() {
        let config = Config::new("test", "app1");
        let registry = registry_with(SubscriptionOptions::default());
        let chain = Chain::new();
        let subscription =
            build_subscription("test.app1.users.user.created", &registry, &chain, &config).unwrap();
        let pull = pull_config("test.app1.users.user.created", &config, &subscription);

        assert_eq!(
            pull.durable_name.as_deref(),
            Some("app1_test_app1_users_user_created")
        );
        assert_eq!(pull.filter_subject, "test.app1.users.user.created");
        assert_eq!(pull.max_deliver, 5);
        assert_eq!(pull.max_ack_pending, 5);
        assert_eq!(pull.ack_wait, Duration::from_secs(30));
        assert_eq!(pull.backoff, config.backoff);
        assert_eq!(pull.ack_policy, AckPolicy::Explicit);
    }

    #[test]
    fn handler_options_override_the_defaults() {
        let config = Config::new("test", "app1");
        let registry = registry_with(SubscriptionOptions {
            max_deliver: Some(3),
            ack_wait: Some(Duration::from_secs(10)),
            concurrency: Some(2),
            backoff: Some(vec![Duration::from_millis(10)]),
            ..Default::default()
        });
        let chain = Chain::new();
        let subscription =
            build_subscription("test.app1.users.user.created", &registry, &chain, &config).unwrap();
        let pull = pull_config("test.app1.users.user.created", &config, &subscription);

        assert_eq!(subscription.max_deliver, 3);
        assert_eq!(pull.max_deliver, 3);
        assert_eq!(pull.ack_wait, Duration::from_secs(10));
        assert_eq!(pull.max_ack_pending, 2);
        assert_eq!(pull.backoff, vec![Duration::from_millis(10)]);
    }

    #[test]
    fn per_handler_middleware_is_appended() {
        let config = Config::new("test", "app1");
        let registry = registry_with(SubscriptionOptions {
            schema: Some(json!({"type": "object"})),
            circuit_breaker: Some(BreakerSettings::default()),
            ..Default::default()
        });
        let base = Chain::new().with(Arc::new(crate::middleware::LoggingMiddleware));
        let subscription =
            build_subscription("test.app1.users.user.created", &registry, &base, &config).unwrap();

        assert_eq!(subscription.runtimes.len(), 1);
        // Shared chain + schema + breaker.
        assert_eq!(subscription.runtimes[0].chain.len(), 3);
    }

    #[test]
    fn invalid_schema_fails_subscription_setup() {
        let config = Config::new("test", "app1");
        let registry = registry_with(SubscriptionOptions {
            schema: Some(json!({"type": "nope"})),
            ..Default::default()
        });
        let chain = Chain::new();
        let err = build_subscription("test.app1.users.user.created", &registry, &chain, &config)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
