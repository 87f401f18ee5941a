//! The long-lived engine value binding publisher, consumers, outbox relay,
//! inbox sweeper, and shutdown into one lifecycle.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

use crate::config::Config;
use crate::connection::Connection;
use crate::consumer::{start_consumers, StartedConsumer};
use crate::dlq::{DeadLetterSink, JetStreamDlq};
use crate::error::Error;
use crate::health::{HealthCheck, HealthReport};
use crate::inbox::{InboxStore, InboxSweeper};
use crate::middleware::{
    Chain, LoggingMiddleware, MetricsMiddleware, Middleware, ResourceScope, RetryLoggerMiddleware,
    ScopeMiddleware,
};
use crate::outbox::{OutboxRelay, OutboxStore};
use crate::processor::{MessageProcessor, ProcessorSettings};
use crate::publish::{JetStreamPublisher, Publisher};
use crate::registry::{Handler, Registry};
use crate::shutdown::Shutdown;
use crate::topology::ensure_topology;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Running,
    Draining,
    Stopped,
}

/// Collects configuration, persistence bindings, and handlers before start.
pub struct EngineBuilder {
    config: Config,
    middleware: Vec<Arc<dyn Middleware>>,
    scope: Option<Arc<dyn ResourceScope>>,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    inbox_store: Option<Arc<dyn InboxStore>>,
    dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            middleware: Vec::new(),
            scope: None,
            outbox_store: None,
            inbox_store: None,
            dead_letter_sink: None,
            handlers: Vec::new(),
        }
    }

    /// Appends to the shared chain, after the built-in middleware.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Resource acquired around every handler execution (e.g. a pooled DB
    /// connection).
    pub fn resource_scope(mut self, scope: Arc<dyn ResourceScope>) -> Self {
        self.scope = Some(scope);
        self
    }

    /// Persistence binding for the outbox (`use_outbox` requires it).
    pub fn outbox_store(mut self, store: Arc<dyn OutboxStore>) -> Self {
        self.outbox_store = Some(store);
        self
    }

    /// Persistence binding for the inbox (`use_inbox` requires it).
    pub fn inbox_store(mut self, store: Arc<dyn InboxStore>) -> Self {
        self.inbox_store = Some(store);
        self
    }

    /// Replaces the JetStream DLQ sink; tests use a capturing one.
    pub fn dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letter_sink = Some(sink);
        self
    }

    pub fn register(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn build(self) -> Result<Engine, Error> {
        self.config.validate()?;
        if self.config.use_outbox && self.outbox_store.is_none() {
            return Err(Error::configuration(
                "use_outbox is set but no outbox store is bound",
            ));
        }
        if self.config.use_inbox && self.inbox_store.is_none() {
            return Err(Error::configuration(
                "use_inbox is set but no inbox store is bound",
            ));
        }

        let mut registry = Registry::new(self.config.env.clone(), self.config.app_name.clone());
        for handler in self.handlers {
            registry.register(handler)?;
        }

        let mut chain = Chain::new()
            .with(Arc::new(LoggingMiddleware))
            .with(Arc::new(RetryLoggerMiddleware))
            .with(Arc::new(MetricsMiddleware));
        if let Some(scope) = &self.scope {
            chain.push(Arc::new(ScopeMiddleware::new(scope.clone())));
        }
        for middleware in self.middleware {
            chain.push(middleware);
        }

        let connection = Arc::new(Connection::new(
            self.config.nats_urls.clone(),
            self.config.connect.clone(),
        ));

        Ok(Engine {
            config: self.config,
            connection,
            registry,
            chain,
            outbox_store: self.outbox_store,
            inbox_store: self.inbox_store,
            dead_letter_sink: self.dead_letter_sink,
            state: Mutex::new(EngineState::Created),
            shutdown: AsyncMutex::new(None),
            consumers: Mutex::new(Vec::new()),
        })
    }
}

pub struct Engine {
    config: Config,
    connection: Arc<Connection>,
    registry: Registry,
    chain: Chain,
    outbox_store: Option<Arc<dyn OutboxStore>>,
    inbox_store: Option<Arc<dyn InboxStore>>,
    dead_letter_sink: Option<Arc<dyn DeadLetterSink>>,
    state: Mutex<EngineState>,
    shutdown: AsyncMutex<Option<Shutdown>>,
    consumers: Mutex<Vec<StartedConsumer>>,
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine").field("config", &self.config).finish()
    }
}

impl Engine {
    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Shared connection handle, dialing on first use.
    pub async fn connection_handle(&self) -> Result<crate::connection::Handle, Error> {
        self.connection.ensure().await
    }

    /// Publisher bound to the shared connection; usable before `start()` for
    /// publish-only processes.
    pub async fn publisher(&self) -> Result<Publisher, Error> {
        let handle = self.connection.ensure().await?;
        Ok(Publisher::new(
            self.config.env.clone(),
            self.config.app_name.clone(),
            Arc::new(JetStreamPublisher::new(handle.jetstream)),
        ))
    }

    pub fn health(&self) -> HealthCheck {
        HealthCheck::new(
            self.connection.clone(),
            self.config.stream_name(),
            self.outbox_store.clone(),
        )
    }

    pub async fn health_report(&self) -> HealthReport {
        self.health().check().await
    }

    /// Connects, provisions topology, and spawns consumers, relay, and
    /// sweeper. Fatal setup errors surface here; afterwards nothing escapes
    /// the processor boundary.
    pub async fn start(&self) -> Result<(), Error> {
        match self.state() {
            EngineState::Created | EngineState::Stopped => {}
            state => {
                return Err(Error::configuration(format!(
                    "engine cannot start from {state:?}"
                )))
            }
        }

        let handle = self.connection.ensure().await?;
        let topology = ensure_topology(&handle.jetstream, &self.config).await?;
        info!(
            stream = %topology.stream,
            filter = %topology.events_filter,
            dlq = topology.dlq_subject.as_deref().unwrap_or("disabled"),
            "topology provisioned"
        );

        let shutdown = Shutdown::new();

        let dlq_sink: Option<Arc<dyn DeadLetterSink>> = if self.config.use_dlq {
            Some(match &self.dead_letter_sink {
                Some(sink) => sink.clone(),
                None => Arc::new(JetStreamDlq::new(
                    handle.jetstream.clone(),
                    self.config.dlq_subject(),
                    self.config.dlq_max_attempts,
                )),
            })
        } else {
            None
        };

        let inbox = self
            .config
            .use_inbox
            .then(|| self.inbox_store.clone())
            .flatten();
        let processor = Arc::new(MessageProcessor::new(
            ProcessorSettings {
                stream: topology.stream.clone(),
                strict_envelope: self.config.strict_envelope,
                on_malformed: self.config.on_malformed,
                on_max_deliver: self.config.on_max_deliver,
                inbox_busy_delay: Duration::from_secs(1),
            },
            dlq_sink,
            inbox.clone(),
        ));

        if !self.registry.is_empty() {
            let started = start_consumers(
                &handle.jetstream,
                &self.config,
                &self.registry,
                &self.chain,
                processor,
                shutdown.token(),
                shutdown.tracker(),
            )
            .await?;
            *self.consumers.lock().unwrap_or_else(|e| e.into_inner()) = started;
        }

        if self.config.use_outbox {
            if let Some(store) = &self.outbox_store {
                let relay = OutboxRelay::new(
                    store.clone(),
                    Arc::new(JetStreamPublisher::new(handle.jetstream.clone())),
                    self.config.outbox.clone(),
                );
                let token = shutdown.token();
                shutdown.tracker().spawn(async move {
                    relay.run(token).await;
                });
            }
        }

        if let Some(store) = inbox {
            let sweeper = InboxSweeper::new(store, self.config.inbox_retention);
            let token = shutdown.token();
            shutdown.tracker().spawn(async move {
                sweeper.run(token).await;
            });
        }

        *self.shutdown.lock().await = Some(shutdown);
        self.set_state(EngineState::Running);
        info!(
            app = %self.config.app_name,
            env = %self.config.env,
            handlers = self.registry.handler_count(),
            "engine running"
        );
        Ok(())
    }

    /// Graceful stop: no new fetches, drain in-flight work within the
    /// configured deadline, flush and close the connection.
    pub async fn stop(&self) -> Result<(), Error> {
        if self.state() != EngineState::Running {
            return Ok(());
        }
        self.set_state(EngineState::Draining);
        if let Some(shutdown) = self.shutdown.lock().await.take() {
            shutdown.drain(self.config.drain_timeout).await;
        }
        self.connection.disconnect().await?;
        self.set_state(EngineState::Stopped);
        info!("engine stopped");
        Ok(())
    }

    pub fn consumers(&self) -> Vec<StartedConsumer> {
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}
