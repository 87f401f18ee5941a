//! Runtime configuration.
//!
//! A single keyed structure covers the whole engine. Observability is not
//! configured here: logging goes through `tracing` and metrics through the
//! `metrics` facade, so the embedding process decides the sinks.

use std::time::Duration;

use crate::duration;
use crate::error::Error;
use crate::subject;

/// What to do when a message exhausts `max_deliver` and the handler still fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MaxDeliverPolicy {
    /// Route to the DLQ when enabled, then ack; never redeliverable again.
    #[default]
    Drop,
    /// Nak with a warning and leave the message parked at the broker.
    Nak,
}

/// What to do with an undecodable envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MalformedPolicy {
    /// Preserve the raw bytes in a DLQ record, then ack.
    #[default]
    DeadLetter,
    /// Ack and drop.
    Discard,
}

/// Broker dial and reconnect policy.
#[derive(Debug, Clone)]
pub struct ConnectSettings {
    pub max_reconnects: usize,
    pub reconnect_wait: Duration,
    pub connect_timeout: Duration,
}

impl Default for ConnectSettings {
    fn default() -> Self {
        Self {
            max_reconnects: 10,
            reconnect_wait: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Outbox relay tuning.
#[derive(Debug, Clone)]
pub struct OutboxSettings {
    /// Rows claimed per relay pass.
    pub batch_size: u32,
    pub poll_interval: Duration,
    /// Attempts before a row goes to `failed` and stays there.
    pub max_attempts: u32,
    /// Per-attempt delay schedule; the last entry caps further attempts.
    pub backoff: Vec<Duration>,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_secs(1),
            max_attempts: 10,
            backoff: default_backoff(),
        }
    }
}

fn default_backoff() -> Vec<Duration> {
    vec![
        Duration::from_secs(1),
        Duration::from_secs(5),
        Duration::from_secs(15),
        Duration::from_secs(30),
        Duration::from_secs(60),
    ]
}

#[derive(Debug, Clone)]
pub struct Config {
    pub nats_urls: Vec<String>,
    pub env: String,
    pub app_name: String,

    /// Worker pool size; also the consumer's `max_ack_pending`.
    pub concurrency: usize,
    /// Broker-side redelivery cap.
    pub max_deliver: i64,
    pub ack_wait: Duration,
    /// Redelivery delay schedule declared on the durable consumer.
    pub backoff: Vec<Duration>,

    pub use_dlq: bool,
    pub dlq_stream_suffix: String,
    /// Attempts at publishing a DLQ record before degrading to a nak.
    pub dlq_max_attempts: u32,
    /// Override for the DLQ subject; defaults to `{env}.{app}.dlq`.
    pub dlq_subject: Option<String>,

    pub use_outbox: bool,
    pub use_inbox: bool,
    pub outbox: OutboxSettings,
    /// Processed inbox rows older than this are swept.
    pub inbox_retention: Duration,

    pub drain_timeout: Duration,
    /// Reject envelopes carrying unknown top-level fields.
    pub strict_envelope: bool,
    pub on_max_deliver: MaxDeliverPolicy,
    pub on_malformed: MalformedPolicy,

    /// Broker publish-dedup window keyed by message-id.
    pub duplicate_window: Duration,
    /// Primary stream retention age.
    pub max_age: Duration,
    pub replicas: usize,
    /// Override for the primary stream name; defaults to `{app}-{env}`.
    pub stream_name: Option<String>,

    pub connect: ConnectSettings,
}

impl Config {
    pub fn new(env: impl Into<String>, app_name: impl Into<String>) -> Self {
        Self {
            nats_urls: vec!["nats://127.0.0.1:4222".into()],
            env: env.into(),
            app_name: app_name.into(),
            concurrency: 5,
            max_deliver: 5,
            ack_wait: Duration::from_secs(30),
            backoff: default_backoff(),
            use_dlq: true,
            dlq_stream_suffix: "-dlq".into(),
            dlq_max_attempts: 3,
            dlq_subject: None,
            use_outbox: false,
            use_inbox: false,
            outbox: OutboxSettings::default(),
            inbox_retention: Duration::from_secs(30 * 24 * 3600),
            drain_timeout: Duration::from_secs(30),
            strict_envelope: false,
            on_max_deliver: MaxDeliverPolicy::default(),
            on_malformed: MalformedPolicy::default(),
            duplicate_window: Duration::from_secs(120),
            max_age: Duration::from_secs(7 * 24 * 3600),
            replicas: 1,
            stream_name: None,
            connect: ConnectSettings::default(),
        }
    }

    /// Loads identity and tuning from `COURIER_*` environment variables,
    /// falling back to the defaults above.
    pub fn from_env() -> Result<Self, Error> {
        let env = std::env::var("COURIER_ENV").unwrap_or_else(|_| "dev".into());
        let app = std::env::var("COURIER_APP").unwrap_or_else(|_| "app".into());
        let mut cfg = Config::new(env, app);

        if let Ok(urls) = std::env::var("COURIER_NATS_URLS") {
            let urls: Vec<String> = urls
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
            if !urls.is_empty() {
                cfg.nats_urls = urls;
            }
        }
        if let Ok(raw) = std::env::var("COURIER_CONCURRENCY") {
            cfg.concurrency = raw
                .parse()
                .map_err(|_| Error::configuration(format!("COURIER_CONCURRENCY {raw:?}")))?;
        }
        if let Ok(raw) = std::env::var("COURIER_MAX_DELIVER") {
            cfg.max_deliver = raw
                .parse()
                .map_err(|_| Error::configuration(format!("COURIER_MAX_DELIVER {raw:?}")))?;
        }
        if let Ok(raw) = std::env::var("COURIER_ACK_WAIT") {
            cfg.ack_wait = duration::parse(&raw)?;
        }
        if let Ok(raw) = std::env::var("COURIER_BACKOFF") {
            cfg.backoff = duration::parse_schedule(&raw)?;
        }
        if let Ok(raw) = std::env::var("COURIER_USE_DLQ") {
            cfg.use_dlq = raw.eq_ignore_ascii_case("true") || raw == "1";
        }
        if let Ok(raw) = std::env::var("COURIER_USE_OUTBOX") {
            cfg.use_outbox = raw.eq_ignore_ascii_case("true") || raw == "1";
        }
        if let Ok(raw) = std::env::var("COURIER_USE_INBOX") {
            cfg.use_inbox = raw.eq_ignore_ascii_case("true") || raw == "1";
        }
        if let Ok(raw) = std::env::var("COURIER_DRAIN_TIMEOUT") {
            cfg.drain_timeout = duration::parse(&raw)?;
        }
        if let Ok(raw) = std::env::var("COURIER_STREAM_NAME") {
            if !raw.trim().is_empty() {
                cfg.stream_name = Some(raw);
            }
        }
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.nats_urls.is_empty() {
            return Err(Error::configuration("at least one NATS URL is required"));
        }
        // Identity tokens must survive as single subject tokens.
        subject::build(&self.env, &self.app_name, "probe")?;
        if self.concurrency == 0 {
            return Err(Error::configuration("concurrency must be >= 1"));
        }
        if self.max_deliver < 1 {
            return Err(Error::configuration("max_deliver must be >= 1"));
        }
        if self.dlq_max_attempts == 0 {
            return Err(Error::configuration("dlq_max_attempts must be >= 1"));
        }
        if self.outbox.batch_size == 0 {
            return Err(Error::configuration("outbox batch_size must be >= 1"));
        }
        if self.outbox.backoff.is_empty() || self.backoff.is_empty() {
            return Err(Error::configuration("backoff schedules must not be empty"));
        }
        if self.replicas == 0 || self.replicas > 5 {
            return Err(Error::configuration("replicas must be within 1..=5"));
        }
        Ok(())
    }

    /// Primary stream name, `{app}-{env}` unless overridden.
    pub fn stream_name(&self) -> String {
        self.stream_name
            .clone()
            .unwrap_or_else(|| format!("{}-{}", self.app_name, self.env))
    }

    pub fn dlq_stream_name(&self) -> String {
        format!("{}{}", self.stream_name(), self.dlq_stream_suffix)
    }

    /// Wire subject DLQ records are published to.
    pub fn dlq_subject(&self) -> String {
        self.dlq_subject
            .clone()
            .unwrap_or_else(|| subject::dlq_subject(&self.env, &self.app_name))
    }

    /// Capture filter of the primary stream.
    pub fn events_filter(&self) -> String {
        subject::events_filter(&self.env, &self.app_name)
    }
}
