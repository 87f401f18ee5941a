//! Error taxonomy shared across the runtime.
//!
//! Everything that crosses a component boundary is an [`Error`]; inside the
//! message processor errors collapse into an [`ErrorAction`] and nothing
//! propagates further.

use std::time::Duration;

/// Classification used by the default error policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Undecodable envelope or schema violation. Never retried.
    Malformed,
    /// Will not succeed on retry (permission denied, not found, validation).
    Unrecoverable,
    /// Worth retrying (connection, timeout, conflict, open breaker).
    Transient,
    /// Anything else, typically a plain handler failure.
    Unknown,
}

/// What the processor does with a failed delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Nak; the broker redelivers per the backoff schedule.
    Retry,
    /// Ack and drop.
    Discard,
    /// Publish a dead-letter record, then ack.
    Dlq,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Configuration(String),

    #[error("broker connection: {0}")]
    Connection(String),

    #[error("stream topology: {0}")]
    Topology(String),

    #[error("publish rejected: {0}")]
    Publish(String),

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("consumer setup failed: {0}")]
    Subscription(String),

    #[error("handler failed: {0}")]
    Handler(#[source] anyhow::Error),

    #[error("dead-letter publish failed: {0}")]
    Dlq(String),

    #[error("circuit breaker open for {0}")]
    CircuitOpen(String),

    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
}

impl Error {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Error::Connection(msg.into())
    }

    pub fn topology(msg: impl Into<String>) -> Self {
        Error::Topology(msg.into())
    }

    pub fn publish(msg: impl Into<String>) -> Self {
        Error::Publish(msg.into())
    }

    pub fn malformed(msg: impl Into<String>) -> Self {
        Error::Malformed(msg.into())
    }

    pub fn subscription(msg: impl Into<String>) -> Self {
        Error::Subscription(msg.into())
    }

    pub fn dlq(msg: impl Into<String>) -> Self {
        Error::Dlq(msg.into())
    }

    /// Marks a handler failure as not worth retrying.
    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Error::Unrecoverable(msg.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Malformed(_) => ErrorKind::Malformed,
            Error::Unrecoverable(_) | Error::Configuration(_) | Error::Topology(_) => {
                ErrorKind::Unrecoverable
            }
            Error::Connection(_)
            | Error::Publish(_)
            | Error::CircuitOpen(_)
            | Error::Timeout(_, _)
            | Error::Dlq(_) => ErrorKind::Transient,
            Error::Handler(_) | Error::Subscription(_) => ErrorKind::Unknown,
        }
    }
}

/// Classifies an arbitrary handler failure.
///
/// Courier errors carry their own kind; anything else is [`ErrorKind::Unknown`]
/// and falls into the retry-then-DLQ default.
pub fn classify(err: &anyhow::Error) -> ErrorKind {
    match err.downcast_ref::<Error>() {
        Some(e) => e.kind(),
        None => ErrorKind::Unknown,
    }
}

/// The default error policy table.
///
/// `attempt` is the broker's delivery count for this message; `max_attempts`
/// the consumer's `max_deliver`.
pub fn default_action(kind: ErrorKind, attempt: i64, max_attempts: i64) -> ErrorAction {
    match kind {
        ErrorKind::Malformed => ErrorAction::Discard,
        ErrorKind::Unrecoverable => ErrorAction::Dlq,
        ErrorKind::Transient => ErrorAction::Retry,
        ErrorKind::Unknown => {
            if attempt < max_attempts {
                ErrorAction::Retry
            } else {
                ErrorAction::Dlq
            }
        }
    }
}
