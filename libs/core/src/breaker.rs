//! Circuit breaker guarding external dependencies called from handlers.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use metrics::counter;
use tracing::{info, warn};

use crate::error::Error;

#[derive(Debug, Clone)]
pub struct BreakerSettings {
    /// Consecutive failures that trip the breaker open.
    pub failure_threshold: u32,
    /// How long to stay open before letting probes through.
    pub reset_timeout: Duration,
    /// Concurrent probe calls admitted while half-open.
    pub half_open_max_calls: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_max_calls: 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct Inner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probes_in_flight: u32,
}

/// CLOSED -> OPEN on repeated failure, OPEN -> HALF_OPEN after the reset
/// timeout, HALF_OPEN -> CLOSED on a successful probe and back to OPEN on a
/// failed one.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            inner: Mutex::new(Inner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probes_in_flight: 0,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Admission check before the protected call.
    ///
    /// Open state short-circuits with [`Error::CircuitOpen`], which the error
    /// policy classifies as transient (the delivery is nak'd and retried).
    pub fn try_enter(&self) -> Result<(), Error> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => Ok(()),
            BreakerState::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.settings.reset_timeout {
                    info!(breaker = %self.name, "circuit half-open, admitting probe");
                    inner.state = BreakerState::HalfOpen;
                    inner.probes_in_flight = 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
            BreakerState::HalfOpen => {
                if inner.probes_in_flight < self.settings.half_open_max_calls {
                    inner.probes_in_flight += 1;
                    Ok(())
                } else {
                    Err(Error::CircuitOpen(self.name.clone()))
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            info!(breaker = %self.name, "circuit closed after successful probe");
            inner.state = BreakerState::Closed;
            inner.probes_in_flight = 0;
            inner.opened_at = None;
        }
    }

    pub fn on_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, circuit re-opened");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.probes_in_flight = 0;
                counter!("courier_breaker_opened_total", "breaker" => self.name.clone())
                    .increment(1);
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.settings.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, circuit opened"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                    counter!("courier_breaker_opened_total", "breaker" => self.name.clone())
                        .increment(1);
                }
            }
            BreakerState::Open => {}
        }
    }
}
