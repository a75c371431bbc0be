//! Named circuit breaker
//!
//! Stops calling a failing dependency for a cooldown period, then lets a
//! bounded number of trial calls through to probe recovery.
//!
//! A failure while half-open reopens the breaker with `failures` pinned to the
//! threshold, so the next cooldown starts from the reopening failure and no
//! re-accumulation is needed.

use crate::error::{Result, SentinelError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::future::Future;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    /// Normal operation - all calls allowed
    Closed,
    /// Failure threshold exceeded - calls fail fast
    Open,
    /// Cooldown elapsed - limited trial calls allowed
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Configuration for a circuit breaker
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    /// Consecutive failures that trip the breaker
    pub failure_threshold: u32,
    /// Time the breaker stays open after the last failure
    pub reset_timeout: Duration,
    /// Consecutive half-open successes required to close
    pub half_open_requests: u32,
}

impl CircuitBreakerConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 1,
        }
    }
}

/// How a call was let through, needed to settle its outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Trial,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failures: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    half_open_successes: u32,
    half_open_in_flight: u32,
    /// Bumped on every entry into half-open; trial slots are tied to it
    trial_epoch: u64,
    total_trips: u64,
}

/// Snapshot for the operator dashboard
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub failure_threshold: u32,
    pub reset_timeout_ms: u64,
    pub half_open_successes: u32,
    pub half_open_in_flight: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub total_trips: u64,
}

/// Admission to make one call through the breaker.
///
/// Settle it with [`success`](Self::success) or [`failure`](Self::failure).
/// A trial permit dropped unsettled (the call was cancelled or timed out)
/// hands its half-open slot back so another trial can run.
#[must_use = "an unsettled permit records no outcome"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    admission: Admission,
    epoch: u64,
    settled: bool,
}

impl CallPermit<'_> {
    pub fn admission(&self) -> Admission {
        self.admission
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.admission, self.epoch);
    }

    pub fn failure(mut self, reason: &str) {
        self.settled = true;
        self.breaker.on_failure(self.admission, self.epoch, reason);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.admission == Admission::Trial {
            self.breaker.release_trial(self.epoch);
        }
    }
}

pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    // Never held across an await, so a dropped permit can release synchronously
    inner: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failures: 0,
                last_failure: None,
                last_failure_at: None,
                half_open_successes: 0,
                half_open_in_flight: 0,
                trial_epoch: 0,
                total_trips: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub async fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Ask to make a call. Moves `open -> half-open` once the cooldown elapsed.
    pub fn try_acquire(&self) -> Result<CallPermit<'_>> {
        let mut inner = self.lock();

        if inner.state == CircuitState::Open {
            let elapsed = inner
                .last_failure
                .map(|t| t.elapsed())
                .unwrap_or(self.config.reset_timeout);
            if elapsed < self.config.reset_timeout {
                let retry_in = self.config.reset_timeout - elapsed;
                return Err(SentinelError::CircuitOpen {
                    name: self.config.name.clone(),
                    retry_in_ms: retry_in.as_millis() as u64,
                });
            }
            inner.state = CircuitState::HalfOpen;
            inner.half_open_successes = 0;
            inner.half_open_in_flight = 0;
            inner.trial_epoch += 1;
            info!("Circuit breaker {} transitioning to HALF-OPEN", self.config.name);
        }

        let admission = if inner.state == CircuitState::Closed {
            Admission::Normal
        } else {
            if inner.half_open_in_flight + inner.half_open_successes
                >= self.config.half_open_requests
            {
                return Err(SentinelError::CircuitOpen {
                    name: self.config.name.clone(),
                    retry_in_ms: 0,
                });
            }
            inner.half_open_in_flight += 1;
            Admission::Trial
        };

        Ok(CallPermit {
            breaker: self,
            admission,
            epoch: inner.trial_epoch,
            settled: false,
        })
    }

    fn on_success(&self, admission: Admission, epoch: u64) {
        let mut inner = self.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen
                if admission == Admission::Trial && epoch == inner.trial_epoch =>
            {
                inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.config.half_open_requests {
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.half_open_successes = 0;
                    inner.half_open_in_flight = 0;
                    info!(
                        "Circuit breaker {} CLOSED - normal operation resumed",
                        self.config.name
                    );
                }
            }
            // Late result from a call admitted under an earlier state
            _ => {}
        }
    }

    fn on_failure(&self, admission: Admission, epoch: u64, reason: &str) {
        let mut inner = self.lock();
        let now = Instant::now();
        inner.last_failure = Some(now);
        inner.last_failure_at = Some(Utc::now());

        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                debug!(
                    "Circuit breaker {} failure #{}: {}",
                    self.config.name, inner.failures, reason
                );
                if inner.failures >= self.config.failure_threshold {
                    inner.state = CircuitState::Open;
                    inner.total_trips += 1;
                    warn!(
                        "Circuit breaker {} TRIPPED after {} failures: {}",
                        self.config.name, inner.failures, reason
                    );
                }
            }
            CircuitState::HalfOpen => {
                if admission == Admission::Trial && epoch == inner.trial_epoch {
                    inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
                }
                inner.state = CircuitState::Open;
                inner.failures = self.config.failure_threshold;
                inner.half_open_successes = 0;
                inner.half_open_in_flight = 0;
                inner.total_trips += 1;
                warn!(
                    "Circuit breaker {} REOPENED from half-open: {}",
                    self.config.name, reason
                );
            }
            CircuitState::Open => {
                inner.failures = inner.failures.saturating_add(1);
            }
        }
    }

    fn release_trial(&self, epoch: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && epoch == inner.trial_epoch {
            inner.half_open_in_flight = inner.half_open_in_flight.saturating_sub(1);
            debug!("Circuit breaker {} trial abandoned, slot released", self.config.name);
        }
    }

    /// Run `op` through the breaker, failing fast while open
    pub async fn call<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire()?;
        match op().await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(e) => {
                permit.failure(&e.to_string());
                Err(e)
            }
        }
    }

    /// Manually open the breaker
    pub async fn trip(&self, reason: &str) {
        let mut inner = self.lock();
        if inner.state != CircuitState::Open {
            inner.state = CircuitState::Open;
            inner.failures = self.config.failure_threshold;
            inner.last_failure = Some(Instant::now());
            inner.last_failure_at = Some(Utc::now());
            inner.half_open_successes = 0;
            inner.half_open_in_flight = 0;
            inner.total_trips += 1;
            warn!("Circuit breaker {} manually tripped: {}", self.config.name, reason);
        }
    }

    /// Force close the circuit (manual reset)
    pub async fn force_close(&self) {
        let mut inner = self.lock();
        inner.state = CircuitState::Closed;
        inner.failures = 0;
        inner.half_open_successes = 0;
        inner.half_open_in_flight = 0;
        warn!("Circuit breaker {} force-closed", self.config.name);
    }

    pub async fn snapshot(&self) -> CircuitBreakerSnapshot {
        let inner = self.lock();
        CircuitBreakerSnapshot {
            name: self.config.name.clone(),
            state: inner.state,
            failures: inner.failures,
            failure_threshold: self.config.failure_threshold,
            reset_timeout_ms: self.config.reset_timeout.as_millis() as u64,
            half_open_successes: inner.half_open_successes,
            half_open_in_flight: inner.half_open_in_flight,
            last_failure: inner.last_failure_at,
            total_trips: inner.total_trips,
        }
    }
}
