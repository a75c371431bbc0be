//! Managed service contract and per-service bookkeeping types

use crate::config::SupervisorConfig;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;

/// A long-running component the supervisor can start, stop and probe.
#[async_trait]
pub trait ManagedService: Send + Sync {
    async fn start(&self) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// `Ok(false)` and `Err(_)` both count as a failed check.
    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }
}

/// Lifecycle state of a managed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceState {
    Stopped,
    Starting,
    Running,
    /// Running but failing health checks
    Degraded,
    Failed,
}

impl ServiceState {
    /// Check if the service is up (possibly degraded)
    pub fn is_up(&self) -> bool {
        matches!(self, ServiceState::Running | ServiceState::Degraded)
    }
}

impl std::fmt::Display for ServiceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServiceState::Stopped => write!(f, "stopped"),
            ServiceState::Starting => write!(f, "starting"),
            ServiceState::Running => write!(f, "running"),
            ServiceState::Degraded => write!(f, "degraded"),
            ServiceState::Failed => write!(f, "failed"),
        }
    }
}

/// Registration options for a managed service
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Critical services start sequentially and block startup
    pub critical: bool,
    pub restart_on_failure: bool,
    pub max_restarts: u32,
    /// `None` disables health checks for the service
    pub health_check_interval: Option<Duration>,
    /// Base delay before the first restart
    pub restart_delay: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            critical: false,
            restart_on_failure: true,
            max_restarts: 5,
            health_check_interval: Some(Duration::from_secs(30)),
            restart_delay: Duration::from_secs(5),
        }
    }
}

impl ServiceOptions {
    pub fn from_config(config: &SupervisorConfig) -> Self {
        Self {
            critical: false,
            restart_on_failure: true,
            max_restarts: config.max_restarts,
            health_check_interval: Some(Duration::from_millis(config.health_check_interval_ms)),
            restart_delay: Duration::from_millis(config.restart_delay_ms),
        }
    }

    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn without_health_check(mut self) -> Self {
        self.health_check_interval = None;
        self
    }

    pub fn health_check_every(mut self, interval: Duration) -> Self {
        self.health_check_interval = Some(interval);
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn max_restarts(mut self, max: u32) -> Self {
        self.max_restarts = max;
        self
    }

    pub fn restart_on_failure(mut self, restart: bool) -> Self {
        self.restart_on_failure = restart;
        self
    }
}

/// Supervisor-wide settings
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub backoff_multiplier: u32,
    pub max_backoff: Duration,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
    pub health_check_timeout: Duration,
    /// Consecutive failed checks before a running service is marked degraded
    pub degraded_after: u32,
    /// Consecutive failed checks before a restart is scheduled
    pub restart_after: u32,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            backoff_multiplier: 2,
            max_backoff: Duration::from_secs(300),
            startup_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(10),
            degraded_after: 3,
            restart_after: 5,
        }
    }
}

impl From<&SupervisorConfig> for SupervisorSettings {
    fn from(config: &SupervisorConfig) -> Self {
        Self {
            backoff_multiplier: config.backoff_multiplier,
            max_backoff: Duration::from_millis(config.max_backoff_ms),
            startup_timeout: Duration::from_millis(config.startup_timeout_ms),
            ..Default::default()
        }
    }
}

impl SupervisorSettings {
    /// `min(base * multiplier^restart_count, max_backoff)`
    pub fn restart_delay(&self, base: Duration, restart_count: u32) -> Duration {
        let factor = (self.backoff_multiplier as u64).saturating_pow(restart_count);
        let delay_ms = (base.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay_ms).min(self.max_backoff)
    }
}

/// Per-service view for the operator dashboard
#[derive(Debug, Clone, Serialize)]
pub struct ServiceSnapshot {
    pub name: String,
    pub state: ServiceState,
    pub critical: bool,
    pub restart_count: u32,
    pub max_restarts: u32,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_health_check: Option<DateTime<Utc>>,
}

/// Event emitted by the supervisor
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    StateChanged {
        service: String,
        from: ServiceState,
        to: ServiceState,
        reason: Option<String>,
    },
    HealthCheckFailed {
        service: String,
        consecutive_failures: u32,
    },
    RestartScheduled {
        service: String,
        attempt: u32,
        delay_ms: u64,
    },
    RestartExhausted {
        service: String,
        restarts: u32,
    },
}
