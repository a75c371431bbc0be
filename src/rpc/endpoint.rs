//! RPC endpoint definitions and health bookkeeping

use crate::config::RpcEndpointConfig;
use crate::error::{Result, SentinelError};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Consecutive failures after which an endpoint is considered unhealthy
pub const UNHEALTHY_AFTER: u32 = 3;

#[derive(Debug, Clone)]
pub struct RpcEndpoint {
    pub url: String,
    /// Lower is preferred
    pub priority: u32,
    pub weight: Option<u32>,
    /// Attempts of a single call allowed on this endpoint
    pub max_retries: Option<u32>,
}

impl RpcEndpoint {
    pub fn new(url: impl Into<String>, priority: u32) -> Result<Self> {
        let url = url.into();
        let parsed = url::Url::parse(&url)
            .map_err(|e| SentinelError::Validation(format!("invalid RPC url {}: {}", url, e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SentinelError::Validation(format!(
                "unsupported RPC url scheme: {}",
                url
            )));
        }

        Ok(Self {
            url,
            priority,
            weight: None,
            max_retries: None,
        })
    }

    pub fn from_config(config: &RpcEndpointConfig) -> Result<Self> {
        let mut endpoint = Self::new(config.url.clone(), config.priority)?;
        endpoint.weight = config.weight;
        endpoint.max_retries = config.max_retries;
        Ok(endpoint)
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = Some(max);
        self
    }
}

#[derive(Debug, Clone)]
pub struct EndpointHealth {
    pub healthy: bool,
    pub latency_ms: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_check: Option<DateTime<Utc>>,
}

impl Default for EndpointHealth {
    fn default() -> Self {
        Self {
            healthy: true,
            latency_ms: 0,
            consecutive_failures: 0,
            success_rate: 1.0,
            total_requests: 0,
            failed_requests: 0,
            last_check: None,
        }
    }
}

impl EndpointHealth {
    /// A call succeeded. Only a probe brings an unhealthy endpoint back.
    pub fn record_success(&mut self, latency_ms: u64) {
        self.total_requests += 1;
        self.consecutive_failures = 0;
        self.latency_ms = latency_ms;
        self.update_success_rate();
    }

    pub fn record_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        if self.consecutive_failures >= UNHEALTHY_AFTER {
            self.healthy = false;
        }
        self.update_success_rate();
    }

    pub fn record_probe_success(&mut self, latency_ms: u64) {
        self.record_success(latency_ms);
        self.healthy = true;
        self.last_check = Some(Utc::now());
    }

    pub fn record_probe_failure(&mut self) {
        self.total_requests += 1;
        self.failed_requests += 1;
        self.consecutive_failures += 1;
        self.healthy = self.consecutive_failures < UNHEALTHY_AFTER;
        self.last_check = Some(Utc::now());
        self.update_success_rate();
    }

    fn update_success_rate(&mut self) {
        if self.total_requests > 0 {
            self.success_rate =
                (self.total_requests - self.failed_requests) as f64 / self.total_requests as f64;
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct EndpointState {
    pub endpoint: RpcEndpoint,
    pub health: EndpointHealth,
}

/// Per-endpoint health view
#[derive(Debug, Clone, Serialize)]
pub struct EndpointHealthSnapshot {
    pub url: String,
    pub priority: u32,
    pub healthy: bool,
    pub latency_ms: u64,
    pub consecutive_failures: u32,
    pub success_rate: f64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub last_check: Option<DateTime<Utc>>,
}

impl From<&EndpointState> for EndpointHealthSnapshot {
    fn from(state: &EndpointState) -> Self {
        Self {
            url: state.endpoint.url.clone(),
            priority: state.endpoint.priority,
            healthy: state.health.healthy,
            latency_ms: state.health.latency_ms,
            consecutive_failures: state.health.consecutive_failures,
            success_rate: state.health.success_rate,
            total_requests: state.health.total_requests,
            failed_requests: state.health.failed_requests,
            last_check: state.health.last_check,
        }
    }
}
