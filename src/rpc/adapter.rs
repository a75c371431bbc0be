//! Resilient JSON-RPC adapter
//!
//! Fans calls out over a priority-ordered endpoint list with per-attempt
//! timeouts, failover, jittered backoff, an optional TTL cache and in-flight
//! de-duplication. A background loop probes every endpoint so that endpoints
//! marked unhealthy by call failures can come back.

use super::cache::{cache_key, ResponseCache};
use super::endpoint::{EndpointHealthSnapshot, EndpointState, RpcEndpoint};
use super::transport::{parse_hex_u128, parse_hex_u64, RpcTransport};
use crate::config::RpcConfig;
use crate::coordination::PeriodicTask;
use crate::error::{Result, RpcError};
use crate::supervisor::ManagedService;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use rand::Rng;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type InFlight = Shared<BoxFuture<'static, std::result::Result<Value, RpcError>>>;

/// Per-call options
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub cache: bool,
    /// Falls back to the adapter default TTL
    pub cache_ttl: Option<Duration>,
    pub dedupe: bool,
}

impl CallOptions {
    pub fn cached() -> Self {
        Self {
            cache: true,
            ..Default::default()
        }
    }

    pub fn cache_for(ttl: Duration) -> Self {
        Self {
            cache: true,
            cache_ttl: Some(ttl),
            dedupe: false,
        }
    }

    pub fn deduped(mut self) -> Self {
        self.dedupe = true;
        self
    }
}

#[derive(Debug, Clone)]
pub struct RpcAdapterSettings {
    pub max_retries: u32,
    pub timeout: Duration,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub health_check_interval: Duration,
    pub health_check_timeout: Duration,
    pub default_cache_ttl: Duration,
}

impl Default for RpcAdapterSettings {
    fn default() -> Self {
        Self::from(&RpcConfig::default())
    }
}

impl From<&RpcConfig> for RpcAdapterSettings {
    fn from(config: &RpcConfig) -> Self {
        Self {
            max_retries: config.max_retries.max(1),
            timeout: Duration::from_millis(config.timeout_ms),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            health_check_interval: Duration::from_secs(config.health_check_interval_secs),
            health_check_timeout: Duration::from_millis(config.health_check_timeout_ms),
            default_cache_ttl: Duration::from_millis(config.default_cache_ttl_ms),
        }
    }
}

impl RpcAdapterSettings {
    /// `min(base * 2^attempt + jitter, max)` with jitter up to 30% of the delay
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let delay = base_ms.saturating_mul(2u64.saturating_pow(attempt));
        let jitter_max = delay.saturating_mul(3) / 10;
        let jitter = if jitter_max > 0 {
            rand::thread_rng().gen_range(0..=jitter_max)
        } else {
            0
        };
        Duration::from_millis(delay.saturating_add(jitter)).min(self.max_delay)
    }
}

struct AdapterInner {
    settings: RpcAdapterSettings,
    endpoints: RwLock<Vec<EndpointState>>,
    cursor: AtomicUsize,
    cache: ResponseCache,
    in_flight: DashMap<String, InFlight>,
    transport: Arc<dyn RpcTransport>,
    health_task: Mutex<Option<PeriodicTask>>,
}

#[derive(Clone)]
pub struct ResilientRpcAdapter {
    inner: Arc<AdapterInner>,
}

impl ResilientRpcAdapter {
    pub fn new(
        settings: RpcAdapterSettings,
        endpoints: Vec<RpcEndpoint>,
        transport: Arc<dyn RpcTransport>,
    ) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|endpoint| EndpointState {
                endpoint,
                health: Default::default(),
            })
            .collect();

        Self {
            inner: Arc::new(AdapterInner {
                settings,
                endpoints: RwLock::new(endpoints),
                cursor: AtomicUsize::new(0),
                cache: ResponseCache::new(),
                in_flight: DashMap::new(),
                transport,
                health_task: Mutex::new(None),
            }),
        }
    }

    pub fn from_config(config: &RpcConfig, transport: Arc<dyn RpcTransport>) -> Result<Self> {
        let endpoints = config
            .endpoints
            .iter()
            .map(RpcEndpoint::from_config)
            .collect::<Result<Vec<_>>>()?;
        Ok(Self::new(RpcAdapterSettings::from(config), endpoints, transport))
    }

    pub fn settings(&self) -> &RpcAdapterSettings {
        &self.inner.settings
    }

    /// Issue a JSON-RPC call with failover and retries
    pub async fn call(&self, method: &str, params: Value, options: CallOptions) -> Result<Value> {
        let key = cache_key(method, &params);

        if options.cache {
            if let Some(hit) = self.inner.cache.get_fresh(&key) {
                debug!("RPC cache hit for {}", method);
                return Ok(hit);
            }
        }

        let outcome = if options.dedupe {
            self.execute_deduped(&key, method, params).await
        } else {
            self.inner.execute(method, &params).await
        };

        match outcome {
            Ok(value) => {
                if options.cache {
                    let ttl = options
                        .cache_ttl
                        .unwrap_or(self.inner.settings.default_cache_ttl);
                    self.inner.cache.insert(key, value.clone(), ttl);
                }
                Ok(value)
            }
            Err(e) => match self.inner.cache.get_stale(&key) {
                Some((stale, age)) => {
                    warn!(
                        "RPC {} failed ({}), serving stale cached response ({}ms old)",
                        method,
                        e,
                        age.as_millis()
                    );
                    Ok(stale)
                }
                None => Err(e.into()),
            },
        }
    }

    async fn execute_deduped(
        &self,
        key: &str,
        method: &str,
        params: Value,
    ) -> std::result::Result<Value, RpcError> {
        let shared = match self.inner.in_flight.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => {
                debug!("Joining in-flight RPC {}", method);
                existing.get().clone()
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let inner = self.inner.clone();
                let method = method.to_string();
                let key = key.to_string();
                let fut = async move {
                    let result = inner.execute(&method, &params).await;
                    inner.in_flight.remove(&key);
                    result
                }
                .boxed()
                .shared();
                slot.insert(fut.clone());
                fut
            }
        };
        shared.await
    }

    /// Send `method` exactly once to the best endpoint: no retry, failover,
    /// cache or de-duplication. For calls that move value, where a late
    /// answer must not turn into a second submission.
    pub async fn send_once(&self, method: &str, params: Value) -> Result<Value> {
        let (idx, url) = {
            let endpoints = self.inner.endpoints.read().await;
            let idx = best_index(&endpoints).ok_or(RpcError::NoEndpoints)?;
            (idx, endpoints[idx].endpoint.url.clone())
        };
        Ok(self.inner.attempt(idx, &url, method, &params).await?)
    }

    /// URL of the endpoint the next call would start on
    pub async fn get_best_endpoint(&self) -> Option<String> {
        let endpoints = self.inner.endpoints.read().await;
        best_index(&endpoints).map(|idx| endpoints[idx].endpoint.url.clone())
    }

    pub async fn get_health_status(&self) -> Vec<EndpointHealthSnapshot> {
        self.inner
            .endpoints
            .read()
            .await
            .iter()
            .map(EndpointHealthSnapshot::from)
            .collect()
    }

    pub async fn has_healthy_endpoint(&self) -> bool {
        self.inner
            .endpoints
            .read()
            .await
            .iter()
            .any(|e| e.health.healthy)
    }

    /// Probe every endpoint once with `eth_blockNumber`
    pub async fn check_health(&self) {
        self.inner.probe_all().await;
    }

    pub async fn get_block_number(&self) -> Result<u64> {
        let value = self
            .call("eth_blockNumber", json!([]), CallOptions::default().deduped())
            .await?;
        Ok(parse_hex_u64(&value)?)
    }

    /// Balance in wei at the latest block
    pub async fn get_balance(&self, address: &str) -> Result<u128> {
        let value = self
            .call(
                "eth_getBalance",
                json!([address, "latest"]),
                CallOptions::default().deduped(),
            )
            .await?;
        Ok(parse_hex_u128(&value)?)
    }

    /// `eth_call` against `to` with ABI-encoded `data`, returns the hex result
    pub async fn call_contract(&self, to: &str, data: &str) -> Result<String> {
        let value = self
            .call(
                "eth_call",
                json!([{ "to": to, "data": data }, "latest"]),
                CallOptions::default().deduped(),
            )
            .await?;
        value
            .as_str()
            .map(String::from)
            .ok_or_else(|| RpcError::InvalidResponse(format!("eth_call returned {}", value)).into())
    }

    pub async fn start_health_checks(&self) {
        let mut slot = self.inner.health_task.lock().await;
        if slot.is_some() {
            return;
        }
        let weak: Weak<AdapterInner> = Arc::downgrade(&self.inner);
        *slot = Some(PeriodicTask::spawn(
            "rpc-health",
            self.inner.settings.health_check_interval,
            false,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.probe_all().await;
                    }
                }
                .boxed()
            },
        ));
        info!(
            "RPC health checks every {}s",
            self.inner.settings.health_check_interval.as_secs()
        );
    }

    pub async fn stop_health_checks(&self) {
        if let Some(task) = self.inner.health_task.lock().await.take() {
            task.shutdown().await;
        }
    }
}

/// Healthy endpoints by (priority, latency), else the first configured one
fn best_index(endpoints: &[EndpointState]) -> Option<usize> {
    if endpoints.is_empty() {
        return None;
    }
    endpoints
        .iter()
        .enumerate()
        .filter(|(_, e)| e.health.healthy)
        .min_by_key(|(_, e)| (e.endpoint.priority, e.health.latency_ms))
        .map(|(idx, _)| idx)
        .or(Some(0))
}

impl AdapterInner {
    /// Next healthy endpoint after `current`, wrapping around
    fn rotate_endpoint(&self, endpoints: &[EndpointState], current: usize) -> usize {
        let n = endpoints.len();
        let next = (1..=n)
            .map(|step| (current + step) % n)
            .find(|&idx| endpoints[idx].health.healthy)
            .unwrap_or((current + 1) % n);
        self.cursor.store(next, Ordering::Relaxed);
        next
    }

    async fn pick_endpoint(
        &self,
        previous: Option<usize>,
        attempts_on: &HashMap<usize, u32>,
    ) -> Option<(usize, String)> {
        let endpoints = self.endpoints.read().await;
        let n = endpoints.len();
        let mut idx = match previous {
            None => best_index(&endpoints)?,
            Some(prev) => self.rotate_endpoint(&endpoints, prev),
        };

        // skip endpoints that used up their own per-call attempt budget
        for _ in 0..n {
            let used = attempts_on.get(&idx).copied().unwrap_or(0);
            match endpoints[idx].endpoint.max_retries {
                Some(max) if used >= max => idx = self.rotate_endpoint(&endpoints, idx),
                _ => return Some((idx, endpoints[idx].endpoint.url.clone())),
            }
        }
        None
    }

    /// One timeout-bounded send to endpoint `idx`, recorded against its health
    async fn attempt(
        &self,
        idx: usize,
        url: &str,
        method: &str,
        params: &Value,
    ) -> std::result::Result<Value, RpcError> {
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.settings.timeout,
            self.transport.send(url, method, params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(RpcError::Timeout {
                url: url.to_string(),
                timeout_ms: self.settings.timeout.as_millis() as u64,
            }),
        };

        let mut endpoints = self.endpoints.write().await;
        if let Some(state) = endpoints.get_mut(idx) {
            match &result {
                Ok(_) => state
                    .health
                    .record_success(started.elapsed().as_millis() as u64),
                Err(_) => {
                    let was_healthy = state.health.healthy;
                    state.health.record_failure();
                    if was_healthy && !state.health.healthy {
                        warn!(
                            "RPC endpoint {} marked unhealthy after {} consecutive failures",
                            url, state.health.consecutive_failures
                        );
                    }
                }
            }
        }
        result
    }

    async fn execute(&self, method: &str, params: &Value) -> std::result::Result<Value, RpcError> {
        if self.endpoints.read().await.is_empty() {
            return Err(RpcError::NoEndpoints);
        }

        let max_attempts = self.settings.max_retries.max(1);
        let mut attempts_on: HashMap<usize, u32> = HashMap::new();
        let mut previous = None;
        let mut last_error: Option<RpcError> = None;
        let mut made = 0;

        for attempt in 0..max_attempts {
            let Some((idx, url)) = self.pick_endpoint(previous, &attempts_on).await else {
                break;
            };
            *attempts_on.entry(idx).or_default() += 1;
            previous = Some(idx);
            made += 1;

            match self.attempt(idx, &url, method, params).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    debug!(
                        "RPC {} attempt {}/{} on {} failed: {}",
                        method,
                        attempt + 1,
                        max_attempts,
                        url,
                        e
                    );
                    last_error = Some(e);

                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.settings.backoff(attempt)).await;
                    }
                }
            }
        }

        Err(RpcError::Exhausted {
            attempts: made,
            last: last_error
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no endpoint available".to_string()),
        })
    }

    async fn probe_all(&self) {
        let urls: Vec<String> = self
            .endpoints
            .read()
            .await
            .iter()
            .map(|e| e.endpoint.url.clone())
            .collect();

        let probes = urls.iter().map(|url| async move {
            let started = Instant::now();
            let ok = matches!(
                tokio::time::timeout(
                    self.settings.health_check_timeout,
                    self.transport.send(url, "eth_blockNumber", &json!([])),
                )
                .await,
                Ok(Ok(_))
            );
            (ok, started.elapsed().as_millis() as u64)
        });
        let results = futures::future::join_all(probes).await;

        let mut endpoints = self.endpoints.write().await;
        for (state, (ok, latency)) in endpoints.iter_mut().zip(results) {
            let was_healthy = state.health.healthy;
            if ok {
                state.health.record_probe_success(latency);
            } else {
                state.health.record_probe_failure();
            }
            if was_healthy != state.health.healthy {
                info!(
                    "RPC endpoint {} is now {}",
                    state.endpoint.url,
                    if state.health.healthy { "healthy" } else { "unhealthy" }
                );
            }
        }
    }
}

#[async_trait]
impl ManagedService for ResilientRpcAdapter {
    async fn start(&self) -> Result<()> {
        self.check_health().await;
        self.start_health_checks().await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_health_checks().await;
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(self.has_healthy_endpoint().await)
    }
}
