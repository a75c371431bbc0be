//! Feature flags gated on service readiness
//!
//! A flag is enabled only while every declared dependency is ready and its
//! custom probe (if any) passes. Evaluation runs once on start and then on a
//! fixed interval.
//!
//! Manual `enable`/`disable` are operator overrides that last until the next
//! evaluation: if the underlying conditions have not changed, the evaluator
//! puts the flag back where the conditions say it belongs.

use crate::config::{FeatureFlagsConfig, FlagConfig};
use crate::coordination::PeriodicTask;
use crate::error::{Result, SentinelError};
use crate::services::ReadinessRegistry;
use crate::supervisor::ManagedService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Reason recorded when the evaluator turns a flag off
pub const AUTO_DISABLED_REASON: &str = "Automatically disabled due to dependency or health check failure";

pub type HealthProbe = Arc<dyn Fn() -> BoxFuture<'static, Result<bool>> + Send + Sync>;

#[derive(Clone)]
pub struct FeatureFlagDefinition {
    pub name: String,
    pub description: String,
    pub dependencies: Vec<String>,
    /// When false the custom probe is not consulted; dependencies still gate
    pub auto_disable_on_failure: bool,
    pub health_check: Option<HealthProbe>,
}

impl FeatureFlagDefinition {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            dependencies: Vec::new(),
            auto_disable_on_failure: true,
            health_check: None,
        }
    }

    pub fn depends_on<I, S>(mut self, services: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(services.into_iter().map(Into::into));
        self
    }

    pub fn auto_disable_on_failure(mut self, auto: bool) -> Self {
        self.auto_disable_on_failure = auto;
        self
    }

    pub fn with_health_check<F, Fut>(mut self, probe: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<bool>> + Send + 'static,
    {
        self.health_check = Some(Arc::new(move || probe().boxed()));
        self
    }
}

impl From<&FlagConfig> for FeatureFlagDefinition {
    fn from(config: &FlagConfig) -> Self {
        Self::new(config.name.clone(), config.description.clone())
            .depends_on(config.dependencies.iter().cloned())
            .auto_disable_on_failure(config.auto_disable_on_failure)
    }
}

impl std::fmt::Debug for FeatureFlagDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FeatureFlagDefinition")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("auto_disable_on_failure", &self.auto_disable_on_failure)
            .field("health_check", &self.health_check.is_some())
            .finish()
    }
}

/// Flag state for client-side capability gating
#[derive(Debug, Clone, Serialize)]
pub struct FeatureFlagStatus {
    pub name: String,
    pub description: String,
    pub enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled_reason: Option<String>,
    pub dependencies: Vec<String>,
    pub last_updated: DateTime<Utc>,
}

struct FlagEntry {
    definition: FeatureFlagDefinition,
    enabled: bool,
    disabled_reason: Option<String>,
    last_updated: DateTime<Utc>,
}

impl FlagEntry {
    fn status(&self) -> FeatureFlagStatus {
        FeatureFlagStatus {
            name: self.definition.name.clone(),
            description: self.definition.description.clone(),
            enabled: self.enabled,
            disabled_reason: self.disabled_reason.clone(),
            dependencies: self.definition.dependencies.clone(),
            last_updated: self.last_updated,
        }
    }
}

/// Bound on one custom health check; an elapsed check counts as unhealthy
pub const DEFAULT_HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

struct FlagsInner {
    readiness: Arc<ReadinessRegistry>,
    interval: Duration,
    health_check_timeout: Duration,
    flags: RwLock<HashMap<String, FlagEntry>>,
    task: Mutex<Option<PeriodicTask>>,
}

#[derive(Clone)]
pub struct FeatureFlagService {
    inner: Arc<FlagsInner>,
}

impl FeatureFlagService {
    pub fn new(readiness: Arc<ReadinessRegistry>, interval: Duration) -> Self {
        Self::with_health_check_timeout(readiness, interval, DEFAULT_HEALTH_CHECK_TIMEOUT)
    }

    pub fn with_health_check_timeout(
        readiness: Arc<ReadinessRegistry>,
        interval: Duration,
        health_check_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(FlagsInner {
                readiness,
                interval,
                health_check_timeout,
                flags: RwLock::new(HashMap::new()),
                task: Mutex::new(None),
            }),
        }
    }

    /// Build the service and register every flag declared in config
    pub async fn from_config(readiness: Arc<ReadinessRegistry>, config: &FeatureFlagsConfig) -> Self {
        let service = Self::with_health_check_timeout(
            readiness,
            Duration::from_secs(config.evaluation_interval_secs),
            Duration::from_millis(config.health_check_timeout_ms),
        );
        for flag in &config.flags {
            service.register(FeatureFlagDefinition::from(flag)).await;
        }
        service
    }

    /// Register (or replace) a flag. Starts enabled iff its dependencies are ready.
    pub async fn register(&self, definition: FeatureFlagDefinition) {
        let enabled = self.inner.dependencies_ready(&definition.dependencies);
        let name = definition.name.clone();
        let entry = FlagEntry {
            definition,
            enabled,
            disabled_reason: if enabled {
                None
            } else {
                Some(AUTO_DISABLED_REASON.to_string())
            },
            last_updated: Utc::now(),
        };
        self.inner.flags.write().await.insert(name.clone(), entry);
        debug!("Registered feature flag {} (enabled: {})", name, enabled);
    }

    /// Unknown flags are disabled
    pub async fn is_enabled(&self, name: &str) -> bool {
        self.inner
            .flags
            .read()
            .await
            .get(name)
            .map(|f| f.enabled)
            .unwrap_or(false)
    }

    pub async fn enable(&self, name: &str) -> Result<()> {
        let mut flags = self.inner.flags.write().await;
        let flag = flags
            .get_mut(name)
            .ok_or_else(|| SentinelError::FlagNotFound(name.to_string()))?;
        flag.enabled = true;
        flag.disabled_reason = None;
        flag.last_updated = Utc::now();
        info!("Feature flag {} manually enabled", name);
        Ok(())
    }

    pub async fn disable(&self, name: &str, reason: &str) -> Result<()> {
        let mut flags = self.inner.flags.write().await;
        let flag = flags
            .get_mut(name)
            .ok_or_else(|| SentinelError::FlagNotFound(name.to_string()))?;
        flag.enabled = false;
        flag.disabled_reason = Some(reason.to_string());
        flag.last_updated = Utc::now();
        warn!("Feature flag {} manually disabled: {}", name, reason);
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Option<FeatureFlagStatus> {
        self.inner.flags.read().await.get(name).map(FlagEntry::status)
    }

    pub async fn get_all(&self) -> Vec<FeatureFlagStatus> {
        let mut all: Vec<_> = self
            .inner
            .flags
            .read()
            .await
            .values()
            .map(FlagEntry::status)
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Run one evaluation pass, returns the number of flags that changed
    pub async fn evaluate_all(&self) -> usize {
        self.inner.evaluate_all().await
    }

    pub async fn start_evaluation(&self) {
        let mut slot = self.inner.task.lock().await;
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(&self.inner);
        *slot = Some(PeriodicTask::spawn(
            "feature-flags",
            self.inner.interval,
            true,
            move || {
                let weak = weak.clone();
                async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.evaluate_all().await;
                    }
                }
                .boxed()
            },
        ));
    }

    pub async fn stop_evaluation(&self) {
        if let Some(task) = self.inner.task.lock().await.take() {
            task.shutdown().await;
        }
    }
}

impl FlagsInner {
    fn dependencies_ready(&self, dependencies: &[String]) -> bool {
        dependencies.iter().all(|dep| self.readiness.is_ready(dep))
    }

    async fn should_enable(&self, definition: &FeatureFlagDefinition) -> bool {
        if !self.dependencies_ready(&definition.dependencies) {
            return false;
        }
        match (&definition.health_check, definition.auto_disable_on_failure) {
            (Some(probe), true) => match tokio::time::timeout(self.health_check_timeout, probe()).await {
                Ok(Ok(healthy)) => healthy,
                Ok(Err(e)) => {
                    debug!("Health check for flag {} errored: {}", definition.name, e);
                    false
                }
                Err(_) => {
                    warn!(
                        "Health check for flag {} timed out after {}ms",
                        definition.name,
                        self.health_check_timeout.as_millis()
                    );
                    false
                }
            },
            _ => true,
        }
    }

    async fn evaluate_all(&self) -> usize {
        let definitions: Vec<FeatureFlagDefinition> = self
            .flags
            .read()
            .await
            .values()
            .map(|f| f.definition.clone())
            .collect();

        let mut decisions = Vec::with_capacity(definitions.len());
        for definition in &definitions {
            decisions.push((definition.name.clone(), self.should_enable(definition).await));
        }

        let mut changed = 0;
        let mut flags = self.flags.write().await;
        for (name, should_enable) in decisions {
            let Some(flag) = flags.get_mut(&name) else {
                continue;
            };
            if flag.enabled == should_enable {
                continue;
            }

            flag.enabled = should_enable;
            flag.last_updated = Utc::now();
            changed += 1;
            if should_enable {
                flag.disabled_reason = None;
                info!("Feature flag {} automatically enabled", name);
            } else {
                flag.disabled_reason = Some(AUTO_DISABLED_REASON.to_string());
                warn!("Feature flag {} automatically disabled", name);
            }
        }
        changed
    }
}

#[async_trait]
impl ManagedService for FeatureFlagService {
    async fn start(&self) -> Result<()> {
        self.start_evaluation().await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stop_evaluation().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn service() -> (FeatureFlagService, Arc<ReadinessRegistry>) {
        let readiness = ReadinessRegistry::shared(Vec::<String>::new());
        (
            FeatureFlagService::new(readiness.clone(), Duration::from_secs(30)),
            readiness,
        )
    }

    #[tokio::test]
    async fn test_initial_state_follows_dependencies() {
        let (flags, readiness) = service();
        readiness.set_ready("rpc");
        flags
            .register(FeatureFlagDefinition::new("deposits", "").depends_on(["rpc"]))
            .await;
        flags
            .register(FeatureFlagDefinition::new("withdrawals", "").depends_on(["rpc", "bridge"]))
            .await;

        assert!(flags.is_enabled("deposits").await);
        assert!(!flags.is_enabled("withdrawals").await);
        assert!(!flags.is_enabled("unknown").await);
    }

    #[tokio::test]
    async fn test_dependency_gates_regardless_of_probe() {
        let (flags, readiness) = service();
        readiness.set_ready("rpc");
        flags
            .register(
                FeatureFlagDefinition::new("staking", "")
                    .depends_on(["rpc"])
                    .with_health_check(|| async { Ok::<_, SentinelError>(true) }),
            )
            .await;
        assert!(flags.is_enabled("staking").await);

        readiness.set_error("rpc", "all endpoints down");
        assert_eq!(flags.evaluate_all().await, 1);
        let status = flags.get("staking").await.unwrap();
        assert!(!status.enabled);
        assert_eq!(status.disabled_reason.as_deref(), Some(AUTO_DISABLED_REASON));

        readiness.set_ready("rpc");
        assert_eq!(flags.evaluate_all().await, 1);
        let status = flags.get("staking").await.unwrap();
        assert!(status.enabled);
        assert!(status.disabled_reason.is_none());
    }

    #[tokio::test]
    async fn test_probe_error_counts_as_unhealthy() {
        let (flags, _) = service();
        flags
            .register(
                FeatureFlagDefinition::new("vault", "")
                    .with_health_check(|| async { Err::<bool, _>(SentinelError::Internal("probe".into())) }),
            )
            .await;
        assert!(flags.is_enabled("vault").await);
        flags.evaluate_all().await;
        assert!(!flags.is_enabled("vault").await);
    }

    #[tokio::test]
    async fn test_hung_health_check_times_out_without_stalling_others() {
        let readiness = ReadinessRegistry::shared(Vec::<String>::new());
        let flags = FeatureFlagService::with_health_check_timeout(
            readiness.clone(),
            Duration::from_secs(30),
            Duration::from_millis(20),
        );
        flags
            .register(
                FeatureFlagDefinition::new("bridge", "")
                    .with_health_check(|| futures::future::pending::<Result<bool>>()),
            )
            .await;
        flags
            .register(FeatureFlagDefinition::new("deposits", "").depends_on(["db"]))
            .await;
        assert!(flags.is_enabled("bridge").await);
        readiness.set_ready("db");

        let changed = tokio::time::timeout(Duration::from_secs(1), flags.evaluate_all())
            .await
            .expect("evaluation stalled on a hung health check");
        assert_eq!(changed, 2);
        assert!(!flags.is_enabled("bridge").await);
        assert!(flags.is_enabled("deposits").await);
    }

    #[tokio::test]
    async fn test_probe_ignored_without_auto_disable() {
        let (flags, _) = service();
        flags
            .register(
                FeatureFlagDefinition::new("rewards", "")
                    .auto_disable_on_failure(false)
                    .with_health_check(|| async { Ok::<_, SentinelError>(false) }),
            )
            .await;
        assert_eq!(flags.evaluate_all().await, 0);
        assert!(flags.is_enabled("rewards").await);
    }

    #[tokio::test]
    async fn test_no_transition_when_unchanged() {
        let (flags, readiness) = service();
        readiness.set_ready("rpc");
        flags
            .register(FeatureFlagDefinition::new("deposits", "").depends_on(["rpc"]))
            .await;
        assert_eq!(flags.evaluate_all().await, 0);
        assert_eq!(flags.evaluate_all().await, 0);
    }

    #[tokio::test]
    async fn test_manual_override_is_not_sticky() {
        let (flags, readiness) = service();
        readiness.set_ready("rpc");
        flags
            .register(FeatureFlagDefinition::new("deposits", "").depends_on(["rpc"]))
            .await;

        flags.disable("deposits", "maintenance").await.unwrap();
        assert!(!flags.is_enabled("deposits").await);
        assert_eq!(
            flags.get("deposits").await.unwrap().disabled_reason.as_deref(),
            Some("maintenance")
        );

        flags.evaluate_all().await;
        assert!(flags.is_enabled("deposits").await);
    }

    #[tokio::test]
    async fn test_unknown_flag_override_errors() {
        let (flags, _) = service();
        assert!(matches!(
            flags.enable("ghost").await,
            Err(SentinelError::FlagNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_runs_immediate_evaluation() {
        let (flags, _) = service();
        let healthy = Arc::new(AtomicBool::new(false));
        let probe_state = healthy.clone();
        flags
            .register(
                FeatureFlagDefinition::new("bridge", "")
                    .with_health_check(move || {
                        let probe_state = probe_state.clone();
                        async move { Ok::<_, SentinelError>(probe_state.load(Ordering::SeqCst)) }
                    }),
            )
            .await;

        flags.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!flags.is_enabled("bridge").await);
        flags.stop().await.unwrap();

        let all = flags.get_all().await;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "bridge");
    }
}
