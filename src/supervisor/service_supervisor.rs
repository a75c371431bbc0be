//! Service Supervisor
//!
//! Starts registered services, probes their health on a timer, and restarts
//! failed services with exponential backoff until their restart budget is
//! spent. Also hosts the named circuit breakers used around external calls.

use super::service::{
    ManagedService, ServiceOptions, ServiceSnapshot, ServiceState, SupervisorEvent,
    SupervisorSettings,
};
use crate::coordination::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerSnapshot, PeriodicTask};
use crate::error::{Result, SentinelError};
use crate::services::ReadinessRegistry;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch, RwLock};
use tracing::{debug, error, info, warn};

struct ServiceEntry {
    service: Arc<dyn ManagedService>,
    options: ServiceOptions,
    state: ServiceState,
    restart_count: u32,
    consecutive_failures: u32,
    last_error: Option<String>,
    last_health_check: Option<DateTime<Utc>>,
    health_task: Option<PeriodicTask>,
    restart_pending: bool,
}

/// Status for the operator dashboard
#[derive(Debug, Clone, Serialize)]
pub struct SupervisorStatus {
    pub services: Vec<ServiceSnapshot>,
    pub circuit_breakers: Vec<CircuitBreakerSnapshot>,
}

struct SupervisorInner {
    settings: SupervisorSettings,
    readiness: Arc<ReadinessRegistry>,
    services: RwLock<HashMap<String, ServiceEntry>>,
    order: RwLock<Vec<String>>,
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    event_tx: broadcast::Sender<SupervisorEvent>,
    shutdown_tx: watch::Sender<bool>,
}

#[derive(Clone)]
pub struct ServiceSupervisor {
    inner: Arc<SupervisorInner>,
}

impl ServiceSupervisor {
    pub fn new(settings: SupervisorSettings, readiness: Arc<ReadinessRegistry>) -> Self {
        let (event_tx, _) = broadcast::channel(128);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(SupervisorInner {
                settings,
                readiness,
                services: RwLock::new(HashMap::new()),
                order: RwLock::new(Vec::new()),
                breakers: RwLock::new(HashMap::new()),
                event_tx,
                shutdown_tx,
            }),
        }
    }

    /// Subscribe to supervisor events
    pub fn subscribe(&self) -> broadcast::Receiver<SupervisorEvent> {
        self.inner.event_tx.subscribe()
    }

    /// Register a service under `name`
    pub async fn register(
        &self,
        name: &str,
        service: Arc<dyn ManagedService>,
        options: ServiceOptions,
    ) -> Result<()> {
        let mut services = self.inner.services.write().await;
        if services.contains_key(name) {
            return Err(SentinelError::Validation(format!(
                "service already registered: {}",
                name
            )));
        }

        services.insert(
            name.to_string(),
            ServiceEntry {
                service,
                options: options.clone(),
                state: ServiceState::Stopped,
                restart_count: 0,
                consecutive_failures: 0,
                last_error: None,
                last_health_check: None,
                health_task: None,
                restart_pending: false,
            },
        );
        self.inner.order.write().await.push(name.to_string());

        debug!(
            "Registered service {} (critical: {}, max restarts: {})",
            name, options.critical, options.max_restarts
        );
        Ok(())
    }

    /// Start every service: critical ones in order, the rest concurrently
    pub async fn start_all(&self) -> Result<()> {
        self.inner.shutdown_tx.send_replace(false);

        let order = self.inner.order.read().await.clone();
        let (critical, background): (Vec<String>, Vec<String>) = {
            let services = self.inner.services.read().await;
            order
                .into_iter()
                .partition(|name| services.get(name).map(|e| e.options.critical).unwrap_or(false))
        };

        info!(
            "Starting {} critical and {} background services",
            critical.len(),
            background.len()
        );

        for name in critical {
            if let Err(e) = self.inner.clone().start_service(name.clone()).await {
                error!("Critical service {} failed to start: {}", name, e);
                return Err(e);
            }
        }

        for name in background {
            let inner = self.inner.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.start_service(name.clone()).await {
                    warn!("Background service {} failed to start: {}", name, e);
                }
            });
        }

        Ok(())
    }

    /// Stop health timers and pending restarts, then every service in reverse order
    pub async fn stop_all(&self) {
        self.inner.shutdown_tx.send_replace(true);

        {
            let mut services = self.inner.services.write().await;
            for entry in services.values_mut() {
                if let Some(task) = entry.health_task.take() {
                    task.stop();
                }
                entry.restart_pending = false;
            }
        }
        debug!("All health check timers stopped");

        let mut order = self.inner.order.read().await.clone();
        order.reverse();
        for name in order {
            self.inner.stop_service(&name).await;
        }

        info!("All services stopped");
    }

    /// Start (or restart) one service now
    pub async fn start_service(&self, name: &str) -> Result<()> {
        self.inner.clone().start_service(name.to_string()).await
    }

    pub async fn stop_service(&self, name: &str) -> Result<()> {
        if !self.inner.services.read().await.contains_key(name) {
            return Err(SentinelError::ServiceNotFound(name.to_string()));
        }
        self.inner.stop_service(name).await;
        Ok(())
    }

    /// Clear the restart budget of a service. A service that had given up
    /// (`Failed`) is started again right away.
    pub async fn reset_restarts(&self, name: &str) -> Result<()> {
        let was_failed = {
            let mut services = self.inner.services.write().await;
            let entry = services
                .get_mut(name)
                .ok_or_else(|| SentinelError::ServiceNotFound(name.to_string()))?;
            entry.restart_count = 0;
            entry.consecutive_failures = 0;
            entry.state == ServiceState::Failed
        };
        info!("Restart counter reset for {}", name);

        if was_failed {
            self.start_service(name).await?;
        }
        Ok(())
    }

    /// Stop and start a service immediately, outside the backoff schedule
    pub async fn force_restart(&self, name: &str) -> Result<()> {
        self.stop_service(name).await?;
        self.start_service(name).await
    }

    pub async fn service_state(&self, name: &str) -> Option<ServiceState> {
        self.inner.services.read().await.get(name).map(|e| e.state)
    }

    pub async fn get_status(&self) -> SupervisorStatus {
        let order = self.inner.order.read().await.clone();
        let services = {
            let services = self.inner.services.read().await;
            order
                .iter()
                .filter_map(|name| {
                    services.get(name).map(|entry| ServiceSnapshot {
                        name: name.clone(),
                        state: entry.state,
                        critical: entry.options.critical,
                        restart_count: entry.restart_count,
                        max_restarts: entry.options.max_restarts,
                        consecutive_failures: entry.consecutive_failures,
                        last_error: entry.last_error.clone(),
                        last_health_check: entry.last_health_check,
                    })
                })
                .collect()
        };

        let breakers: Vec<Arc<CircuitBreaker>> =
            self.inner.breakers.read().await.values().cloned().collect();
        let mut circuit_breakers = Vec::with_capacity(breakers.len());
        for breaker in breakers {
            circuit_breakers.push(breaker.snapshot().await);
        }
        circuit_breakers.sort_by(|a, b| a.name.cmp(&b.name));

        SupervisorStatus {
            services,
            circuit_breakers,
        }
    }

    // ==================== Circuit breakers ====================

    /// Create (or replace) a named circuit breaker
    pub async fn create_circuit_breaker(&self, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let name = config.name.clone();
        let breaker = Arc::new(CircuitBreaker::new(config));
        self.inner
            .breakers
            .write()
            .await
            .insert(name.clone(), breaker.clone());
        debug!("Created circuit breaker {}", name);
        breaker
    }

    pub async fn circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner.breakers.read().await.get(name).cloned()
    }

    /// Run `op` through the named breaker, failing fast while it is open
    pub async fn with_circuit_breaker<T, F, Fut>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self
            .circuit_breaker(name)
            .await
            .ok_or_else(|| SentinelError::UnknownCircuitBreaker(name.to_string()))?;
        breaker.call(op).await
    }

    /// Like [`with_circuit_breaker`](Self::with_circuit_breaker), but hands the
    /// fast-fail or call error to `fallback` instead of returning it.
    pub async fn with_circuit_breaker_or<T, F, Fut, G, GFut>(
        &self,
        name: &str,
        op: F,
        fallback: G,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
        G: FnOnce(SentinelError) -> GFut,
        GFut: Future<Output = Result<T>>,
    {
        match self.with_circuit_breaker(name, op).await {
            Ok(value) => Ok(value),
            Err(SentinelError::UnknownCircuitBreaker(n)) => {
                Err(SentinelError::UnknownCircuitBreaker(n))
            }
            Err(e) => {
                debug!("Circuit breaker {} using fallback: {}", name, e);
                fallback(e).await
            }
        }
    }
}

impl SupervisorInner {
    fn emit(&self, event: SupervisorEvent) {
        let _ = self.event_tx.send(event);
    }

    fn set_state(&self, name: &str, entry: &mut ServiceEntry, to: ServiceState, reason: Option<&str>) {
        let from = entry.state;
        if from == to {
            return;
        }
        entry.state = to;
        self.emit(SupervisorEvent::StateChanged {
            service: name.to_string(),
            from,
            to,
            reason: reason.map(String::from),
        });
        info!(
            "Service {} state: {} -> {}{}",
            name,
            from,
            to,
            reason.map(|r| format!(" ({})", r)).unwrap_or_default()
        );
    }

    fn start_service(self: Arc<Self>, name: String) -> BoxFuture<'static, Result<()>> {
        async move {
            let service = {
                let mut services = self.services.write().await;
                let entry = services
                    .get_mut(&name)
                    .ok_or_else(|| SentinelError::ServiceNotFound(name.clone()))?;
                if matches!(entry.state, ServiceState::Starting) || entry.state.is_up() {
                    return Ok(());
                }
                self.set_state(&name, entry, ServiceState::Starting, None);
                entry.service.clone()
            };

            let outcome = match tokio::time::timeout(self.settings.startup_timeout, service.start())
                .await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(format!("start failed: {}", e)),
                Err(_) => Err(format!(
                    "start timed out after {}ms",
                    self.settings.startup_timeout.as_millis()
                )),
            };

            match outcome {
                Ok(()) => {
                    let mut services = self.services.write().await;
                    if let Some(entry) = services.get_mut(&name) {
                        entry.consecutive_failures = 0;
                        entry.last_error = None;
                        entry.restart_pending = false;
                        self.set_state(&name, entry, ServiceState::Running, None);
                        self.readiness.set_ready(&name);

                        if let Some(interval) = entry.options.health_check_interval {
                            if let Some(old) = entry.health_task.take() {
                                old.stop();
                            }
                            entry.health_task =
                                Some(spawn_health_task(Arc::downgrade(&self), &name, interval));
                        }
                    }
                    Ok(())
                }
                Err(reason) => {
                    let restart = {
                        let mut services = self.services.write().await;
                        match services.get_mut(&name) {
                            Some(entry) => {
                                entry.last_error = Some(reason.clone());
                                self.set_state(&name, entry, ServiceState::Failed, Some(&reason));
                                self.readiness.set_error(&name, &reason);
                                entry.options.restart_on_failure
                            }
                            None => false,
                        }
                    };

                    if restart {
                        self.schedule_restart(&name).await;
                    }

                    Err(SentinelError::ComponentFailure {
                        component: name,
                        reason,
                    })
                }
            }
        }
        .boxed()
    }

    async fn stop_service(&self, name: &str) {
        let service = {
            let mut services = self.services.write().await;
            let Some(entry) = services.get_mut(name) else {
                return;
            };
            if let Some(task) = entry.health_task.take() {
                task.stop();
            }
            if entry.state == ServiceState::Stopped {
                return;
            }
            entry.service.clone()
        };

        match tokio::time::timeout(self.settings.stop_timeout, service.stop()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Service {} stop returned error: {}", name, e),
            Err(_) => warn!(
                "Service {} stop timed out after {}ms",
                name,
                self.settings.stop_timeout.as_millis()
            ),
        }

        let mut services = self.services.write().await;
        if let Some(entry) = services.get_mut(name) {
            self.set_state(name, entry, ServiceState::Stopped, None);
            self.readiness.set_error(name, "stopped");
        }
    }

    async fn run_health_check(self: Arc<Self>, name: String) {
        let service = {
            let services = self.services.read().await;
            match services.get(&name) {
                Some(entry) if entry.state.is_up() && !entry.restart_pending => entry.service.clone(),
                _ => return,
            }
        };

        let healthy = matches!(
            tokio::time::timeout(self.settings.health_check_timeout, service.health_check()).await,
            Ok(Ok(true))
        );

        let needs_restart = {
            let mut services = self.services.write().await;
            let Some(entry) = services.get_mut(&name) else {
                return;
            };
            entry.last_health_check = Some(Utc::now());

            if healthy {
                entry.consecutive_failures = 0;
                if entry.state == ServiceState::Degraded {
                    self.set_state(&name, entry, ServiceState::Running, Some("health check recovered"));
                    self.readiness.set_ready(&name);
                }
                false
            } else {
                entry.consecutive_failures += 1;
                let failures = entry.consecutive_failures;
                self.emit(SupervisorEvent::HealthCheckFailed {
                    service: name.clone(),
                    consecutive_failures: failures,
                });
                debug!("Health check failed for {} ({} in a row)", name, failures);

                if failures >= self.settings.degraded_after && entry.state == ServiceState::Running {
                    let reason = format!("{} consecutive health check failures", failures);
                    self.set_state(&name, entry, ServiceState::Degraded, Some(&reason));
                    self.readiness.set_error(&name, &reason);
                }

                failures >= self.settings.restart_after
                    && entry.options.restart_on_failure
                    && !entry.restart_pending
            }
        };

        if needs_restart {
            self.schedule_restart(&name).await;
        }
    }

    async fn schedule_restart(self: &Arc<Self>, name: &str) {
        if *self.shutdown_tx.borrow() {
            return;
        }

        let delay = {
            let mut services = self.services.write().await;
            let Some(entry) = services.get_mut(name) else {
                return;
            };
            if entry.restart_pending {
                return;
            }

            if entry.restart_count >= entry.options.max_restarts {
                let reason = format!("max restarts ({}) reached", entry.options.max_restarts);
                if let Some(task) = entry.health_task.take() {
                    task.stop();
                }
                entry.last_error = Some(reason.clone());
                self.set_state(name, entry, ServiceState::Failed, Some(&reason));
                self.readiness.set_error(name, &reason);
                self.emit(SupervisorEvent::RestartExhausted {
                    service: name.to_string(),
                    restarts: entry.restart_count,
                });
                error!("Service {} exhausted its restart budget", name);
                return;
            }

            let delay = self
                .settings
                .restart_delay(entry.options.restart_delay, entry.restart_count);
            entry.restart_count += 1;
            entry.restart_pending = true;
            if let Some(task) = entry.health_task.take() {
                task.stop();
            }

            self.emit(SupervisorEvent::RestartScheduled {
                service: name.to_string(),
                attempt: entry.restart_count,
                delay_ms: delay.as_millis() as u64,
            });
            warn!(
                "Restart #{} of {} scheduled in {}ms",
                entry.restart_count,
                name,
                delay.as_millis()
            );
            delay
        };

        let inner = self.clone();
        let name = name.to_string();
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = async {
                    while shutdown_rx.changed().await.is_ok() {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                } => {
                    debug!("Pending restart of {} cancelled by shutdown", name);
                    return;
                }
            }

            inner.stop_service(&name).await;
            {
                let mut services = inner.services.write().await;
                if let Some(entry) = services.get_mut(&name) {
                    entry.restart_pending = false;
                }
            }
            if let Err(e) = inner.clone().start_service(name.clone()).await {
                warn!("Restart of {} failed: {}", name, e);
            }
        });
    }
}

fn spawn_health_task(
    inner: Weak<SupervisorInner>,
    name: &str,
    interval: std::time::Duration,
) -> PeriodicTask {
    let service_name = name.to_string();
    PeriodicTask::spawn(format!("health:{}", name), interval, false, move || {
        let inner = inner.clone();
        let name = service_name.clone();
        async move {
            if let Some(inner) = inner.upgrade() {
                inner.run_health_check(name).await;
            }
        }
        .boxed()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::time::Duration;

    #[derive(Default)]
    struct FakeService {
        starts: AtomicU32,
        stops: AtomicU32,
        fail_start: AtomicBool,
        unhealthy: AtomicBool,
    }

    #[async_trait]
    impl ManagedService for FakeService {
        async fn start(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(SentinelError::Internal("cannot start".into()));
            }
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            self.stops.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(!self.unhealthy.load(Ordering::SeqCst))
        }
    }

    fn supervisor() -> (ServiceSupervisor, Arc<ReadinessRegistry>) {
        let readiness = ReadinessRegistry::shared(Vec::<String>::new());
        (
            ServiceSupervisor::new(SupervisorSettings::default(), readiness.clone()),
            readiness,
        )
    }

    fn fast_options() -> ServiceOptions {
        ServiceOptions::default()
            .health_check_every(Duration::from_millis(10))
            .restart_delay(Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_start_marks_running_and_ready() {
        let (sup, readiness) = supervisor();
        let svc = Arc::new(FakeService::default());
        sup.register(
            "worker",
            svc.clone(),
            ServiceOptions::default().critical(true).without_health_check(),
        )
        .await
        .unwrap();

        sup.start_all().await.unwrap();
        assert_eq!(sup.service_state("worker").await, Some(ServiceState::Running));
        assert!(readiness.is_ready("worker"));

        sup.stop_all().await;
        assert_eq!(sup.service_state("worker").await, Some(ServiceState::Stopped));
        assert_eq!(svc.stops.load(Ordering::SeqCst), 1);
        assert!(!readiness.is_ready("worker"));
    }

    /// Start blocks until `release` is notified
    #[derive(Default)]
    struct GatedService {
        release: tokio::sync::Notify,
    }

    #[async_trait]
    impl ManagedService for GatedService {
        async fn start(&self) -> Result<()> {
            self.release.notified().await;
            Ok(())
        }

        async fn stop(&self) -> Result<()> {
            Ok(())
        }

        async fn health_check(&self) -> Result<bool> {
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_start_all_does_not_wait_for_background_services() {
        let (sup, readiness) = supervisor();
        let svc = Arc::new(GatedService::default());
        sup.register("indexer", svc.clone(), ServiceOptions::default().without_health_check())
            .await
            .unwrap();

        tokio::time::timeout(Duration::from_millis(100), sup.start_all())
            .await
            .expect("start_all blocked on a background service")
            .unwrap();
        assert_ne!(sup.service_state("indexer").await, Some(ServiceState::Running));

        svc.release.notify_one();
        let mut running = false;
        for _ in 0..50 {
            if sup.service_state("indexer").await == Some(ServiceState::Running) {
                running = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(running);
        assert!(readiness.is_ready("indexer"));
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_reset_restarts_revives_failed_service() {
        let (sup, readiness) = supervisor();
        let svc = Arc::new(FakeService::default());
        svc.fail_start.store(true, Ordering::SeqCst);
        sup.register(
            "db",
            svc.clone(),
            ServiceOptions::default().restart_on_failure(false).without_health_check(),
        )
        .await
        .unwrap();

        assert!(sup.start_service("db").await.is_err());
        assert_eq!(sup.service_state("db").await, Some(ServiceState::Failed));

        svc.fail_start.store(false, Ordering::SeqCst);
        sup.reset_restarts("db").await.unwrap();
        assert_eq!(sup.service_state("db").await, Some(ServiceState::Running));
        assert!(readiness.is_ready("db"));
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_duplicate_registration_rejected() {
        let (sup, _) = supervisor();
        let svc = Arc::new(FakeService::default());
        sup.register("a", svc.clone(), ServiceOptions::default()).await.unwrap();
        assert!(sup.register("a", svc, ServiceOptions::default()).await.is_err());
    }

    #[tokio::test]
    async fn test_critical_failure_blocks_startup() {
        let (sup, _) = supervisor();
        let svc = Arc::new(FakeService::default());
        svc.fail_start.store(true, Ordering::SeqCst);
        sup.register(
            "db",
            svc,
            ServiceOptions::default().critical(true).restart_on_failure(false),
        )
        .await
        .unwrap();

        let err = sup.start_all().await.unwrap_err();
        assert!(matches!(err, SentinelError::ComponentFailure { .. }));
        assert_eq!(sup.service_state("db").await, Some(ServiceState::Failed));
    }

    #[tokio::test]
    async fn test_failed_start_stops_after_max_restarts() {
        let (sup, _) = supervisor();
        let svc = Arc::new(FakeService::default());
        svc.fail_start.store(true, Ordering::SeqCst);
        sup.register("flaky", svc.clone(), fast_options().max_restarts(2))
            .await
            .unwrap();

        let _ = sup.start_service("flaky").await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // initial start + 2 restarts
        assert_eq!(svc.starts.load(Ordering::SeqCst), 3);
        let status = sup.get_status().await;
        assert_eq!(status.services[0].state, ServiceState::Failed);
        assert_eq!(status.services[0].restart_count, 2);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_health_failures_degrade_then_restart() {
        let (sup, readiness) = supervisor();
        let svc = Arc::new(FakeService::default());
        sup.register("rpc", svc.clone(), fast_options()).await.unwrap();
        let mut events = sup.subscribe();

        sup.start_service("rpc").await.unwrap();
        svc.unhealthy.store(true, Ordering::SeqCst);

        let mut saw_degraded = false;
        let mut saw_restart = false;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while tokio::time::Instant::now() < deadline && !(saw_degraded && saw_restart) {
            match tokio::time::timeout(Duration::from_millis(200), events.recv()).await {
                Ok(Ok(SupervisorEvent::StateChanged { to: ServiceState::Degraded, .. })) => {
                    saw_degraded = true;
                    assert!(!readiness.is_ready("rpc"));
                }
                Ok(Ok(SupervisorEvent::RestartScheduled { attempt, .. })) => {
                    assert_eq!(attempt, 1);
                    saw_restart = true;
                }
                _ => {}
            }
        }
        assert!(saw_degraded);
        assert!(saw_restart);
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_degraded_recovers_on_successful_check() {
        let (sup, readiness) = supervisor();
        let svc = Arc::new(FakeService::default());
        sup.register(
            "indexer",
            svc.clone(),
            fast_options().restart_on_failure(false),
        )
        .await
        .unwrap();
        sup.start_service("indexer").await.unwrap();

        svc.unhealthy.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sup.service_state("indexer").await, Some(ServiceState::Degraded));

        svc.unhealthy.store(false, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sup.service_state("indexer").await, Some(ServiceState::Running));
        assert!(readiness.is_ready("indexer"));
        sup.stop_all().await;
    }

    #[tokio::test]
    async fn test_with_circuit_breaker_and_fallback() {
        let (sup, _) = supervisor();
        sup.create_circuit_breaker(CircuitBreakerConfig {
            name: "bridge".into(),
            failure_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            half_open_requests: 1,
        })
        .await;

        let err = sup
            .with_circuit_breaker("bridge", || async {
                Err::<u32, _>(SentinelError::Internal("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SentinelError::Internal(_)));

        let fast = sup
            .with_circuit_breaker("bridge", || async { Ok::<_, SentinelError>(1u32) })
            .await
            .unwrap_err();
        assert!(matches!(fast, SentinelError::CircuitOpen { .. }));

        let value = sup
            .with_circuit_breaker_or("bridge", || async { Ok::<_, SentinelError>(1u32) }, |_| async { Ok::<_, SentinelError>(99u32) })
            .await
            .unwrap();
        assert_eq!(value, 99);

        let unknown = sup.with_circuit_breaker("missing", || async { Ok::<_, SentinelError>(1u32) }).await;
        assert!(matches!(unknown, Err(SentinelError::UnknownCircuitBreaker(_))));

        let status = sup.get_status().await;
        assert_eq!(status.circuit_breakers.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_restarts_unknown_service() {
        let (sup, _) = supervisor();
        assert!(matches!(
            sup.reset_restarts("ghost").await,
            Err(SentinelError::ServiceNotFound(_))
        ));
    }
}
