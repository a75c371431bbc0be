//! Application context
//!
//! Builds every component from `AppConfig` once at startup and hands out
//! shared handles. Nothing in the crate reaches for globals; whatever a
//! component needs is passed in here.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::adapters::{
    HttpConfirmationClient, MemoryStore, PostgresStore, RpcChainClient, CONFIRMATION_BREAKER,
};
use crate::config::AppConfig;
use crate::coordination::{CircuitBreakerConfig, GracefulShutdown, ShutdownSignal};
use crate::error::{Result, SentinelError};
use crate::ports::{ChainClient, ConfirmationPort, RedemptionStore, ReconciliationStore};
use crate::rpc::{HttpRpcTransport, ResilientRpcAdapter, RpcTransport};
use crate::services::{
    FeatureFlagService, ReadinessRegistry, ReconciliationService, ReconciliationSettings,
    WithdrawalRetryService, WithdrawalRetrySettings,
};
use crate::supervisor::{ManagedService, ServiceOptions, ServiceSupervisor, SupervisorSettings};

/// Names the services are registered and reported under
pub mod names {
    pub const DATABASE: &str = "database";
    pub const RPC: &str = "rpc";
    pub const FEATURE_FLAGS: &str = "feature-flags";
    pub const RECONCILIATION: &str = "reconciliation";
    pub const WITHDRAWAL_RETRY: &str = "withdrawal-retry";
}

/// Storage backing both store ports
enum Storage {
    Postgres(Arc<PostgresStore>),
    Memory(Arc<MemoryStore>),
}

impl Storage {
    fn redemptions(&self) -> Arc<dyn RedemptionStore> {
        match self {
            Storage::Postgres(s) => s.clone(),
            Storage::Memory(s) => s.clone(),
        }
    }

    fn reconciliation(&self) -> Arc<dyn ReconciliationStore> {
        match self {
            Storage::Postgres(s) => s.clone(),
            Storage::Memory(s) => s.clone(),
        }
    }
}

pub struct AppContext {
    pub config: AppConfig,
    pub readiness: Arc<ReadinessRegistry>,
    pub supervisor: ServiceSupervisor,
    pub rpc: ResilientRpcAdapter,
    pub feature_flags: FeatureFlagService,
    pub reconciliation: ReconciliationService,
    pub withdrawal_retry: WithdrawalRetryService,
    pub graceful: Arc<GracefulShutdown>,
    postgres: Option<Arc<PostgresStore>>,
}

impl AppContext {
    /// Build the context against the real transport and configured storage
    pub async fn init(config: AppConfig) -> Result<Self> {
        if let Err(errors) = config.validate() {
            return Err(SentinelError::Validation(errors.join("; ")));
        }

        let transport: Arc<dyn RpcTransport> = Arc::new(HttpRpcTransport::new(
            Duration::from_millis(config.rpc.timeout_ms),
        )?);

        let storage = match &config.database {
            Some(db) => {
                let store = PostgresStore::new(&db.url, db.max_connections).await?;
                store.migrate().await?;
                Storage::Postgres(Arc::new(store))
            }
            None => {
                warn!("No database configured, using in-memory store");
                Storage::Memory(Arc::new(MemoryStore::new()))
            }
        };

        Self::assemble(config, transport, storage).await
    }

    /// Build the context on an in-memory store and a caller-supplied transport
    pub async fn with_memory_store(
        config: AppConfig,
        transport: Arc<dyn RpcTransport>,
        store: Arc<MemoryStore>,
    ) -> Result<Self> {
        Self::assemble(config, transport, Storage::Memory(store)).await
    }

    async fn assemble(
        config: AppConfig,
        transport: Arc<dyn RpcTransport>,
        storage: Storage,
    ) -> Result<Self> {
        let readiness = ReadinessRegistry::shared(config.readiness.critical_services.clone());
        let supervisor =
            ServiceSupervisor::new(SupervisorSettings::from(&config.supervisor), readiness.clone());

        let rpc = ResilientRpcAdapter::from_config(&config.rpc, transport)?;

        let breaker = supervisor
            .create_circuit_breaker(CircuitBreakerConfig {
                name: CONFIRMATION_BREAKER.to_string(),
                failure_threshold: config.supervisor.breaker_failure_threshold,
                reset_timeout: Duration::from_millis(config.supervisor.breaker_reset_timeout_ms),
                half_open_requests: config.supervisor.breaker_half_open_requests,
            })
            .await;

        let chain: Arc<dyn ChainClient> = Arc::new(RpcChainClient::new(rpc.clone(), &config.chain));
        let confirmation: Arc<dyn ConfirmationPort> =
            Arc::new(HttpConfirmationClient::new(&config.bridge, breaker)?);

        let feature_flags =
            FeatureFlagService::from_config(readiness.clone(), &config.feature_flags).await;
        let reconciliation = ReconciliationService::new(
            ReconciliationSettings::from(&config.reconciliation),
            storage.reconciliation(),
        );
        let withdrawal_retry = WithdrawalRetryService::new(
            WithdrawalRetrySettings::from(&config.withdrawal_retry),
            storage.redemptions(),
            chain,
            confirmation,
        );

        let postgres = match &storage {
            Storage::Postgres(store) => Some(store.clone()),
            Storage::Memory(_) => None,
        };

        let ctx = Self {
            config,
            readiness,
            supervisor,
            rpc,
            feature_flags,
            reconciliation,
            withdrawal_retry,
            graceful: Arc::new(GracefulShutdown::with_defaults()),
            postgres,
        };
        ctx.register_services().await?;
        Ok(ctx)
    }

    fn options_for(&self, name: &str) -> ServiceOptions {
        let critical = self
            .config
            .readiness
            .critical_services
            .iter()
            .any(|c| c == name);
        ServiceOptions::from_config(&self.config.supervisor).critical(critical)
    }

    async fn register_services(&self) -> Result<()> {
        let mut services: Vec<(&str, Arc<dyn ManagedService>)> = Vec::new();
        if let Some(store) = &self.postgres {
            services.push((names::DATABASE, store.clone() as Arc<dyn ManagedService>));
        }
        services.push((names::RPC, Arc::new(self.rpc.clone()) as Arc<dyn ManagedService>));
        services.push((
            names::FEATURE_FLAGS,
            Arc::new(self.feature_flags.clone()) as Arc<dyn ManagedService>,
        ));
        services.push((
            names::RECONCILIATION,
            Arc::new(self.reconciliation.clone()) as Arc<dyn ManagedService>,
        ));
        services.push((
            names::WITHDRAWAL_RETRY,
            Arc::new(self.withdrawal_retry.clone()) as Arc<dyn ManagedService>,
        ));

        for (name, service) in services {
            self.supervisor
                .register(name, service, self.options_for(name))
                .await?;
        }
        Ok(())
    }

    pub async fn start(&self) -> Result<()> {
        self.supervisor.start_all().await?;
        info!(
            "Control plane started, critical services ready: {}",
            self.readiness.all_critical_services_ready()
        );
        Ok(())
    }

    /// Stop every service, bounded by the shutdown timeout for `signal`.
    /// The database pool is closed last, after every service has stopped.
    pub async fn shutdown(&self, signal: ShutdownSignal) -> bool {
        let supervisor = self.supervisor.clone();
        let postgres = self.postgres.clone();
        self.graceful
            .execute(signal, async move {
                supervisor.stop_all().await;
                if let Some(store) = postgres {
                    store.close().await;
                }
            })
            .await
    }
}
