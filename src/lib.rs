pub mod adapters;
pub mod app;
pub mod cli;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod ports;
pub mod rpc;
pub mod services;
pub mod supervisor;

pub use app::AppContext;
pub use config::AppConfig;
pub use coordination::{
    CircuitBreaker, CircuitBreakerConfig, CircuitState, GracefulShutdown, ShutdownSignal,
};
pub use error::{Result, RpcError, SentinelError};
pub use rpc::{CallOptions, ResilientRpcAdapter, RpcTransport};
pub use services::{
    FeatureFlagService, ReadinessRegistry, ReconciliationService, WithdrawalRetryService,
};
pub use supervisor::{ManagedService, ServiceSupervisor};
