use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    #[serde(default)]
    pub readiness: ReadinessConfig,
    #[serde(default)]
    pub feature_flags: FeatureFlagsConfig,
    #[serde(default)]
    pub reconciliation: ReconciliationConfig,
    #[serde(default)]
    pub withdrawal_retry: WithdrawalRetryConfig,
    #[serde(default)]
    pub chain: ChainConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub database: Option<DatabaseConfig>,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// One configured JSON-RPC endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct RpcEndpointConfig {
    pub url: String,
    /// Lower is preferred
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub weight: Option<u32>,
    /// Attempts of a single call allowed on this endpoint
    #[serde(default)]
    pub max_retries: Option<u32>,
}

fn default_priority() -> u32 {
    1
}

#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default)]
    pub endpoints: Vec<RpcEndpointConfig>,
    /// Attempts per call (default: 3)
    #[serde(default = "default_rpc_max_retries")]
    pub max_retries: u32,
    /// Per-attempt timeout (default: 10s)
    #[serde(default = "default_rpc_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_rpc_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_rpc_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Background probe interval (default: 30s)
    #[serde(default = "default_rpc_health_interval")]
    pub health_check_interval_secs: u64,
    /// Probe timeout (default: 5s)
    #[serde(default = "default_rpc_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    /// TTL used when a call asks for caching without its own TTL
    #[serde(default = "default_rpc_cache_ttl_ms")]
    pub default_cache_ttl_ms: u64,
}

fn default_rpc_max_retries() -> u32 {
    3
}
fn default_rpc_timeout_ms() -> u64 {
    10_000
}
fn default_rpc_base_delay_ms() -> u64 {
    1_000
}
fn default_rpc_max_delay_ms() -> u64 {
    10_000
}
fn default_rpc_health_interval() -> u64 {
    30
}
fn default_rpc_health_check_timeout_ms() -> u64 {
    5_000
}
fn default_rpc_cache_ttl_ms() -> u64 {
    5_000
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            max_retries: default_rpc_max_retries(),
            timeout_ms: default_rpc_timeout_ms(),
            base_delay_ms: default_rpc_base_delay_ms(),
            max_delay_ms: default_rpc_max_delay_ms(),
            health_check_interval_secs: default_rpc_health_interval(),
            health_check_timeout_ms: default_rpc_health_check_timeout_ms(),
            default_cache_ttl_ms: default_rpc_cache_ttl_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SupervisorConfig {
    /// Base restart delay (default: 5s)
    #[serde(default = "default_restart_delay_ms")]
    pub restart_delay_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: u32,
    /// Restart delay cap (default: 300s)
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,
    /// Breaker guarding the bridge confirmation service
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,
    #[serde(default = "default_breaker_reset_timeout_ms")]
    pub breaker_reset_timeout_ms: u64,
    #[serde(default = "default_breaker_half_open_requests")]
    pub breaker_half_open_requests: u32,
}

fn default_restart_delay_ms() -> u64 {
    5_000
}
fn default_backoff_multiplier() -> u32 {
    2
}
fn default_max_backoff_ms() -> u64 {
    300_000
}
fn default_max_restarts() -> u32 {
    5
}
fn default_health_check_interval_ms() -> u64 {
    30_000
}
fn default_startup_timeout_ms() -> u64 {
    30_000
}
fn default_breaker_failure_threshold() -> u32 {
    5
}
fn default_breaker_reset_timeout_ms() -> u64 {
    60_000
}
fn default_breaker_half_open_requests() -> u32 {
    1
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            restart_delay_ms: default_restart_delay_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            max_backoff_ms: default_max_backoff_ms(),
            max_restarts: default_max_restarts(),
            health_check_interval_ms: default_health_check_interval_ms(),
            startup_timeout_ms: default_startup_timeout_ms(),
            breaker_failure_threshold: default_breaker_failure_threshold(),
            breaker_reset_timeout_ms: default_breaker_reset_timeout_ms(),
            breaker_half_open_requests: default_breaker_half_open_requests(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessConfig {
    /// Services that must be ready for the process to report ready
    #[serde(default = "default_critical_services")]
    pub critical_services: Vec<String>,
}

fn default_critical_services() -> Vec<String> {
    vec!["rpc".to_string()]
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            critical_services: default_critical_services(),
        }
    }
}

/// Flag declared in configuration (custom probes are attached in code)
#[derive(Debug, Clone, Deserialize)]
pub struct FlagConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default = "default_true")]
    pub auto_disable_on_failure: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeatureFlagsConfig {
    #[serde(default = "default_flag_interval")]
    pub evaluation_interval_secs: u64,
    /// Bound on each custom flag health check (default: 5s)
    #[serde(default = "default_flag_health_check_timeout_ms")]
    pub health_check_timeout_ms: u64,
    #[serde(default)]
    pub flags: Vec<FlagConfig>,
}

fn default_flag_interval() -> u64 {
    30
}
fn default_flag_health_check_timeout_ms() -> u64 {
    5_000
}

impl Default for FeatureFlagsConfig {
    fn default() -> Self {
        Self {
            evaluation_interval_secs: default_flag_interval(),
            health_check_timeout_ms: default_flag_health_check_timeout_ms(),
            flags: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconciliationConfig {
    /// Sweep interval (default: 300s)
    #[serde(default = "default_reconcile_interval")]
    pub interval_secs: u64,
    /// Age after which a pending record is considered stale (default: 1h)
    #[serde(default = "default_stale_threshold")]
    pub stale_threshold_secs: u64,
    /// Age of active positions included in the audit pass (default: 24h)
    #[serde(default = "default_position_audit_age")]
    pub position_audit_age_secs: u64,
    /// Retention of auto-cleanable failed records (default: 30 days)
    #[serde(default = "default_cleanup_retention_days")]
    pub cleanup_retention_days: u32,
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,
}

fn default_reconcile_interval() -> u64 {
    300
}
fn default_stale_threshold() -> u64 {
    3_600
}
fn default_position_audit_age() -> u64 {
    86_400
}
fn default_cleanup_retention_days() -> u32 {
    30
}
fn default_batch_size() -> u32 {
    100
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_reconcile_interval(),
            stale_threshold_secs: default_stale_threshold(),
            position_audit_age_secs: default_position_audit_age(),
            cleanup_retention_days: default_cleanup_retention_days(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WithdrawalRetryConfig {
    /// Queue sweep interval (default: 60s)
    #[serde(default = "default_retry_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_withdrawal_max_retries")]
    pub max_retries: u32,
    /// Base of the per-record backoff (default: 60s)
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Native token units below which the funding account is topped up
    #[serde(default = "default_min_balance")]
    pub min_balance: Decimal,
    #[serde(default = "default_top_up_amount")]
    pub top_up_amount: Decimal,
    /// Per-record ceiling on manual-trigger top-ups
    #[serde(default = "default_max_funding_attempts")]
    pub max_funding_attempts: u32,
}

fn default_retry_interval() -> u64 {
    60
}
fn default_withdrawal_max_retries() -> u32 {
    10
}
fn default_retry_backoff_ms() -> u64 {
    60_000
}
fn default_min_balance() -> Decimal {
    dec!(0.1)
}
fn default_top_up_amount() -> Decimal {
    dec!(0.5)
}
fn default_max_funding_attempts() -> u32 {
    3
}

impl Default for WithdrawalRetryConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_retry_interval(),
            max_retries: default_withdrawal_max_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            min_balance: default_min_balance(),
            top_up_amount: default_top_up_amount(),
            max_funding_attempts: default_max_funding_attempts(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    /// Account that pays gas for confirmation transactions
    #[serde(default)]
    pub smart_account_address: String,
    /// Node-managed account used for top-ups
    #[serde(default)]
    pub funder_address: String,
    /// Gas sponsorship available for the smart account
    #[serde(default)]
    pub paymaster_enabled: bool,
    /// How long a top-up may take to be mined before the balance is re-read
    #[serde(default = "default_receipt_timeout_ms")]
    pub receipt_timeout_ms: u64,
    #[serde(default = "default_receipt_poll_ms")]
    pub receipt_poll_ms: u64,
}

fn default_receipt_timeout_ms() -> u64 {
    60_000
}
fn default_receipt_poll_ms() -> u64 {
    2_000
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            smart_account_address: String::new(),
            funder_address: String::new(),
            paymaster_enabled: false,
            receipt_timeout_ms: default_receipt_timeout_ms(),
            receipt_poll_ms: default_receipt_poll_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Base URL of the bridge confirmation service
    #[serde(default)]
    pub confirmation_url: String,
    #[serde(default = "default_bridge_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_bridge_timeout_ms() -> u64 {
    30_000
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            confirmation_url: String::new(),
            timeout_ms: default_bridge_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("SENTINEL_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (SENTINEL_CHAIN__FUNDER_ADDRESS, etc.)
            .add_source(
                Environment::with_prefix("SENTINEL")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.rpc.endpoints.is_empty() {
            errors.push("rpc.endpoints must contain at least one endpoint".to_string());
        }
        for endpoint in &self.rpc.endpoints {
            if url::Url::parse(&endpoint.url).is_err() {
                errors.push(format!("rpc endpoint url is invalid: {}", endpoint.url));
            }
        }
        if self.rpc.max_retries == 0 {
            errors.push("rpc.max_retries must be at least 1".to_string());
        }
        if self.rpc.base_delay_ms > self.rpc.max_delay_ms {
            errors.push("rpc.base_delay_ms must not exceed rpc.max_delay_ms".to_string());
        }

        if self.supervisor.backoff_multiplier == 0 {
            errors.push("supervisor.backoff_multiplier must be positive".to_string());
        }
        if self.supervisor.breaker_half_open_requests == 0 {
            errors.push("supervisor.breaker_half_open_requests must be positive".to_string());
        }

        if self.withdrawal_retry.min_balance < Decimal::ZERO {
            errors.push("withdrawal_retry.min_balance must not be negative".to_string());
        }
        if self.withdrawal_retry.top_up_amount <= Decimal::ZERO {
            errors.push("withdrawal_retry.top_up_amount must be positive".to_string());
        }

        let mut names = std::collections::HashSet::new();
        for flag in &self.feature_flags.flags {
            if !names.insert(flag.name.as_str()) {
                errors.push(format!("duplicate feature flag: {}", flag.name));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = AppConfig::default();
        assert_eq!(config.rpc.max_retries, 3);
        assert_eq!(config.rpc.timeout_ms, 10_000);
        assert_eq!(config.supervisor.restart_delay_ms, 5_000);
        assert_eq!(config.supervisor.max_backoff_ms, 300_000);
        assert_eq!(config.reconciliation.stale_threshold_secs, 3_600);
        assert_eq!(config.withdrawal_retry.max_retries, 10);
        assert_eq!(config.withdrawal_retry.min_balance, dec!(0.1));
        assert_eq!(config.withdrawal_retry.top_up_amount, dec!(0.5));
        assert_eq!(config.withdrawal_retry.max_funding_attempts, 3);
    }

    #[test]
    fn test_validate_reports_all_problems() {
        let mut config = AppConfig::default();
        config.rpc.max_retries = 0;
        config.feature_flags.flags = vec![
            FlagConfig {
                name: "redemptions".into(),
                description: String::new(),
                dependencies: vec![],
                auto_disable_on_failure: true,
            },
            FlagConfig {
                name: "redemptions".into(),
                description: String::new(),
                dependencies: vec![],
                auto_disable_on_failure: true,
            },
        ];

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("rpc.endpoints")));
        assert!(errors.iter().any(|e| e.contains("max_retries")));
        assert!(errors.iter().any(|e| e.contains("duplicate feature flag")));
    }

    #[test]
    fn test_validate_accepts_minimal_config() {
        let mut config = AppConfig::default();
        config.rpc.endpoints.push(RpcEndpointConfig {
            url: "https://rpc.example.org".into(),
            priority: 1,
            weight: None,
            max_retries: None,
        });
        assert!(config.validate().is_ok());
    }
}
