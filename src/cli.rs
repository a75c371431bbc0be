use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::app::AppContext;
use crate::config::AppConfig;
use crate::coordination::install_signal_handlers;
use crate::error::{Result, SentinelError};
use crate::rpc::{HttpRpcTransport, ResilientRpcAdapter};

#[derive(Parser)]
#[command(name = "sentinel")]
#[command(version)]
#[command(about = "Control plane for blockchain-backed redemption services", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Config directory (default.toml plus $SENTINEL_ENV.toml)
    #[arg(short, long, default_value = "config", env = "SENTINEL_CONFIG_DIR")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the control plane until a termination signal arrives
    Run,
    /// Retry the backend confirmation of one redemption
    Retry {
        /// Redemption id
        id: String,
    },
    /// Probe every RPC endpoint once and print their health
    RpcHealth,
    /// Print the configured services and feature flags
    Status,
}

pub fn load_config(dir: &str) -> Result<AppConfig> {
    let config = AppConfig::load_from(dir)?;
    if let Err(errors) = config.validate() {
        for e in &errors {
            error!("Invalid configuration: {}", e);
        }
        return Err(SentinelError::Validation(errors.join("; ")));
    }
    Ok(config)
}

pub async fn run(config: AppConfig) -> Result<()> {
    info!("Starting chain sentinel");
    let ctx = AppContext::init(config).await?;
    install_signal_handlers(ctx.graceful.clone());

    ctx.start().await?;

    let signal = ctx.graceful.wait_for_signal().await;
    info!("Shutting down ({})", signal);
    if !ctx.shutdown(signal).await {
        return Err(SentinelError::ComponentFailure {
            component: "shutdown".to_string(),
            reason: "services did not stop in time".to_string(),
        });
    }
    Ok(())
}

pub async fn retry(config: AppConfig, id: &str) -> Result<()> {
    let ctx = AppContext::init(config).await?;
    let outcome = ctx.withdrawal_retry.retry_redemption(id).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

pub async fn rpc_health(config: &AppConfig) -> Result<()> {
    let transport = HttpRpcTransport::new(Duration::from_millis(config.rpc.timeout_ms))?;
    let adapter = ResilientRpcAdapter::from_config(&config.rpc, Arc::new(transport))?;
    adapter.check_health().await;

    let report = json!({
        "best_endpoint": adapter.get_best_endpoint().await,
        "endpoints": adapter.get_health_status().await,
    });
    println!("{}", serde_json::to_string_pretty(&report)?);

    if adapter.has_healthy_endpoint().await {
        Ok(())
    } else {
        Err(SentinelError::ComponentFailure {
            component: "rpc".to_string(),
            reason: "no healthy endpoint".to_string(),
        })
    }
}

pub fn status(config: &AppConfig) -> Result<()> {
    let flags: Vec<_> = config
        .feature_flags
        .flags
        .iter()
        .map(|f| {
            json!({
                "name": f.name,
                "description": f.description,
                "dependencies": f.dependencies,
                "auto_disable_on_failure": f.auto_disable_on_failure,
            })
        })
        .collect();
    let endpoints: Vec<_> = config
        .rpc
        .endpoints
        .iter()
        .map(|e| json!({ "url": e.url, "priority": e.priority }))
        .collect();

    let layout = json!({
        "critical_services": config.readiness.critical_services,
        "database": config.database.is_some(),
        "rpc_endpoints": endpoints,
        "feature_flags": flags,
        "reconciliation_interval_secs": config.reconciliation.interval_secs,
        "withdrawal_retry_interval_secs": config.withdrawal_retry.interval_secs,
        "paymaster_enabled": config.chain.paymaster_enabled,
    });
    println!("{}", serde_json::to_string_pretty(&layout)?);
    Ok(())
}
