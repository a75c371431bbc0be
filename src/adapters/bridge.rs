use crate::config::BridgeConfig;
use crate::coordination::CircuitBreaker;
use crate::error::{Result, SentinelError};
use crate::ports::ConfirmationPort;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument};

/// Breaker name registered with the supervisor for confirmation calls
pub const CONFIRMATION_BREAKER: &str = "bridge-confirmation";

#[derive(Debug, Serialize)]
struct ConfirmationRequest<'a> {
    redemption_id: &'a str,
    payout_tx_hash: &'a str,
}

/// Submits confirmation payments to the bridge counterpart service.
///
/// The counterpart marks the redemption `completed` when it accepts the
/// payment; any non-2xx answer is a failed attempt.
pub struct HttpConfirmationClient {
    client: reqwest::Client,
    url: String,
    breaker: Arc<CircuitBreaker>,
}

impl HttpConfirmationClient {
    pub fn new(config: &BridgeConfig, breaker: Arc<CircuitBreaker>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .build()?;
        Ok(Self {
            client,
            url: config.confirmation_url.clone(),
            breaker,
        })
    }

    async fn post(&self, request: &ConfirmationRequest<'_>) -> Result<()> {
        let resp = self.client.post(&self.url).json(request).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        Err(SentinelError::ComponentFailure {
            component: CONFIRMATION_BREAKER.to_string(),
            reason: format!("HTTP {}: {}", status, body),
        })
    }
}

#[async_trait]
impl ConfirmationPort for HttpConfirmationClient {
    #[instrument(skip(self))]
    async fn execute_confirmation_payment(
        &self,
        redemption_id: &str,
        payout_tx_hash: &str,
    ) -> Result<()> {
        let request = ConfirmationRequest {
            redemption_id,
            payout_tx_hash,
        };
        self.breaker.call(|| self.post(&request)).await?;
        debug!("Confirmation accepted for {}", redemption_id);
        Ok(())
    }
}
