//! Withdrawal (redemption) confirmation retry
//!
//! Redemptions whose backend confirmation leg failed are retried on a timer.
//! Each cycle checks the shared funding account once, tops it up when it runs
//! low (unless gas is sponsored), then retries every eligible record with a
//! per-record exponential backoff.
//!
//! Backoff bookkeeping (`retry_count`, `last_retry_at`) only advances after an
//! attempt has actually failed. A crash while a record is `retrying` leaves its
//! counters untouched; startup recovery returns it to `retry_pending`.

use crate::config::WithdrawalRetryConfig;
use crate::coordination::{PeriodicTask, SingleFlight};
use crate::domain::{BackendStatus, Redemption, RedemptionUpdate};
use crate::error::{Result, SentinelError};
use crate::ports::{ChainClient, ConfirmationPort, RedemptionStore};
use crate::supervisor::ManagedService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, instrument, warn};

/// Native token has 18 decimals
const NATIVE_DECIMALS: u32 = 18;

/// Convert a wei amount into native token units
pub fn wei_to_native(wei: u128) -> Decimal {
    i128::try_from(wei)
        .ok()
        .and_then(|w| Decimal::try_from_i128_with_scale(w, NATIVE_DECIMALS).ok())
        .map(|d| d.normalize())
        .unwrap_or(Decimal::MAX)
}

#[derive(Debug, Clone)]
pub struct WithdrawalRetrySettings {
    pub interval: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub min_balance: Decimal,
    pub top_up_amount: Decimal,
    pub max_funding_attempts: u32,
}

impl Default for WithdrawalRetrySettings {
    fn default() -> Self {
        Self::from(&WithdrawalRetryConfig::default())
    }
}

impl From<&WithdrawalRetryConfig> for WithdrawalRetrySettings {
    fn from(config: &WithdrawalRetryConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            max_retries: config.max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            min_balance: config.min_balance,
            top_up_amount: config.top_up_amount,
            max_funding_attempts: config.max_funding_attempts,
        }
    }
}

impl WithdrawalRetrySettings {
    /// `retry_backoff * 2^retry_count`
    pub fn required_wait(&self, retry_count: u32) -> Duration {
        let base_ms = self.retry_backoff.as_millis() as u64;
        Duration::from_millis(base_ms.saturating_mul(2u64.saturating_pow(retry_count)))
    }
}

/// Result of one confirmation attempt on one record
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RetryOutcome {
    /// Confirmation submitted; the counterpart marks the record completed
    Confirmed,
    /// Attempt failed, backoff advanced
    Failed { reason: String },
    /// Retry budget spent, record abandoned
    Abandoned,
    /// Backoff window not elapsed yet
    BackoffPending { remaining_ms: u64 },
    /// Payout hash or request id missing
    MissingData,
    /// Record changed status before the attempt could claim it
    Skipped,
}

/// How the funding account check ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FundingStatus {
    Funded,
    Sponsored,
    ToppedUp,
}

/// Summary of one retry cycle
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleSummary {
    pub candidates: u32,
    pub attempted: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub skipped: u32,
    pub abandoned: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryStats {
    pub cycles: u64,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
    pub abandoned: u64,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub last_balance_wei: Option<u128>,
}

struct RetryInner {
    settings: WithdrawalRetrySettings,
    store: Arc<dyn RedemptionStore>,
    chain: Arc<dyn ChainClient>,
    confirmation: Arc<dyn ConfirmationPort>,
    flight: SingleFlight,
    stats: RwLock<RetryStats>,
    task: Mutex<Option<PeriodicTask>>,
}

#[derive(Clone)]
pub struct WithdrawalRetryService {
    inner: Arc<RetryInner>,
}

impl WithdrawalRetryService {
    pub fn new(
        settings: WithdrawalRetrySettings,
        store: Arc<dyn RedemptionStore>,
        chain: Arc<dyn ChainClient>,
        confirmation: Arc<dyn ConfirmationPort>,
    ) -> Self {
        Self {
            inner: Arc::new(RetryInner {
                settings,
                store,
                chain,
                confirmation,
                flight: SingleFlight::new(),
                stats: RwLock::new(RetryStats::default()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn settings(&self) -> &WithdrawalRetrySettings {
        &self.inner.settings
    }

    pub fn is_processing(&self) -> bool {
        self.inner.flight.is_running()
    }

    pub async fn stats(&self) -> RetryStats {
        self.inner.stats.read().await.clone()
    }

    /// Run one retry cycle. `None` when a cycle is already in progress.
    pub async fn process_retry_queue(&self) -> Option<CycleSummary> {
        self.inner.process_retry_queue().await
    }

    /// Attempt one record under the automatic rules (backoff enforced)
    pub async fn retry_redemption_confirmation(&self, redemption: &Redemption) -> Result<RetryOutcome> {
        self.inner
            .retry_redemption_confirmation(redemption, Utc::now(), false)
            .await
    }

    /// Operator-triggered retry of one record.
    ///
    /// Skips the backoff wait. Remediation is limited by the record's own
    /// `funding_attempts` ceiling. Every failure is returned to the caller.
    #[instrument(skip(self))]
    pub async fn retry_redemption(&self, id: &str) -> Result<RetryOutcome> {
        self.inner.retry_redemption(id).await
    }

    /// Return records stuck in `retrying` to `retry_pending`
    pub async fn recover_interrupted(&self) -> Result<usize> {
        self.inner.recover_interrupted().await
    }
}

impl RetryInner {
    async fn process_retry_queue(&self) -> Option<CycleSummary> {
        let Some(_guard) = self.flight.try_acquire() else {
            debug!("Retry cycle already running, skipping");
            return None;
        };

        let mut summary = CycleSummary::default();
        let candidates = match self.store.get_redemptions_needing_retry().await {
            Ok(records) => records,
            Err(e) => {
                warn!("Failed to load redemptions needing retry: {}", e);
                summary.aborted = Some(format!("load failed: {}", e));
                self.record_cycle(&summary).await;
                return Some(summary);
            }
        };

        summary.candidates = candidates.len() as u32;
        if candidates.is_empty() {
            debug!("No redemptions need retry");
            self.record_cycle(&summary).await;
            return Some(summary);
        }

        info!("Retry cycle: {} redemptions need retry", candidates.len());

        // one balance check per cycle, before any record is touched
        if let Err(e) = self.ensure_funded().await {
            error!(
                "Retry cycle aborted, {} redemptions stay queued: {}",
                candidates.len(),
                e
            );
            summary.aborted = Some(e.to_string());
            self.record_cycle(&summary).await;
            return Some(summary);
        }

        let now = Utc::now();
        for redemption in &candidates {
            match self.retry_redemption_confirmation(redemption, now, false).await {
                Ok(RetryOutcome::Confirmed) => {
                    summary.attempted += 1;
                    summary.succeeded += 1;
                }
                Ok(RetryOutcome::Failed { .. }) => {
                    summary.attempted += 1;
                    summary.failed += 1;
                }
                Ok(RetryOutcome::Abandoned) => summary.abandoned += 1,
                Ok(_) => summary.skipped += 1,
                Err(e) => {
                    warn!("Retry of redemption {} errored: {}", redemption.id, e);
                    summary.failed += 1;
                }
            }
        }

        info!(
            "Retry cycle done: {} succeeded, {} failed, {} skipped, {} abandoned",
            summary.succeeded, summary.failed, summary.skipped, summary.abandoned
        );
        self.record_cycle(&summary).await;
        Some(summary)
    }

    async fn record_cycle(&self, summary: &CycleSummary) {
        let mut stats = self.stats.write().await;
        stats.cycles += 1;
        stats.attempted += summary.attempted as u64;
        stats.succeeded += summary.succeeded as u64;
        stats.failed += summary.failed as u64;
        stats.skipped += summary.skipped as u64;
        stats.abandoned += summary.abandoned as u64;
        stats.last_cycle_at = Some(Utc::now());
    }

    async fn balance(&self) -> Result<Decimal> {
        let wei = self.chain.get_smart_account_balance().await?;
        self.stats.write().await.last_balance_wei = Some(wei);
        Ok(wei_to_native(wei))
    }

    /// Make sure the funding account can pay gas, topping it up once if needed
    async fn ensure_funded(&self) -> Result<FundingStatus> {
        let balance = self.balance().await?;
        if balance >= self.settings.min_balance {
            return Ok(FundingStatus::Funded);
        }

        if self.chain.is_paymaster_enabled().await? {
            info!(
                "Funding balance {} below {}, gas is sponsored, skipping top-up",
                balance, self.settings.min_balance
            );
            return Ok(FundingStatus::Sponsored);
        }

        self.top_up(balance).await
    }

    async fn top_up(&self, balance: Decimal) -> Result<FundingStatus> {
        warn!(
            "Funding balance {} below {}, topping up {}",
            balance, self.settings.min_balance, self.settings.top_up_amount
        );
        let tx_hash = self
            .chain
            .prefund_smart_account(&self.settings.top_up_amount.to_string())
            .await
            .map_err(|e| SentinelError::Remediation(e.to_string()))?;
        info!("Top-up submitted: {}", tx_hash);

        let after = self.balance().await?;
        if after < self.settings.min_balance {
            return Err(SentinelError::InsufficientBalance {
                balance: after,
                required: self.settings.min_balance,
            });
        }
        Ok(FundingStatus::ToppedUp)
    }

    #[instrument(skip(self, redemption, now), fields(id = %redemption.id, retry_count = redemption.retry_count))]
    async fn retry_redemption_confirmation(
        &self,
        redemption: &Redemption,
        now: DateTime<Utc>,
        ignore_backoff: bool,
    ) -> Result<RetryOutcome> {
        if redemption.retry_count >= self.settings.max_retries {
            let update = RedemptionUpdate::status(BackendStatus::Abandoned)
                .when(redemption.backend_status)
                .error(format!(
                    "Max retries ({}) exceeded, manual intervention required",
                    self.settings.max_retries
                ));
            if self.store.update_redemption(&redemption.id, &update).await? {
                error!(
                    "Redemption {} abandoned after {} retries",
                    redemption.id, redemption.retry_count
                );
            }
            return Ok(RetryOutcome::Abandoned);
        }

        if !ignore_backoff {
            if let Some(last) = redemption.last_retry_at {
                let required = self.settings.required_wait(redemption.retry_count);
                let elapsed = (now - last).to_std().unwrap_or(Duration::ZERO);
                if elapsed < required {
                    let remaining_ms = (required - elapsed).as_millis() as u64;
                    debug!(
                        "Redemption {} in backoff for another {}ms",
                        redemption.id, remaining_ms
                    );
                    return Ok(RetryOutcome::BackoffPending { remaining_ms });
                }
            }
        }

        let Some(payout_tx_hash) = redemption.confirmation_payout() else {
            warn!(
                "Redemption {} is missing payout hash or request id, not retrying",
                redemption.id
            );
            return Ok(RetryOutcome::MissingData);
        };

        let claim = RedemptionUpdate::status(BackendStatus::Retrying).when(redemption.backend_status);
        if !self.store.update_redemption(&redemption.id, &claim).await? {
            debug!("Redemption {} changed status, skipping", redemption.id);
            return Ok(RetryOutcome::Skipped);
        }

        match self
            .confirmation
            .execute_confirmation_payment(&redemption.id, payout_tx_hash)
            .await
        {
            Ok(()) => {
                info!("Redemption {} confirmation succeeded", redemption.id);
                Ok(RetryOutcome::Confirmed)
            }
            Err(e) => {
                let reason = e.to_string();
                let update = RedemptionUpdate {
                    expected_backend_status: Some(BackendStatus::Retrying),
                    backend_status: Some(BackendStatus::RetryPending),
                    retry_count: Some(redemption.retry_count + 1),
                    last_retry_at: Some(Utc::now()),
                    last_error: Some(reason.clone()),
                    funding_attempts: None,
                };
                self.store.update_redemption(&redemption.id, &update).await?;
                warn!(
                    "Redemption {} confirmation failed (attempt {}): {}",
                    redemption.id,
                    redemption.retry_count + 1,
                    reason
                );
                Ok(RetryOutcome::Failed { reason })
            }
        }
    }

    async fn retry_redemption(&self, id: &str) -> Result<RetryOutcome> {
        let redemption = self
            .store
            .get_redemption_by_id(id)
            .await?
            .ok_or_else(|| SentinelError::RecordNotFound(format!("redemption {}", id)))?;

        if redemption.backend_status == BackendStatus::Completed {
            return Err(SentinelError::Validation(format!(
                "redemption {} is already completed",
                id
            )));
        }
        if redemption.retry_count >= self.settings.max_retries {
            return Err(SentinelError::MaxRetriesExceeded {
                id: id.to_string(),
                retry_count: redemption.retry_count,
                max: self.settings.max_retries,
            });
        }
        if !redemption.backend_status.needs_retry() {
            return Err(SentinelError::Validation(format!(
                "redemption {} is {}, not retryable",
                id, redemption.backend_status
            )));
        }
        if redemption.confirmation_payout().is_none() {
            return Err(SentinelError::Validation(format!(
                "redemption {} is missing payout hash or request id",
                id
            )));
        }

        let balance = self.balance().await?;
        if balance < self.settings.min_balance && !self.chain.is_paymaster_enabled().await? {
            if redemption.funding_attempts >= self.settings.max_funding_attempts {
                return Err(SentinelError::MaxFundingAttemptsExceeded {
                    id: id.to_string(),
                    attempts: redemption.funding_attempts,
                    max: self.settings.max_funding_attempts,
                });
            }

            let counted = RedemptionUpdate {
                funding_attempts: Some(redemption.funding_attempts + 1),
                ..Default::default()
            };
            self.store.update_redemption(id, &counted).await?;
            self.top_up(balance).await?;
        }

        match self
            .retry_redemption_confirmation(&redemption, Utc::now(), true)
            .await?
        {
            RetryOutcome::Failed { reason } => Err(SentinelError::ConfirmationFailed {
                id: id.to_string(),
                reason,
            }),
            RetryOutcome::Skipped => Err(SentinelError::Validation(format!(
                "redemption {} changed status during retry",
                id
            ))),
            outcome => Ok(outcome),
        }
    }

    async fn recover_interrupted(&self) -> Result<usize> {
        let stuck = self
            .store
            .get_redemptions_by_backend_status(BackendStatus::Retrying)
            .await?;

        let mut recovered = 0;
        for redemption in stuck {
            let update = RedemptionUpdate::status(BackendStatus::RetryPending)
                .when(BackendStatus::Retrying)
                .error("Attempt interrupted by restart");
            if self.store.update_redemption(&redemption.id, &update).await? {
                recovered += 1;
            }
        }

        if recovered > 0 {
            warn!("Recovered {} interrupted redemption retries", recovered);
        }
        Ok(recovered)
    }
}

#[async_trait]
impl ManagedService for WithdrawalRetryService {
    async fn start(&self) -> Result<()> {
        if let Err(e) = self.recover_interrupted().await {
            warn!("Startup recovery of interrupted retries failed: {}", e);
        }

        let mut slot = self.inner.task.lock().await;
        if slot.is_none() {
            let weak = Arc::downgrade(&self.inner);
            *slot = Some(PeriodicTask::spawn(
                "withdrawal-retry",
                self.inner.settings.interval,
                false,
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.process_retry_queue().await;
                        }
                    }
                    .boxed()
                },
            ));
            info!(
                "Withdrawal retry cycle every {}s",
                self.inner.settings.interval.as_secs()
            );
        }
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(task) = self.inner.task.lock().await.take() {
            task.shutdown().await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::{MockChainClient, MockConfirmationPort, MockRedemptionStore};
    use rust_decimal_macros::dec;

    const ONE_ETH: u128 = 1_000_000_000_000_000_000;

    fn record(id: &str, retry_count: u32, last_retry_secs_ago: Option<i64>) -> Redemption {
        let mut r = Redemption::new(id, BackendStatus::RetryPending).with_payout("PAYOUT", "req-1");
        r.retry_count = retry_count;
        r.last_retry_at = last_retry_secs_ago.map(|s| Utc::now() - chrono::Duration::seconds(s));
        r
    }

    fn funded_chain() -> MockChainClient {
        let mut chain = MockChainClient::new();
        chain
            .expect_get_smart_account_balance()
            .returning(|| Ok(ONE_ETH));
        chain
    }

    fn service(
        store: MockRedemptionStore,
        chain: MockChainClient,
        confirmation: MockConfirmationPort,
    ) -> WithdrawalRetryService {
        WithdrawalRetryService::new(
            WithdrawalRetrySettings::default(),
            Arc::new(store),
            Arc::new(chain),
            Arc::new(confirmation),
        )
    }

    #[test]
    fn test_wei_conversion() {
        assert_eq!(wei_to_native(ONE_ETH), dec!(1));
        assert_eq!(wei_to_native(ONE_ETH / 20), dec!(0.05));
        assert_eq!(wei_to_native(0), dec!(0));
    }

    #[test]
    fn test_required_wait_doubles() {
        let settings = WithdrawalRetrySettings::default();
        assert_eq!(settings.required_wait(0), Duration::from_secs(60));
        assert_eq!(settings.required_wait(2), Duration::from_secs(240));
        let waits: Vec<_> = (0..12).map(|k| settings.required_wait(k)).collect();
        assert!(waits.windows(2).all(|w| w[0] <= w[1]));
    }

    #[tokio::test]
    async fn test_backoff_window_skips_without_mutation() {
        // retry_count 2, last attempt 90s ago: needs 240s
        let svc = service(
            MockRedemptionStore::new(),
            MockChainClient::new(),
            MockConfirmationPort::new(),
        );
        let outcome = svc
            .retry_redemption_confirmation(&record("r1", 2, Some(90)))
            .await
            .unwrap();
        match outcome {
            RetryOutcome::BackoffPending { remaining_ms } => {
                assert!(remaining_ms > 149_000 && remaining_ms <= 150_000)
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_payout_skips_without_mutation() {
        let svc = service(
            MockRedemptionStore::new(),
            MockChainClient::new(),
            MockConfirmationPort::new(),
        );
        let r = Redemption::new("r1", BackendStatus::ManualReview);
        assert_eq!(
            svc.retry_redemption_confirmation(&r).await.unwrap(),
            RetryOutcome::MissingData
        );
    }

    #[tokio::test]
    async fn test_abandon_at_retry_ceiling() {
        let mut store = MockRedemptionStore::new();
        store
            .expect_update_redemption()
            .withf(|id, u| id == "r1" && u.backend_status == Some(BackendStatus::Abandoned))
            .times(1)
            .returning(|_, _| Ok(true));
        let svc = service(store, MockChainClient::new(), MockConfirmationPort::new());

        let outcome = svc
            .retry_redemption_confirmation(&record("r1", 10, None))
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Abandoned);
    }

    #[tokio::test]
    async fn test_failure_advances_backoff_after_attempt() {
        let mut store = MockRedemptionStore::new();
        let mut seq = mockall::Sequence::new();
        store
            .expect_update_redemption()
            .withf(|_, u| {
                u.backend_status == Some(BackendStatus::Retrying)
                    && u.retry_count.is_none()
                    && u.last_retry_at.is_none()
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));
        store
            .expect_update_redemption()
            .withf(|_, u| {
                u.backend_status == Some(BackendStatus::RetryPending)
                    && u.retry_count == Some(4)
                    && u.last_retry_at.is_some()
                    && u.last_error.as_deref() == Some("Internal error: bridge rejected")
            })
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(true));

        let mut confirmation = MockConfirmationPort::new();
        confirmation
            .expect_execute_confirmation_payment()
            .withf(|id, hash| id == "r1" && hash == "PAYOUT")
            .times(1)
            .returning(|_, _| Err(SentinelError::Internal("bridge rejected".into())));

        let svc = service(store, MockChainClient::new(), confirmation);
        // 3 retries, last one 10 minutes ago: needs 8 minutes
        let outcome = svc
            .retry_redemption_confirmation(&record("r1", 3, Some(600)))
            .await
            .unwrap();
        assert!(matches!(outcome, RetryOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn test_success_leaves_completion_to_counterpart() {
        let mut store = MockRedemptionStore::new();
        store
            .expect_update_redemption()
            .times(1)
            .returning(|_, _| Ok(true));
        let mut confirmation = MockConfirmationPort::new();
        confirmation
            .expect_execute_confirmation_payment()
            .times(1)
            .returning(|_, _| Ok(()));

        let svc = service(store, MockChainClient::new(), confirmation);
        let outcome = svc
            .retry_redemption_confirmation(&record("r1", 0, None))
            .await
            .unwrap();
        assert_eq!(outcome, RetryOutcome::Confirmed);
    }

    #[tokio::test]
    async fn test_cycle_aborts_when_top_up_insufficient() {
        let mut store = MockRedemptionStore::new();
        store
            .expect_get_redemptions_needing_retry()
            .returning(|| Ok(vec![record("r1", 0, None), record("r2", 1, None)]));

        let mut chain = MockChainClient::new();
        chain
            .expect_get_smart_account_balance()
            .times(2)
            .returning(|| Ok(ONE_ETH / 100));
        chain.expect_is_paymaster_enabled().returning(|| Ok(false));
        chain
            .expect_prefund_smart_account()
            .withf(|amount| amount == "0.5")
            .times(1)
            .returning(|_| Ok("0xtx".into()));

        let svc = service(store, chain, MockConfirmationPort::new());
        let summary = svc.process_retry_queue().await.unwrap();
        assert_eq!(summary.candidates, 2);
        assert_eq!(summary.attempted, 0);
        assert!(summary.aborted.unwrap().contains("Insufficient balance"));
        assert_eq!(svc.stats().await.last_balance_wei, Some(ONE_ETH / 100));
    }

    #[tokio::test]
    async fn test_paymaster_skips_top_up() {
        let mut store = MockRedemptionStore::new();
        store
            .expect_get_redemptions_needing_retry()
            .returning(|| Ok(vec![record("r1", 0, None)]));
        store
            .expect_update_redemption()
            .returning(|_, _| Ok(true));

        let mut chain = MockChainClient::new();
        chain.expect_get_smart_account_balance().returning(|| Ok(0));
        chain.expect_is_paymaster_enabled().returning(|| Ok(true));

        let mut confirmation = MockConfirmationPort::new();
        confirmation
            .expect_execute_confirmation_payment()
            .times(1)
            .returning(|_, _| Ok(()));

        let svc = service(store, chain, confirmation);
        let summary = svc.process_retry_queue().await.unwrap();
        assert_eq!(summary.succeeded, 1);
        assert!(summary.aborted.is_none());
    }

    #[tokio::test]
    async fn test_empty_queue_skips_balance_check() {
        let mut store = MockRedemptionStore::new();
        store
            .expect_get_redemptions_needing_retry()
            .returning(|| Ok(vec![]));
        let svc = service(store, MockChainClient::new(), MockConfirmationPort::new());
        let summary = svc.process_retry_queue().await.unwrap();
        assert_eq!(summary.candidates, 0);
        assert_eq!(svc.stats().await.cycles, 1);
    }

    #[tokio::test]
    async fn test_manual_retry_respects_funding_ceiling() {
        let mut store = MockRedemptionStore::new();
        store.expect_get_redemption_by_id().returning(|id| {
            let mut r = record(id, 1, Some(5));
            r.funding_attempts = 3;
            Ok(Some(r))
        });
        let mut chain = MockChainClient::new();
        chain.expect_get_smart_account_balance().returning(|| Ok(0));
        chain.expect_is_paymaster_enabled().returning(|| Ok(false));

        let svc = service(store, chain, MockConfirmationPort::new());
        let err = svc.retry_redemption("r1").await.unwrap_err();
        assert!(matches!(
            err,
            SentinelError::MaxFundingAttemptsExceeded { attempts: 3, max: 3, .. }
        ));
    }

    #[tokio::test]
    async fn test_manual_retry_bypasses_backoff_and_propagates_failure() {
        let mut store = MockRedemptionStore::new();
        store
            .expect_get_redemption_by_id()
            .returning(|id| Ok(Some(record(id, 1, Some(5)))));
        store
            .expect_update_redemption()
            .times(2)
            .returning(|_, _| Ok(true));
        let mut confirmation = MockConfirmationPort::new();
        confirmation
            .expect_execute_confirmation_payment()
            .returning(|_, _| Err(SentinelError::Internal("still failing".into())));

        let svc = service(store, funded_chain(), confirmation);
        let err = svc.retry_redemption("r1").await.unwrap_err();
        assert!(matches!(err, SentinelError::ConfirmationFailed { .. }));
    }

    #[tokio::test]
    async fn test_manual_retry_unknown_record() {
        let mut store = MockRedemptionStore::new();
        store.expect_get_redemption_by_id().returning(|_| Ok(None));
        let svc = service(store, MockChainClient::new(), MockConfirmationPort::new());
        assert!(matches!(
            svc.retry_redemption("nope").await,
            Err(SentinelError::RecordNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_recover_interrupted_keeps_counters() {
        let mut store = MockRedemptionStore::new();
        store
            .expect_get_redemptions_by_backend_status()
            .withf(|s| *s == BackendStatus::Retrying)
            .returning(|_| {
                let mut r = record("r1", 4, Some(30));
                r.backend_status = BackendStatus::Retrying;
                Ok(vec![r])
            });
        store
            .expect_update_redemption()
            .withf(|_, u| {
                u.backend_status == Some(BackendStatus::RetryPending)
                    && u.expected_backend_status == Some(BackendStatus::Retrying)
                    && u.retry_count.is_none()
                    && u.last_retry_at.is_none()
            })
            .times(1)
            .returning(|_, _| Ok(true));

        let svc = service(store, MockChainClient::new(), MockConfirmationPort::new());
        assert_eq!(svc.recover_interrupted().await.unwrap(), 1);
    }
}
