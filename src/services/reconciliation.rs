//! Reconciliation sweep
//!
//! Periodically compares stored records against their expected progress and
//! corrects drift. Four independent checks run per sweep: stale bridge
//! transfers, stuck withdrawals, a position audit, and cleanup of old failed
//! records. A failing check is reported in its own result and does not stop
//! the others.

use crate::config::ReconciliationConfig;
use crate::coordination::{PeriodicTask, SingleFlight};
use crate::domain::{BridgeTransfer, Position, RecordKind};
use crate::error::Result;
use crate::ports::ReconciliationStore;
use crate::supervisor::ManagedService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconciliationKind {
    BridgeTransactions,
    Withdrawals,
    Positions,
    Cleanup,
}

impl std::fmt::Display for ReconciliationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconciliationKind::BridgeTransactions => write!(f, "bridge_transactions"),
            ReconciliationKind::Withdrawals => write!(f, "withdrawals"),
            ReconciliationKind::Positions => write!(f, "positions"),
            ReconciliationKind::Cleanup => write!(f, "cleanup"),
        }
    }
}

/// Outcome of one check within a sweep
#[derive(Debug, Clone, Serialize)]
pub struct ReconciliationResult {
    pub kind: ReconciliationKind,
    pub checked: u32,
    pub reconciled: u32,
    pub failed: u32,
    pub details: Vec<String>,
}

impl ReconciliationResult {
    fn new(kind: ReconciliationKind) -> Self {
        Self {
            kind,
            checked: 0,
            reconciled: 0,
            failed: 0,
            details: Vec::new(),
        }
    }

    fn errored(kind: ReconciliationKind, error: &str) -> Self {
        let mut result = Self::new(kind);
        result.failed = 1;
        result.details.push(format!("check failed: {}", error));
        result
    }
}

// ==================== Extension points ====================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeDecision {
    Retry,
    Fail(String),
}

/// Decides what to do with a stale bridge transfer
pub trait BridgeRetryPolicy: Send + Sync {
    fn decide(&self, transfer: &BridgeTransfer) -> BridgeDecision;
}

/// Retry every stale transfer
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRetry;

impl BridgeRetryPolicy for AlwaysRetry {
    fn decide(&self, _transfer: &BridgeTransfer) -> BridgeDecision {
        BridgeDecision::Retry
    }
}

/// Retry until a transfer has been marked `max_attempts` times, then fail it
#[derive(Debug, Clone, Copy)]
pub struct MaxAttemptsPolicy {
    pub max_attempts: u32,
}

impl BridgeRetryPolicy for MaxAttemptsPolicy {
    fn decide(&self, transfer: &BridgeTransfer) -> BridgeDecision {
        if transfer.reconciliation_attempts >= self.max_attempts {
            BridgeDecision::Fail(format!(
                "gave up after {} reconciliation attempts",
                transfer.reconciliation_attempts
            ))
        } else {
            BridgeDecision::Retry
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuditOutcome {
    Verified,
    Flagged(String),
}

/// Verifies an active position against external ground truth
#[async_trait]
pub trait PositionAuditor: Send + Sync {
    async fn audit(&self, position: &Position) -> Result<AuditOutcome>;
}

/// Flags positions that have not been verified within `max_unverified_age`
#[derive(Debug, Clone)]
pub struct AgeAuditor {
    pub max_unverified_age: Duration,
}

#[async_trait]
impl PositionAuditor for AgeAuditor {
    async fn audit(&self, position: &Position) -> Result<AuditOutcome> {
        let limit = Utc::now() - to_chrono(self.max_unverified_age);
        let reference = position.last_verified_at.unwrap_or(position.opened_at);
        if reference < limit {
            let hours = (Utc::now() - reference).num_hours();
            Ok(AuditOutcome::Flagged(format!(
                "position {} unverified for {}h",
                position.id, hours
            )))
        } else {
            Ok(AuditOutcome::Verified)
        }
    }
}

// ==================== Service ====================

#[derive(Debug, Clone)]
pub struct ReconciliationSettings {
    pub interval: Duration,
    pub stale_threshold: Duration,
    pub position_audit_age: Duration,
    pub cleanup_retention: Duration,
    pub batch_size: u32,
}

impl Default for ReconciliationSettings {
    fn default() -> Self {
        Self::from(&ReconciliationConfig::default())
    }
}

impl From<&ReconciliationConfig> for ReconciliationSettings {
    fn from(config: &ReconciliationConfig) -> Self {
        Self {
            interval: Duration::from_secs(config.interval_secs),
            stale_threshold: Duration::from_secs(config.stale_threshold_secs),
            position_audit_age: Duration::from_secs(config.position_audit_age_secs),
            cleanup_retention: Duration::from_secs(config.cleanup_retention_days as u64 * 86_400),
            batch_size: config.batch_size,
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::milliseconds(d.as_millis().min(i64::MAX as u128) as i64)
}

struct ReconInner {
    settings: ReconciliationSettings,
    store: Arc<dyn ReconciliationStore>,
    bridge_policy: Arc<dyn BridgeRetryPolicy>,
    auditor: Arc<dyn PositionAuditor>,
    flight: SingleFlight,
    last_results: RwLock<Vec<ReconciliationResult>>,
    task: Mutex<Option<PeriodicTask>>,
}

#[derive(Clone)]
pub struct ReconciliationService {
    inner: Arc<ReconInner>,
}

impl ReconciliationService {
    pub fn new(settings: ReconciliationSettings, store: Arc<dyn ReconciliationStore>) -> Self {
        let auditor = AgeAuditor {
            max_unverified_age: settings.position_audit_age,
        };
        Self::with_extensions(settings, store, Arc::new(AlwaysRetry), Arc::new(auditor))
    }

    pub fn with_extensions(
        settings: ReconciliationSettings,
        store: Arc<dyn ReconciliationStore>,
        bridge_policy: Arc<dyn BridgeRetryPolicy>,
        auditor: Arc<dyn PositionAuditor>,
    ) -> Self {
        Self {
            inner: Arc::new(ReconInner {
                settings,
                store,
                bridge_policy,
                auditor,
                flight: SingleFlight::new(),
                last_results: RwLock::new(Vec::new()),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.flight.is_running()
    }

    /// Run every check once. `None` when a sweep is already in progress.
    pub async fn run_all_reconciliations(&self) -> Option<Vec<ReconciliationResult>> {
        self.inner.run_all().await
    }

    pub async fn last_results(&self) -> Vec<ReconciliationResult> {
        self.inner.last_results.read().await.clone()
    }

    pub async fn reconcile_bridge_transactions(&self) -> Result<ReconciliationResult> {
        self.inner.reconcile_bridge_transactions(Utc::now()).await
    }

    pub async fn reconcile_withdrawals(&self) -> Result<ReconciliationResult> {
        self.inner.reconcile_withdrawals(Utc::now()).await
    }

    pub async fn reconcile_positions(&self) -> Result<ReconciliationResult> {
        self.inner.reconcile_positions(Utc::now()).await
    }

    pub async fn cleanup_old_records(&self) -> Result<ReconciliationResult> {
        self.inner.cleanup_old_records(Utc::now()).await
    }
}

impl ReconInner {
    async fn run_all(&self) -> Option<Vec<ReconciliationResult>> {
        let Some(_guard) = self.flight.try_acquire() else {
            debug!("Reconciliation already running, skipping");
            return None;
        };

        let run_id = Uuid::new_v4();
        let span = info_span!("reconciliation", run_id = %run_id);
        let results = async {
            let now = Utc::now();
            let started = std::time::Instant::now();

            let results = vec![
                settle(
                    ReconciliationKind::BridgeTransactions,
                    self.reconcile_bridge_transactions(now).await,
                ),
                settle(ReconciliationKind::Withdrawals, self.reconcile_withdrawals(now).await),
                settle(ReconciliationKind::Positions, self.reconcile_positions(now).await),
                settle(ReconciliationKind::Cleanup, self.cleanup_old_records(now).await),
            ];

            let reconciled: u32 = results.iter().map(|r| r.reconciled).sum();
            let failed: u32 = results.iter().map(|r| r.failed).sum();
            info!(
                "Reconciliation finished in {}ms: {} reconciled, {} failed",
                started.elapsed().as_millis(),
                reconciled,
                failed
            );
            results
        }
        .instrument(span)
        .await;

        *self.last_results.write().await = results.clone();
        Some(results)
    }

    async fn reconcile_bridge_transactions(&self, now: DateTime<Utc>) -> Result<ReconciliationResult> {
        let mut result = ReconciliationResult::new(ReconciliationKind::BridgeTransactions);
        let stale_before = now - to_chrono(self.settings.stale_threshold);
        let transfers = self
            .store
            .find_stale_bridge_transfers(stale_before, self.settings.batch_size)
            .await?;

        for transfer in transfers {
            result.checked += 1;
            let outcome = match self.bridge_policy.decide(&transfer) {
                BridgeDecision::Retry => self
                    .store
                    .mark_bridge_transfer_for_retry(&transfer.id, stale_before, now)
                    .await
                    .map(|applied| (applied, "marked for retry".to_string())),
                BridgeDecision::Fail(reason) => self
                    .store
                    .fail_bridge_transfer(&transfer.id, &reason)
                    .await
                    .map(|applied| (applied, format!("failed: {}", reason))),
            };

            match outcome {
                Ok((true, action)) => {
                    result.reconciled += 1;
                    result
                        .details
                        .push(format!("bridge transfer {} {}", transfer.id, action));
                }
                Ok((false, _)) => {
                    debug!("Bridge transfer {} changed since it was read", transfer.id);
                }
                Err(e) => {
                    warn!("Failed to reconcile bridge transfer {}: {}", transfer.id, e);
                    result.failed += 1;
                    result
                        .details
                        .push(format!("bridge transfer {} error: {}", transfer.id, e));
                }
            }
        }

        Ok(result)
    }

    async fn reconcile_withdrawals(&self, now: DateTime<Utc>) -> Result<ReconciliationResult> {
        let mut result = ReconciliationResult::new(ReconciliationKind::Withdrawals);
        let stale_before = now - to_chrono(self.settings.stale_threshold);
        let withdrawals = self
            .store
            .find_stale_withdrawals(stale_before, self.settings.batch_size)
            .await?;

        for withdrawal in withdrawals {
            result.checked += 1;
            let age_secs = (now - withdrawal.created_at).num_seconds();
            let reason = format!(
                "stuck in {} for {}s, marked failed by reconciliation",
                withdrawal.status, age_secs
            );
            match self.store.fail_withdrawal(&withdrawal.id, &reason).await {
                Ok(true) => {
                    result.reconciled += 1;
                    result
                        .details
                        .push(format!("withdrawal {} {}", withdrawal.id, reason));
                }
                Ok(false) => debug!("Withdrawal {} changed since it was read", withdrawal.id),
                Err(e) => {
                    warn!("Failed to reconcile withdrawal {}: {}", withdrawal.id, e);
                    result.failed += 1;
                    result
                        .details
                        .push(format!("withdrawal {} error: {}", withdrawal.id, e));
                }
            }
        }

        Ok(result)
    }

    async fn reconcile_positions(&self, now: DateTime<Utc>) -> Result<ReconciliationResult> {
        let mut result = ReconciliationResult::new(ReconciliationKind::Positions);
        let opened_before = now - to_chrono(self.settings.position_audit_age);
        let positions = self
            .store
            .find_positions_for_audit(opened_before, self.settings.batch_size)
            .await?;

        for position in positions {
            result.checked += 1;
            match self.auditor.audit(&position).await {
                Ok(AuditOutcome::Verified) => result.reconciled += 1,
                Ok(AuditOutcome::Flagged(note)) => {
                    result.failed += 1;
                    result.details.push(note);
                }
                Err(e) => {
                    result.failed += 1;
                    result
                        .details
                        .push(format!("position {} audit error: {}", position.id, e));
                }
            }
        }

        Ok(result)
    }

    async fn cleanup_old_records(&self, now: DateTime<Utc>) -> Result<ReconciliationResult> {
        let mut result = ReconciliationResult::new(ReconciliationKind::Cleanup);
        let older_than = now - to_chrono(self.settings.cleanup_retention);

        for kind in [RecordKind::BridgeTransfer, RecordKind::Withdrawal] {
            match self.store.purge_failed_records(kind, older_than).await {
                Ok(0) => {}
                Ok(purged) => {
                    let purged = purged.min(u32::MAX as u64) as u32;
                    result.checked += purged;
                    result.reconciled += purged;
                    result
                        .details
                        .push(format!("purged {} failed {:?} records", purged, kind));
                }
                Err(e) => {
                    result.failed += 1;
                    result.details.push(format!("purge of {:?} failed: {}", kind, e));
                }
            }
        }

        Ok(result)
    }
}

fn settle(kind: ReconciliationKind, outcome: Result<ReconciliationResult>) -> ReconciliationResult {
    match outcome {
        Ok(result) => {
            if result.reconciled > 0 || result.failed > 0 {
                info!(
                    "{}: checked {}, reconciled {}, failed {}",
                    kind, result.checked, result.reconciled, result.failed
                );
            }
            result
        }
        Err(e) => {
            warn!("{} check failed: {}", kind, e);
            ReconciliationResult::errored(kind, &e.to_string())
        }
    }
}

#[async_trait]
impl ManagedService for ReconciliationService {
    async fn start(&self) -> Result<()> {
        let mut slot = self.inner.task.lock().await;
        if slot.is_none() {
            let weak = Arc::downgrade(&self.inner);
            *slot = Some(PeriodicTask::spawn(
                "reconciliation",
                self.inner.settings.interval,
                false,
                move || {
                    let weak = weak.clone();
                    async move {
                        if let Some(inner) = weak.upgrade() {
                            inner.run_all().await;
                        }
                    }
                    .boxed()
                },
            ));
            info!(
                "Reconciliation sweep every {}s",
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
    use crate::domain::{TransferStatus, WithdrawalRequest, WithdrawalStatus};
    use crate::error::SentinelError;
    use crate::ports::MockReconciliationStore;

    fn stale_transfer(id: &str, attempts: u32) -> BridgeTransfer {
        let mut t = BridgeTransfer::new(
            id,
            TransferStatus::Submitted,
            Utc::now() - chrono::Duration::hours(3),
        );
        t.reconciliation_attempts = attempts;
        t
    }

    fn empty_store() -> MockReconciliationStore {
        let mut store = MockReconciliationStore::new();
        store
            .expect_find_stale_bridge_transfers()
            .returning(|_, _| Ok(vec![]));
        store.expect_find_stale_withdrawals().returning(|_, _| Ok(vec![]));
        store
            .expect_find_positions_for_audit()
            .returning(|_, _| Ok(vec![]));
        store.expect_purge_failed_records().returning(|_, _| Ok(0));
        store
    }

    #[test]
    fn test_max_attempts_policy() {
        let policy = MaxAttemptsPolicy { max_attempts: 3 };
        assert_eq!(policy.decide(&stale_transfer("a", 2)), BridgeDecision::Retry);
        assert!(matches!(
            policy.decide(&stale_transfer("a", 3)),
            BridgeDecision::Fail(_)
        ));
    }

    #[tokio::test]
    async fn test_age_auditor() {
        let auditor = AgeAuditor {
            max_unverified_age: Duration::from_secs(86_400),
        };
        let mut position = Position {
            id: "p1".into(),
            owner: "0xabc".into(),
            active: true,
            opened_at: Utc::now() - chrono::Duration::days(3),
            last_verified_at: None,
        };
        assert!(matches!(
            auditor.audit(&position).await.unwrap(),
            AuditOutcome::Flagged(_)
        ));

        position.last_verified_at = Some(Utc::now() - chrono::Duration::hours(1));
        assert_eq!(auditor.audit(&position).await.unwrap(), AuditOutcome::Verified);
    }

    #[tokio::test]
    async fn test_bridge_retry_uses_stale_cutoff() {
        let mut store = MockReconciliationStore::new();
        store
            .expect_find_stale_bridge_transfers()
            .withf(|stale_before, limit| {
                *limit == 100 && *stale_before < Utc::now() - chrono::Duration::minutes(59)
            })
            .returning(|_, _| Ok(vec![stale_transfer("t1", 0), stale_transfer("t2", 1)]));
        store
            .expect_mark_bridge_transfer_for_retry()
            .times(2)
            .returning(|id, _, _| Ok(id == "t1"));

        let service =
            ReconciliationService::new(ReconciliationSettings::default(), Arc::new(store));
        let result = service.reconcile_bridge_transactions().await.unwrap();
        assert_eq!(result.checked, 2);
        assert_eq!(result.reconciled, 1);
        assert_eq!(result.failed, 0);
    }

    #[tokio::test]
    async fn test_withdrawal_marked_failed() {
        let mut store = MockReconciliationStore::new();
        store.expect_find_stale_withdrawals().returning(|_, _| {
            Ok(vec![WithdrawalRequest::new(
                "w1",
                WithdrawalStatus::Processing,
                Utc::now() - chrono::Duration::hours(2),
            )])
        });
        store
            .expect_fail_withdrawal()
            .withf(|id, reason| id == "w1" && reason.contains("processing"))
            .times(1)
            .returning(|_, _| Ok(true));

        let service =
            ReconciliationService::new(ReconciliationSettings::default(), Arc::new(store));
        let result = service.reconcile_withdrawals().await.unwrap();
        assert_eq!(result.reconciled, 1);
    }

    #[tokio::test]
    async fn test_failing_check_does_not_abort_sweep() {
        let mut store = MockReconciliationStore::new();
        store
            .expect_find_stale_bridge_transfers()
            .returning(|_, _| Err(SentinelError::Internal("db down".into())));
        store.expect_find_stale_withdrawals().returning(|_, _| Ok(vec![]));
        store
            .expect_find_positions_for_audit()
            .returning(|_, _| Ok(vec![]));
        store
            .expect_purge_failed_records()
            .returning(|kind, _| Ok(if kind == RecordKind::Withdrawal { 4 } else { 0 }));

        let service =
            ReconciliationService::new(ReconciliationSettings::default(), Arc::new(store));
        let results = service.run_all_reconciliations().await.unwrap();
        assert_eq!(results.len(), 4);
        assert_eq!(results[0].kind, ReconciliationKind::BridgeTransactions);
        assert_eq!(results[0].failed, 1);
        assert_eq!(results[3].reconciled, 4);
        assert_eq!(service.last_results().await.len(), 4);
    }

    #[tokio::test]
    async fn test_overlapping_sweep_skipped() {
        let service =
            ReconciliationService::new(ReconciliationSettings::default(), Arc::new(empty_store()));
        let _held = service.inner.flight.try_acquire().unwrap();
        assert!(service.is_running());
        assert!(service.run_all_reconciliations().await.is_none());
    }
}
