use chain_sentinel::adapters::MemoryStore;
use chain_sentinel::domain::{
    BridgeTransfer, Position, TransferStatus, WithdrawalRequest, WithdrawalStatus,
};
use chain_sentinel::services::{
    AgeAuditor, MaxAttemptsPolicy, ReconciliationKind, ReconciliationResult,
    ReconciliationService, ReconciliationSettings,
};
use chrono::{Duration, Utc};
use std::sync::Arc;

fn by_kind(results: &[ReconciliationResult], kind: ReconciliationKind) -> &ReconciliationResult {
    results.iter().find(|r| r.kind == kind).unwrap()
}

async fn seeded_store() -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    let now = Utc::now();

    store
        .insert_bridge_transfer(BridgeTransfer::new("t-stale", TransferStatus::Submitted, now - Duration::hours(3)))
        .await;
    store
        .insert_bridge_transfer(BridgeTransfer::new("t-fresh", TransferStatus::Pending, now - Duration::minutes(5)))
        .await;
    store
        .insert_bridge_transfer(BridgeTransfer::new("t-done", TransferStatus::Completed, now - Duration::days(2)))
        .await;

    store
        .insert_withdrawal(WithdrawalRequest::new("w-stuck", WithdrawalStatus::Processing, now - Duration::hours(2)))
        .await;
    store
        .insert_withdrawal(WithdrawalRequest::new("w-new", WithdrawalStatus::Pending, now))
        .await;

    let mut purgeable = WithdrawalRequest::new("w-old-failed", WithdrawalStatus::Failed, now - Duration::days(45));
    purgeable.auto_cleanup = true;
    store.insert_withdrawal(purgeable).await;

    store
        .insert_position(Position {
            id: "p1".into(),
            owner: "0xowner".into(),
            active: true,
            opened_at: now - Duration::days(3),
            last_verified_at: None,
        })
        .await;

    store
}

#[tokio::test]
async fn sweep_reconciles_each_stale_record_once() {
    let store = seeded_store().await;
    let service = ReconciliationService::new(ReconciliationSettings::default(), store.clone());

    let first = service.run_all_reconciliations().await.unwrap();
    assert_eq!(first.len(), 4);
    assert_eq!(by_kind(&first, ReconciliationKind::BridgeTransactions).reconciled, 1);
    assert_eq!(by_kind(&first, ReconciliationKind::Withdrawals).reconciled, 1);
    assert_eq!(by_kind(&first, ReconciliationKind::Positions).checked, 1);
    assert_eq!(by_kind(&first, ReconciliationKind::Cleanup).reconciled, 1);

    let transfer = store.bridge_transfer("t-stale").await.unwrap();
    assert_eq!(transfer.reconciliation_attempts, 1);
    assert!(transfer.status.is_in_flight());
    assert_eq!(store.bridge_transfer("t-fresh").await.unwrap().reconciliation_attempts, 0);

    let withdrawal = store.withdrawal("w-stuck").await.unwrap();
    assert_eq!(withdrawal.status, WithdrawalStatus::Failed);
    assert!(withdrawal.failure_reason.is_some());
    assert!(store.withdrawal("w-old-failed").await.is_none());

    // unchanged data: nothing mutates on the next sweep
    let second = service.run_all_reconciliations().await.unwrap();
    for kind in [
        ReconciliationKind::BridgeTransactions,
        ReconciliationKind::Withdrawals,
        ReconciliationKind::Cleanup,
    ] {
        assert_eq!(by_kind(&second, kind).reconciled, 0, "{kind} mutated twice");
    }
    assert_eq!(store.bridge_transfer("t-stale").await.unwrap().reconciliation_attempts, 1);
    assert_eq!(service.last_results().await.len(), 4);
}

#[tokio::test]
async fn attempt_policy_fails_transfers_that_keep_stalling() {
    let store = Arc::new(MemoryStore::new());
    let mut transfer = BridgeTransfer::new("t1", TransferStatus::Confirming, Utc::now() - Duration::hours(6));
    transfer.reconciliation_attempts = 3;
    store.insert_bridge_transfer(transfer).await;

    let settings = ReconciliationSettings::default();
    let service = ReconciliationService::with_extensions(
        settings.clone(),
        store.clone(),
        Arc::new(MaxAttemptsPolicy { max_attempts: 3 }),
        Arc::new(AgeAuditor {
            max_unverified_age: settings.position_audit_age,
        }),
    );

    let results = service.run_all_reconciliations().await.unwrap();
    assert_eq!(by_kind(&results, ReconciliationKind::BridgeTransactions).reconciled, 1);

    let failed = store.bridge_transfer("t1").await.unwrap();
    assert_eq!(failed.status, TransferStatus::Failed);
    assert!(failed.auto_cleanup);
}
