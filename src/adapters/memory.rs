//! In-process store for tests and dry runs.
//!
//! Applies the same conditional transitions as `PostgresStore`, so sweeps
//! behave identically against either backend.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::domain::{
    BackendStatus, BridgeTransfer, Position, RecordKind, Redemption, RedemptionUpdate,
    TransferStatus, WithdrawalRequest, WithdrawalStatus,
};
use crate::error::Result;
use crate::ports::{RedemptionStore, ReconciliationStore};

#[derive(Default)]
struct Tables {
    redemptions: HashMap<String, Redemption>,
    bridge_transfers: HashMap<String, BridgeTransfer>,
    withdrawals: HashMap<String, WithdrawalRequest>,
    positions: HashMap<String, Position>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_redemption(&self, redemption: Redemption) {
        self.tables
            .write()
            .await
            .redemptions
            .insert(redemption.id.clone(), redemption);
    }

    pub async fn insert_bridge_transfer(&self, transfer: BridgeTransfer) {
        self.tables
            .write()
            .await
            .bridge_transfers
            .insert(transfer.id.clone(), transfer);
    }

    pub async fn insert_withdrawal(&self, withdrawal: WithdrawalRequest) {
        self.tables
            .write()
            .await
            .withdrawals
            .insert(withdrawal.id.clone(), withdrawal);
    }

    pub async fn insert_position(&self, position: Position) {
        self.tables
            .write()
            .await
            .positions
            .insert(position.id.clone(), position);
    }

    pub async fn redemption(&self, id: &str) -> Option<Redemption> {
        self.tables.read().await.redemptions.get(id).cloned()
    }

    pub async fn bridge_transfer(&self, id: &str) -> Option<BridgeTransfer> {
        self.tables.read().await.bridge_transfers.get(id).cloned()
    }

    pub async fn withdrawal(&self, id: &str) -> Option<WithdrawalRequest> {
        self.tables.read().await.withdrawals.get(id).cloned()
    }

    /// Mark the backend leg completed, as the bridge counterpart does after a
    /// successful confirmation
    pub async fn complete_redemption(&self, id: &str) -> bool {
        let mut tables = self.tables.write().await;
        match tables.redemptions.get_mut(id) {
            Some(r) => RedemptionUpdate::status(BackendStatus::Completed).apply(r),
            None => false,
        }
    }
}

fn oldest_first<T>(mut rows: Vec<T>, created_at: impl Fn(&T) -> DateTime<Utc>, limit: u32) -> Vec<T> {
    rows.sort_by_key(|r| created_at(r));
    rows.truncate(limit as usize);
    rows
}

fn unmarked_since(last: Option<DateTime<Utc>>, stale_before: DateTime<Utc>) -> bool {
    last.map(|at| at < stale_before).unwrap_or(true)
}

#[async_trait]
impl RedemptionStore for MemoryStore {
    async fn get_redemptions_needing_retry(&self) -> Result<Vec<Redemption>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Redemption> = tables
            .redemptions
            .values()
            .filter(|r| r.needs_retry())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        Ok(rows)
    }

    async fn get_redemption_by_id(&self, id: &str) -> Result<Option<Redemption>> {
        Ok(self.redemption(id).await)
    }

    async fn get_redemptions_by_backend_status(
        &self,
        status: BackendStatus,
    ) -> Result<Vec<Redemption>> {
        let tables = self.tables.read().await;
        Ok(tables
            .redemptions
            .values()
            .filter(|r| r.backend_status == status)
            .cloned()
            .collect())
    }

    async fn update_redemption(&self, id: &str, update: &RedemptionUpdate) -> Result<bool> {
        let mut tables = self.tables.write().await;
        Ok(tables
            .redemptions
            .get_mut(id)
            .map(|r| update.apply(r))
            .unwrap_or(false))
    }
}

#[async_trait]
impl ReconciliationStore for MemoryStore {
    async fn find_stale_bridge_transfers(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BridgeTransfer>> {
        let tables = self.tables.read().await;
        let rows = tables
            .bridge_transfers
            .values()
            .filter(|t| {
                t.status.is_in_flight()
                    && t.created_at < stale_before
                    && unmarked_since(t.last_reconciled_at, stale_before)
            })
            .cloned()
            .collect();
        Ok(oldest_first(rows, |t| t.created_at, limit))
    }

    async fn mark_bridge_transfer_for_retry(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.bridge_transfers.get_mut(id) {
            Some(t) if t.status.is_in_flight() && unmarked_since(t.last_reconciled_at, stale_before) => {
                t.last_reconciled_at = Some(now);
                t.reconciliation_attempts += 1;
                t.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_bridge_transfer(&self, id: &str, reason: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.bridge_transfers.get_mut(id) {
            Some(t) if t.status.is_in_flight() => {
                t.status = TransferStatus::Failed;
                t.failure_reason = Some(reason.to_string());
                t.auto_cleanup = true;
                t.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_stale_withdrawals(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WithdrawalRequest>> {
        let tables = self.tables.read().await;
        let rows = tables
            .withdrawals
            .values()
            .filter(|w| w.status.is_in_flight() && w.created_at < stale_before)
            .cloned()
            .collect();
        Ok(oldest_first(rows, |w| w.created_at, limit))
    }

    async fn fail_withdrawal(&self, id: &str, reason: &str) -> Result<bool> {
        let mut tables = self.tables.write().await;
        match tables.withdrawals.get_mut(id) {
            Some(w) if w.status.is_in_flight() => {
                w.status = WithdrawalStatus::Failed;
                w.failure_reason = Some(reason.to_string());
                w.auto_cleanup = true;
                w.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn find_positions_for_audit(
        &self,
        opened_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Position>> {
        let tables = self.tables.read().await;
        let rows = tables
            .positions
            .values()
            .filter(|p| p.active && p.opened_at < opened_before)
            .cloned()
            .collect();
        Ok(oldest_first(rows, |p| p.opened_at, limit))
    }

    async fn purge_failed_records(&self, kind: RecordKind, older_than: DateTime<Utc>) -> Result<u64> {
        let mut tables = self.tables.write().await;
        let purged = match kind {
            RecordKind::BridgeTransfer => {
                let before = tables.bridge_transfers.len();
                tables.bridge_transfers.retain(|_, t| {
                    !(t.status == TransferStatus::Failed && t.auto_cleanup && t.updated_at < older_than)
                });
                before - tables.bridge_transfers.len()
            }
            RecordKind::Withdrawal => {
                let before = tables.withdrawals.len();
                tables.withdrawals.retain(|_, w| {
                    !(w.status == WithdrawalStatus::Failed && w.auto_cleanup && w.updated_at < older_than)
                });
                before - tables.withdrawals.len()
            }
        };
        Ok(purged as u64)
    }
}
