//! Narrow interfaces to collaborators owned outside the control plane.
//!
//! Storage, chain access and the bridge counterpart are consumed only through
//! these traits. `PostgresStore`, `MemoryStore`, `RpcChainClient` and
//! `HttpConfirmationClient` in `adapters` implement them.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    BackendStatus, BridgeTransfer, Position, RecordKind, Redemption, RedemptionUpdate,
    WithdrawalRequest,
};
use crate::error::Result;

/// Redemption rows read and written by the withdrawal retry service
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait RedemptionStore: Send + Sync {
    /// Backend leg in `manual_review`/`retry_pending` with the user leg completed
    async fn get_redemptions_needing_retry(&self) -> Result<Vec<Redemption>>;

    async fn get_redemption_by_id(&self, id: &str) -> Result<Option<Redemption>>;

    async fn get_redemptions_by_backend_status(
        &self,
        status: BackendStatus,
    ) -> Result<Vec<Redemption>>;

    /// Returns false when the record is missing or the update precondition failed
    async fn update_redemption(&self, id: &str, update: &RedemptionUpdate) -> Result<bool>;
}

/// Queries and guarded transitions used by the reconciliation sweep.
///
/// Every mutation re-checks the status it expects so that a repeated sweep
/// over unchanged data writes nothing.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReconciliationStore: Send + Sync {
    /// In-flight transfers created before `stale_before` and not marked since
    async fn find_stale_bridge_transfers(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BridgeTransfer>>;

    /// Record a retry marker on an in-flight transfer not marked since `stale_before`
    async fn mark_bridge_transfer_for_retry(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool>;

    async fn fail_bridge_transfer(&self, id: &str, reason: &str) -> Result<bool>;

    async fn find_stale_withdrawals(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WithdrawalRequest>>;

    async fn fail_withdrawal(&self, id: &str, reason: &str) -> Result<bool>;

    async fn find_positions_for_audit(
        &self,
        opened_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Position>>;

    /// Hard-delete failed, auto-cleanable records last updated before `older_than`
    async fn purge_failed_records(&self, kind: RecordKind, older_than: DateTime<Utc>) -> Result<u64>;
}

/// Shared funding account on chain
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChainClient: Send + Sync {
    /// Balance in wei
    async fn get_smart_account_balance(&self) -> Result<u128>;

    async fn is_paymaster_enabled(&self) -> Result<bool>;

    /// Top up the account by `amount` native tokens (decimal string), returns the tx hash
    async fn prefund_smart_account(&self, amount: &str) -> Result<String>;
}

/// Bridge counterpart that settles a redemption's backend leg
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ConfirmationPort: Send + Sync {
    /// Errors on failure. On success the counterpart marks the record `completed`.
    async fn execute_confirmation_payment(&self, redemption_id: &str, payout_tx_hash: &str)
        -> Result<()>;
}
