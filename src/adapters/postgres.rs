use crate::domain::{
    BackendStatus, BridgeTransfer, Position, RecordKind, Redemption, RedemptionUpdate,
    TransferStatus, UserStatus, WithdrawalRequest, WithdrawalStatus,
};
use crate::error::{Result, SentinelError};
use crate::ports::{RedemptionStore, ReconciliationStore};
use crate::supervisor::ManagedService;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument};

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| SentinelError::Database(e.into()))?;
        info!("Database migrations completed");
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Close the pool. Only called at process shutdown.
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Database pool closed");
    }

    /// Liveness probe for the supervisor
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

fn transfer_in_flight() -> Vec<String> {
    TransferStatus::IN_FLIGHT
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn withdrawal_in_flight() -> Vec<String> {
    WithdrawalStatus::IN_FLIGHT
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
}

fn parse_status<T>(raw: String) -> Result<T>
where
    T: for<'a> TryFrom<&'a str, Error = String>,
{
    T::try_from(raw.as_str()).map_err(SentinelError::Internal)
}

fn redemption_from_row(r: &PgRow) -> Result<Redemption> {
    Ok(Redemption {
        id: r.get("id"),
        status: r.get("status"),
        backend_status: parse_status::<BackendStatus>(r.get("backend_status"))?,
        user_status: parse_status::<UserStatus>(r.get("user_status"))?,
        retry_count: r.get::<i32, _>("retry_count").max(0) as u32,
        last_retry_at: r.get("last_retry_at"),
        last_error: r.get("last_error"),
        funding_attempts: r.get::<i32, _>("funding_attempts").max(0) as u32,
        xrpl_payout_tx_hash: r.get("xrpl_payout_tx_hash"),
        redemption_request_id: r.get("redemption_request_id"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    })
}

fn transfer_from_row(r: &PgRow) -> Result<BridgeTransfer> {
    Ok(BridgeTransfer {
        id: r.get("id"),
        status: parse_status::<TransferStatus>(r.get("status"))?,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        last_reconciled_at: r.get("last_reconciled_at"),
        reconciliation_attempts: r.get::<i32, _>("reconciliation_attempts").max(0) as u32,
        failure_reason: r.get("failure_reason"),
        auto_cleanup: r.get("auto_cleanup"),
    })
}

fn withdrawal_from_row(r: &PgRow) -> Result<WithdrawalRequest> {
    Ok(WithdrawalRequest {
        id: r.get("id"),
        status: parse_status::<WithdrawalStatus>(r.get("status"))?,
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
        failure_reason: r.get("failure_reason"),
        auto_cleanup: r.get("auto_cleanup"),
    })
}

const REDEMPTION_COLUMNS: &str = "id, status, backend_status, user_status, retry_count, \
     last_retry_at, last_error, funding_attempts, xrpl_payout_tx_hash, \
     redemption_request_id, created_at, updated_at";

#[async_trait]
impl RedemptionStore for PostgresStore {
    #[instrument(skip(self))]
    async fn get_redemptions_needing_retry(&self) -> Result<Vec<Redemption>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {REDEMPTION_COLUMNS}
            FROM redemptions
            WHERE backend_status IN ('manual_review', 'retry_pending')
              AND user_status = 'completed'
            ORDER BY created_at ASC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(redemption_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn get_redemption_by_id(&self, id: &str) -> Result<Option<Redemption>> {
        let row = sqlx::query(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemptions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(redemption_from_row).transpose()
    }

    async fn get_redemptions_by_backend_status(
        &self,
        status: BackendStatus,
    ) -> Result<Vec<Redemption>> {
        let rows = sqlx::query(&format!(
            "SELECT {REDEMPTION_COLUMNS} FROM redemptions WHERE backend_status = $1 ORDER BY created_at ASC"
        ))
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(redemption_from_row).collect()
    }

    #[instrument(skip(self, update))]
    async fn update_redemption(&self, id: &str, update: &RedemptionUpdate) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE redemptions SET
                backend_status = COALESCE($2, backend_status),
                retry_count = COALESCE($3, retry_count),
                last_retry_at = COALESCE($4, last_retry_at),
                last_error = COALESCE($5, last_error),
                funding_attempts = COALESCE($6, funding_attempts),
                updated_at = NOW()
            WHERE id = $1
              AND ($7::TEXT IS NULL OR backend_status = $7)
            "#,
        )
        .bind(id)
        .bind(update.backend_status.map(|s| s.as_str()))
        .bind(update.retry_count.map(|c| c as i32))
        .bind(update.last_retry_at)
        .bind(update.last_error.as_deref())
        .bind(update.funding_attempts.map(|c| c as i32))
        .bind(update.expected_backend_status.map(|s| s.as_str()))
        .execute(&self.pool)
        .await?;

        let applied = result.rows_affected() > 0;
        if !applied {
            debug!("Redemption {} update skipped, precondition not met", id);
        }
        Ok(applied)
    }
}

#[async_trait]
impl ReconciliationStore for PostgresStore {
    #[instrument(skip(self))]
    async fn find_stale_bridge_transfers(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BridgeTransfer>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, created_at, updated_at, last_reconciled_at,
                   reconciliation_attempts, failure_reason, auto_cleanup
            FROM bridge_transfers
            WHERE status = ANY($1)
              AND created_at < $2
              AND (last_reconciled_at IS NULL OR last_reconciled_at < $2)
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(transfer_in_flight())
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(transfer_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn mark_bridge_transfer_for_retry(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bridge_transfers SET
                last_reconciled_at = $3,
                reconciliation_attempts = reconciliation_attempts + 1,
                updated_at = $3
            WHERE id = $1
              AND status = ANY($4)
              AND (last_reconciled_at IS NULL OR last_reconciled_at < $2)
            "#,
        )
        .bind(id)
        .bind(stale_before)
        .bind(now)
        .bind(transfer_in_flight())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn fail_bridge_transfer(&self, id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE bridge_transfers SET
                status = 'failed',
                failure_reason = $2,
                auto_cleanup = TRUE,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(transfer_in_flight())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn find_stale_withdrawals(
        &self,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<WithdrawalRequest>> {
        let rows = sqlx::query(
            r#"
            SELECT id, status, created_at, updated_at, failure_reason, auto_cleanup
            FROM withdrawal_requests
            WHERE status = ANY($1) AND created_at < $2
            ORDER BY created_at ASC
            LIMIT $3
            "#,
        )
        .bind(withdrawal_in_flight())
        .bind(stale_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(withdrawal_from_row).collect()
    }

    #[instrument(skip(self))]
    async fn fail_withdrawal(&self, id: &str, reason: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE withdrawal_requests SET
                status = 'failed',
                failure_reason = $2,
                auto_cleanup = TRUE,
                updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            "#,
        )
        .bind(id)
        .bind(reason)
        .bind(withdrawal_in_flight())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn find_positions_for_audit(
        &self,
        opened_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Position>> {
        let rows = sqlx::query(
            r#"
            SELECT id, owner, active, opened_at, last_verified_at
            FROM positions
            WHERE active AND opened_at < $1
            ORDER BY opened_at ASC
            LIMIT $2
            "#,
        )
        .bind(opened_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| Position {
                id: r.get("id"),
                owner: r.get("owner"),
                active: r.get("active"),
                opened_at: r.get("opened_at"),
                last_verified_at: r.get("last_verified_at"),
            })
            .collect())
    }

    #[instrument(skip(self))]
    async fn purge_failed_records(&self, kind: RecordKind, older_than: DateTime<Utc>) -> Result<u64> {
        let sql = match kind {
            RecordKind::BridgeTransfer => {
                "DELETE FROM bridge_transfers WHERE status = 'failed' AND auto_cleanup AND updated_at < $1"
            }
            RecordKind::Withdrawal => {
                "DELETE FROM withdrawal_requests WHERE status = 'failed' AND auto_cleanup AND updated_at < $1"
            }
        };

        let result = sqlx::query(sql).bind(older_than).execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl ManagedService for PostgresStore {
    async fn start(&self) -> Result<()> {
        self.ping().await
    }

    // The pool is shared by every store handle and outlives supervised
    // restarts; it is closed once by `close` at process shutdown.
    async fn stop(&self) -> Result<()> {
        debug!("Database service stopped, pool kept open");
        Ok(())
    }

    async fn health_check(&self) -> Result<bool> {
        self.ping().await.map(|_| true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_store() -> PostgresStore {
        let pool = PgPoolOptions::new()
            .max_connections(1)
            .connect_lazy("postgres://sentinel@127.0.0.1:1/sentinel")
            .unwrap();
        PostgresStore::from_pool(pool)
    }

    #[tokio::test]
    async fn test_supervised_stop_keeps_pool_open() {
        let store = lazy_store();
        let handle = store.clone();

        store.stop().await.unwrap();
        assert!(!store.pool().is_closed());
        assert!(!handle.pool().is_closed());

        // a second stop/start cycle still sees the same live pool
        store.stop().await.unwrap();
        assert!(!handle.pool().is_closed());
    }

    #[tokio::test]
    async fn test_close_shuts_pool_for_every_handle() {
        let store = lazy_store();
        let handle = store.clone();

        store.close().await;
        assert!(handle.pool().is_closed());
    }
}
