use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Bridge transfer status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Submitted,
    Confirming,
    Completed,
    Failed,
}

impl TransferStatus {
    /// Statuses the reconciliation sweep treats as in flight
    pub const IN_FLIGHT: [TransferStatus; 3] = [
        TransferStatus::Pending,
        TransferStatus::Submitted,
        TransferStatus::Confirming,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::Submitted => "submitted",
            TransferStatus::Confirming => "confirming",
            TransferStatus::Completed => "completed",
            TransferStatus::Failed => "failed",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TransferStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(TransferStatus::Pending),
            "submitted" => Ok(TransferStatus::Submitted),
            "confirming" => Ok(TransferStatus::Confirming),
            "completed" => Ok(TransferStatus::Completed),
            "failed" => Ok(TransferStatus::Failed),
            _ => Err(format!("Unknown transfer status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeTransfer {
    pub id: String,
    pub status: TransferStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the sweep last marked the transfer for retry
    pub last_reconciled_at: Option<DateTime<Utc>>,
    pub reconciliation_attempts: u32,
    pub failure_reason: Option<String>,
    /// Failed transfers flagged for purge after the retention period
    pub auto_cleanup: bool,
}

impl BridgeTransfer {
    pub fn new(id: impl Into<String>, status: TransferStatus, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status,
            created_at,
            updated_at: created_at,
            last_reconciled_at: None,
            reconciliation_attempts: 0,
            failure_reason: None,
            auto_cleanup: false,
        }
    }
}

/// Withdrawal request status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WithdrawalStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl WithdrawalStatus {
    pub const IN_FLIGHT: [WithdrawalStatus; 2] =
        [WithdrawalStatus::Pending, WithdrawalStatus::Processing];

    pub fn as_str(&self) -> &'static str {
        match self {
            WithdrawalStatus::Pending => "pending",
            WithdrawalStatus::Processing => "processing",
            WithdrawalStatus::Completed => "completed",
            WithdrawalStatus::Failed => "failed",
        }
    }

    pub fn is_in_flight(&self) -> bool {
        Self::IN_FLIGHT.contains(self)
    }
}

impl fmt::Display for WithdrawalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for WithdrawalStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(WithdrawalStatus::Pending),
            "processing" => Ok(WithdrawalStatus::Processing),
            "completed" => Ok(WithdrawalStatus::Completed),
            "failed" => Ok(WithdrawalStatus::Failed),
            _ => Err(format!("Unknown withdrawal status: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub id: String,
    pub status: WithdrawalStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub failure_reason: Option<String>,
    pub auto_cleanup: bool,
}

impl WithdrawalRequest {
    pub fn new(id: impl Into<String>, status: WithdrawalStatus, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            status,
            created_at,
            updated_at: created_at,
            failure_reason: None,
            auto_cleanup: false,
        }
    }
}

/// An open vault/staking position tracked by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub owner: String,
    pub active: bool,
    pub opened_at: DateTime<Utc>,
    pub last_verified_at: Option<DateTime<Utc>>,
}

/// Which record family a stale-record query or purge targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    BridgeTransfer,
    Withdrawal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_flight_sets() {
        assert!(TransferStatus::Submitted.is_in_flight());
        assert!(!TransferStatus::Failed.is_in_flight());
        assert!(WithdrawalStatus::Processing.is_in_flight());
        assert!(!WithdrawalStatus::Completed.is_in_flight());
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!(TransferStatus::try_from("confirming"), Ok(TransferStatus::Confirming));
        assert_eq!(WithdrawalStatus::try_from("failed"), Ok(WithdrawalStatus::Failed));
        assert!(TransferStatus::try_from("lost").is_err());
    }
}
