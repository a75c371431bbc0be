use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Backend leg status of a redemption
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendStatus {
    /// Waiting for the bridge confirmation payment
    Confirming,
    /// Confirmation failed and needs attention
    ManualReview,
    /// Failed attempt, eligible again after backoff
    RetryPending,
    /// An attempt is in progress
    Retrying,
    /// Retry budget spent, requires manual action
    Abandoned,
    Completed,
}

impl BackendStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendStatus::Confirming => "confirming",
            BackendStatus::ManualReview => "manual_review",
            BackendStatus::RetryPending => "retry_pending",
            BackendStatus::Retrying => "retrying",
            BackendStatus::Abandoned => "abandoned",
            BackendStatus::Completed => "completed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, BackendStatus::Abandoned | BackendStatus::Completed)
    }

    /// Picked up by the automatic retry loop
    pub fn needs_retry(&self) -> bool {
        matches!(self, BackendStatus::ManualReview | BackendStatus::RetryPending)
    }
}

impl fmt::Display for BackendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for BackendStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "confirming" => Ok(BackendStatus::Confirming),
            "manual_review" => Ok(BackendStatus::ManualReview),
            "retry_pending" => Ok(BackendStatus::RetryPending),
            "retrying" => Ok(BackendStatus::Retrying),
            "abandoned" => Ok(BackendStatus::Abandoned),
            "completed" => Ok(BackendStatus::Completed),
            _ => Err(format!("Unknown backend status: {}", s)),
        }
    }
}

/// User-facing leg status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserStatus {
    Pending,
    Completed,
    Failed,
}

impl UserStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserStatus::Pending => "pending",
            UserStatus::Completed => "completed",
            UserStatus::Failed => "failed",
        }
    }
}

impl TryFrom<&str> for UserStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(UserStatus::Pending),
            "completed" => Ok(UserStatus::Completed),
            "failed" => Ok(UserStatus::Failed),
            _ => Err(format!("Unknown user status: {}", s)),
        }
    }
}

/// A redemption whose backend confirmation leg may need retrying
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Redemption {
    pub id: String,
    pub status: String,
    pub backend_status: BackendStatus,
    pub user_status: UserStatus,
    pub retry_count: u32,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub funding_attempts: u32,
    pub xrpl_payout_tx_hash: Option<String>,
    pub redemption_request_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Redemption {
    pub fn new(id: impl Into<String>, backend_status: BackendStatus) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            status: "processing".to_string(),
            backend_status,
            user_status: UserStatus::Completed,
            retry_count: 0,
            last_retry_at: None,
            last_error: None,
            funding_attempts: 0,
            xrpl_payout_tx_hash: None,
            redemption_request_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_payout(mut self, payout_tx_hash: &str, request_id: &str) -> Self {
        self.xrpl_payout_tx_hash = Some(payout_tx_hash.to_string());
        self.redemption_request_id = Some(request_id.to_string());
        self
    }

    /// Payout hash, if both fields needed for confirmation are present
    pub fn confirmation_payout(&self) -> Option<&str> {
        match (&self.xrpl_payout_tx_hash, &self.redemption_request_id) {
            (Some(hash), Some(_)) if !hash.is_empty() => Some(hash.as_str()),
            _ => None,
        }
    }

    /// Eligible for the automatic retry loop
    pub fn needs_retry(&self) -> bool {
        self.backend_status.needs_retry() && self.user_status == UserStatus::Completed
    }
}

/// Partial update of a redemption.
///
/// `expected_backend_status` makes the update conditional: it only applies when
/// the stored status still matches.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RedemptionUpdate {
    pub expected_backend_status: Option<BackendStatus>,
    pub backend_status: Option<BackendStatus>,
    pub retry_count: Option<u32>,
    pub last_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub funding_attempts: Option<u32>,
}

impl RedemptionUpdate {
    pub fn status(status: BackendStatus) -> Self {
        Self {
            backend_status: Some(status),
            ..Default::default()
        }
    }

    pub fn when(mut self, expected: BackendStatus) -> Self {
        self.expected_backend_status = Some(expected);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.last_error = Some(error.into());
        self
    }

    /// Apply to an in-memory record, returns false when the precondition fails
    pub fn apply(&self, record: &mut Redemption) -> bool {
        if let Some(expected) = self.expected_backend_status {
            if record.backend_status != expected {
                return false;
            }
        }
        if let Some(status) = self.backend_status {
            record.backend_status = status;
        }
        if let Some(count) = self.retry_count {
            record.retry_count = count;
        }
        if let Some(at) = self.last_retry_at {
            record.last_retry_at = Some(at);
        }
        if let Some(err) = &self.last_error {
            record.last_error = Some(err.clone());
        }
        if let Some(attempts) = self.funding_attempts {
            record.funding_attempts = attempts;
        }
        record.updated_at = Utc::now();
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_status_round_trip() {
        for status in [
            BackendStatus::Confirming,
            BackendStatus::ManualReview,
            BackendStatus::RetryPending,
            BackendStatus::Retrying,
            BackendStatus::Abandoned,
            BackendStatus::Completed,
        ] {
            assert_eq!(BackendStatus::try_from(status.as_str()), Ok(status));
        }
        assert!(BackendStatus::try_from("bogus").is_err());
    }

    #[test]
    fn test_needs_retry_requires_user_leg_completed() {
        let mut r = Redemption::new("r1", BackendStatus::ManualReview);
        assert!(r.needs_retry());
        r.user_status = UserStatus::Pending;
        assert!(!r.needs_retry());
        r.user_status = UserStatus::Completed;
        r.backend_status = BackendStatus::Retrying;
        assert!(!r.needs_retry());
    }

    #[test]
    fn test_confirmation_payout_requires_both_fields() {
        let r = Redemption::new("r1", BackendStatus::RetryPending);
        assert_eq!(r.confirmation_payout(), None);
        let r = r.with_payout("ABCDEF", "req-1");
        assert_eq!(r.confirmation_payout(), Some("ABCDEF"));
    }

    #[test]
    fn test_conditional_update() {
        let mut r = Redemption::new("r1", BackendStatus::RetryPending);
        let update = RedemptionUpdate::status(BackendStatus::Retrying).when(BackendStatus::Retrying);
        assert!(!update.apply(&mut r));
        assert_eq!(r.backend_status, BackendStatus::RetryPending);

        let update =
            RedemptionUpdate::status(BackendStatus::Retrying).when(BackendStatus::RetryPending);
        assert!(update.apply(&mut r));
        assert_eq!(r.backend_status, BackendStatus::Retrying);
    }
}
