//! Long-running control plane services

pub mod feature_flags;
pub mod readiness;
pub mod reconciliation;
pub mod withdrawal_retry;

pub use feature_flags::{
    FeatureFlagDefinition, FeatureFlagService, FeatureFlagStatus, HealthProbe,
    AUTO_DISABLED_REASON,
};
pub use readiness::{
    ReadinessReport, ReadinessRegistry, ReadinessState, ServiceReadiness, ServiceStatus,
};
pub use reconciliation::{
    AgeAuditor, AlwaysRetry, AuditOutcome, BridgeDecision, BridgeRetryPolicy, MaxAttemptsPolicy,
    PositionAuditor, ReconciliationKind, ReconciliationResult, ReconciliationService,
    ReconciliationSettings,
};
pub use withdrawal_retry::{
    wei_to_native, CycleSummary, FundingStatus, RetryOutcome, RetryStats,
    WithdrawalRetryService, WithdrawalRetrySettings,
};
