use thiserror::Error;

/// Main error type for the control plane
#[derive(Error, Debug)]
pub enum SentinelError {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    // Database errors
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    // Network errors
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    // Serialization errors
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    // Circuit breaker
    #[error("Circuit breaker '{name}' is open, retry in {retry_in_ms}ms")]
    CircuitOpen { name: String, retry_in_ms: u64 },

    #[error("Circuit breaker not found: {0}")]
    UnknownCircuitBreaker(String),

    // Lookup errors
    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Feature flag not found: {0}")]
    FlagNotFound(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    // Withdrawal retry errors
    #[error("Insufficient balance for gas: have {balance}, need {required}")]
    InsufficientBalance {
        balance: rust_decimal::Decimal,
        required: rust_decimal::Decimal,
    },

    #[error("Max funding attempts exceeded for {id}: {attempts} >= {max}")]
    MaxFundingAttemptsExceeded { id: String, attempts: u32, max: u32 },

    #[error("Max retries exceeded for {id}: {retry_count} >= {max}")]
    MaxRetriesExceeded { id: String, retry_count: u32, max: u32 },

    #[error("Confirmation failed for {id}: {reason}")]
    ConfirmationFailed { id: String, reason: String },

    #[error("Remediation failed: {0}")]
    Remediation(String),

    // Lifecycle errors
    #[error("Component failure: {component} - {reason}")]
    ComponentFailure { component: String, reason: String },

    #[error("Timed out after {elapsed_ms}ms: {operation}")]
    Timeout { operation: String, elapsed_ms: u64 },

    // Validation errors
    #[error("Validation failed: {0}")]
    Validation(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

/// Result type alias for SentinelError
pub type Result<T> = std::result::Result<T, SentinelError>;

/// Errors raised by the JSON-RPC layer.
///
/// `Clone` so one in-flight result can be handed to every de-duplicated waiter.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RpcError {
    #[error("transport error at {url}: {message}")]
    Transport { url: String, message: String },

    #[error("request to {url} timed out after {timeout_ms}ms")]
    Timeout { url: String, timeout_ms: u64 },

    #[error("rpc error {code}: {message}")]
    Response { code: i64, message: String },

    #[error("invalid response: {0}")]
    InvalidResponse(String),

    #[error("no endpoints configured")]
    NoEndpoints,

    #[error("all {attempts} attempts failed, last error: {last}")]
    Exhausted { attempts: u32, last: String },
}

impl SentinelError {
    /// Whether a retry could plausibly succeed without operator action
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SentinelError::Http(_)
                | SentinelError::Rpc(RpcError::Transport { .. })
                | SentinelError::Rpc(RpcError::Timeout { .. })
                | SentinelError::Rpc(RpcError::Exhausted { .. })
                | SentinelError::Timeout { .. }
                | SentinelError::CircuitOpen { .. }
        )
    }
}
