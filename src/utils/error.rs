use thiserror::Error;

/// Rejections raised at the write boundary; nothing invalid is ever stored
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Pattern is not an exact IP, an `a.b.c.*` wildcard or a CIDR block
    #[error("invalid IP pattern: {0}")]
    InvalidPattern(String),

    /// A tenant already holds the maximum number of threshold rules
    #[error("rule limit exceeded: at most {limit} rules per tenant")]
    LimitExceeded { limit: usize },

    /// A bounded setting was given a value outside its range
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// Threshold rule with a zero count or zero window
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// Two rules in one tenant share an id
    #[error("duplicate rule id: {0}")]
    DuplicateRuleId(String),

    /// Pattern already present on the opposite list
    #[error("pattern {0} is already on the {1}")]
    PatternConflict(String, &'static str),

    /// Website URL that cannot be parsed or is not http(s)
    #[error("invalid website url: {0}")]
    InvalidUrl(String),
}

/// Failures of the backing key-value store
#[derive(Error, Debug)]
pub enum StoreError {
    /// Operation exceeded the configured lookup timeout
    #[error("store operation {operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: &'static str,
        timeout_ms: u64,
    },

    /// Store cannot be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Redis related errors
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Stored value could not be decoded
    #[error("corrupt stored value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Custom error types for the click fraud decision engine
#[derive(Error, Debug)]
pub enum EngineError {
    /// Malformed input rejected synchronously
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Unknown tenant, snippet, rule or list entry
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    /// Backing store failure, with enough context for operator logs
    #[error("store failure for tenant {tenant} during {operation}: {source}")]
    Store {
        tenant: String,
        operation: &'static str,
        #[source]
        source: StoreError,
    },

    /// Persisted state drifted from its invariants
    #[error("Inconsistent state: {0}")]
    InconsistentState(String),

    /// Configuration related errors
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl EngineError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        EngineError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn store(tenant: impl Into<String>, operation: &'static str, source: StoreError) -> Self {
        EngineError::Store {
            tenant: tenant.into(),
            operation,
            source,
        }
    }
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Result type for decision engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Attaches tenant and operation context to a store result
pub trait StoreContext<T> {
    fn in_tenant(self, tenant: &str, operation: &'static str) -> EngineResult<T>;
}

impl<T> StoreContext<T> for StoreResult<T> {
    fn in_tenant(self, tenant: &str, operation: &'static str) -> EngineResult<T> {
        self.map_err(|source| EngineError::store(tenant, operation, source))
    }
}
