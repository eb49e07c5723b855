use std::time::Duration;

/// Error taxonomy for pipeline stages.
///
/// The variant decides the retry path: transient failures burn the
/// per-stage transient budget, schema violations burn a separate smaller
/// budget, and the rest short-circuit to a failed state without retrying.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StageError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("schema violation: {0}")]
    SchemaViolation(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("rejected by policy: {0}")]
    PolicyReject(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Retried with backoff against the per-stage transient budget.
    Transient,
    /// Retried against the smaller schema-violation budget.
    Schema,
    /// Never retried.
    None,
}

impl StageError {
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Timeout(_) => "timeout",
            StageError::RateLimited(_) => "rate_limited",
            StageError::Transient(_) => "transient",
            StageError::SchemaViolation(_) => "schema_violation",
            StageError::NotFound(_) => "not_found",
            StageError::PolicyReject(_) => "policy_reject",
            StageError::Fatal(_) => "fatal",
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            StageError::Timeout(_) | StageError::RateLimited(_) | StageError::Transient(_) => {
                RetryClass::Transient
            }
            StageError::SchemaViolation(_) => RetryClass::Schema,
            StageError::NotFound(_) | StageError::PolicyReject(_) | StageError::Fatal(_) => {
                RetryClass::None
            }
        }
    }
}
