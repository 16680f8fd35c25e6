use thiserror::Error;

/// Configuration validation errors.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// Maximum fetch workers cannot be zero.
    #[error("`max_fetch_workers` cannot be zero")]
    MaxFetchWorkersZero,
    /// Maximum retry attempts cannot be zero.
    #[error("`retry.max_attempts` cannot be zero")]
    RetryMaxAttemptsZero,
    /// The retry backoff multiplier must not shrink delays.
    #[error("`retry.backoff_multiplier` must be >= 1.0")]
    RetryMultiplierTooSmall,
    /// The remote service root URL is missing or malformed.
    #[error("invalid source config: {0}")]
    InvalidSourceUrl(String),
    /// A required connection field is empty.
    #[error("invalid sink connection config: `{0}` must not be empty")]
    EmptyConnectionField(&'static str),
}
