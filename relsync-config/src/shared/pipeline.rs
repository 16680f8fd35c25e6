use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration for a relsync pipeline.
///
/// Contains the settings that govern one synchronization run: how many fetch
/// workers may execute concurrently and how transient fetch failures are
/// retried.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// The unique identifier for this pipeline.
    pub id: u64,
    /// Maximum number of fetch workers that can run at a time.
    #[serde(default = "default_max_fetch_workers")]
    pub max_fetch_workers: u16,
    /// Retry behavior for transient fetch failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl PipelineConfig {
    /// Default number of concurrent fetch workers.
    pub const DEFAULT_MAX_FETCH_WORKERS: u16 = 8;

    /// Validates pipeline configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_fetch_workers == 0 {
            return Err(ValidationError::MaxFetchWorkersZero);
        }

        self.retry.validate()
    }
}

fn default_max_fetch_workers() -> u16 {
    PipelineConfig::DEFAULT_MAX_FETCH_WORKERS
}

/// Bounded retry-with-backoff settings for transient fetch failures.
///
/// A failed page or keyed request is retried up to `max_attempts` times, with
/// an exponentially growing, jittered delay between attempts. Exhausting the
/// attempts fails the work item and aborts the run.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total number of attempts per request, including the first one.
    #[serde(default = "default_retry_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default = "default_retry_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Multiplier applied to the delay after every failed attempt.
    #[serde(default = "default_retry_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Default number of attempts per request.
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

    /// Default delay before the first retry.
    pub const DEFAULT_INITIAL_DELAY_MS: u64 = 500;

    /// Default backoff multiplier.
    pub const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

    /// Validates retry configuration settings.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.max_attempts == 0 {
            return Err(ValidationError::RetryMaxAttemptsZero);
        }
        if self.backoff_multiplier < 1.0 {
            return Err(ValidationError::RetryMultiplierTooSmall);
        }

        Ok(())
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_retry_max_attempts(),
            initial_delay_ms: default_retry_initial_delay_ms(),
            backoff_multiplier: default_retry_backoff_multiplier(),
        }
    }
}

fn default_retry_max_attempts() -> u32 {
    RetryConfig::DEFAULT_MAX_ATTEMPTS
}

fn default_retry_initial_delay_ms() -> u64 {
    RetryConfig::DEFAULT_INITIAL_DELAY_MS
}

fn default_retry_backoff_multiplier() -> f64 {
    RetryConfig::DEFAULT_BACKOFF_MULTIPLIER
}
