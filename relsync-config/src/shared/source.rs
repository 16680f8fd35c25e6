use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::shared::ValidationError;

/// Configuration for the remote entity source.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Root URL of the remote service, e.g. `https://ws.parlament.ch/odata.svc`.
    pub base_url: String,
    /// Path of the JSON catalog file describing entity types and relations.
    pub catalog_path: PathBuf,
    /// Optional page size hint passed to the server (`$top`); the server's own
    /// paging applies when unset.
    #[serde(default)]
    pub page_size: Option<u32>,
    /// Per-request timeout, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl SourceConfig {
    /// Default per-request timeout.
    pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

    /// Validates the source configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.base_url.is_empty() {
            return Err(ValidationError::InvalidSourceUrl(
                "`base_url` must not be empty".to_string(),
            ));
        }
        if self.base_url.ends_with('/') {
            return Err(ValidationError::InvalidSourceUrl(format!(
                "`base_url` must not end with a slash: `{}`",
                self.base_url
            )));
        }

        Ok(())
    }
}

fn default_request_timeout_ms() -> u64 {
    SourceConfig::DEFAULT_REQUEST_TIMEOUT_MS
}
