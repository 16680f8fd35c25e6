use serde::Deserialize;

use crate::shared::{
    PgConnectionConfig, PipelineConfig, SourceConfig, SyncRulesConfig, ValidationError,
};

/// Complete configuration for the replicator service.
///
/// Aggregates everything required to run one synchronization: pipeline
/// settings, the remote source, the target database, and the per-type sync
/// rules. Typically loaded from configuration files at startup.
///
/// This intentionally does not implement `Serialize` to avoid accidentally
/// leaking secrets in the config into serialized forms.
#[derive(Clone, Debug, Deserialize)]
pub struct ReplicatorConfig {
    /// Configuration for the replication pipeline.
    pub pipeline: PipelineConfig,
    /// Configuration for the remote entity source.
    pub source: SourceConfig,
    /// Connection configuration for the target Postgres instance.
    pub sink: PgConnectionConfig,
    /// Per-entity-type synchronization rules.
    #[serde(default)]
    pub sync: SyncRulesConfig,
}

impl ReplicatorConfig {
    /// Validates the complete replicator configuration.
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.pipeline.validate()?;
        self.source.validate()?;
        self.sink.validate()
    }
}
