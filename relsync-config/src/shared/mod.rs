//! Shared configuration types for relsync pipelines.

mod base;
mod connection;
mod pipeline;
mod replicator;
mod rules;
mod source;

pub use base::ValidationError;
pub use connection::PgConnectionConfig;
pub use pipeline::{PipelineConfig, RetryConfig};
pub use replicator::ReplicatorConfig;
pub use rules::{EntityRuleConfig, SyncRulesConfig};
pub use source::SourceConfig;
