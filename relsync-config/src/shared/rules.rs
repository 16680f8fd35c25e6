use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Per-run synchronization rules, keyed by entity type name.
///
/// Entity types not listed under `entities` follow `sync_unconfigured`; listed
/// types may override the sync flag and add a filter, a field subset, or a
/// key-anchored fetch designation. Interpretation and validation against the
/// catalog happen in the engine, once, before any fetch starts.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SyncRulesConfig {
    /// Whether entity types without an explicit rule are synchronized.
    #[serde(default = "default_sync_unconfigured")]
    pub sync_unconfigured: bool,
    /// Filter expression applied to every entity type, combined with any
    /// per-type filter.
    #[serde(default)]
    pub filter: Option<String>,
    /// Per-entity-type rules. A `BTreeMap` keeps iteration order stable so
    /// validation errors are deterministic.
    #[serde(default)]
    pub entities: BTreeMap<String, EntityRuleConfig>,
}

/// Synchronization rule for a single entity type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EntityRuleConfig {
    /// Whether this entity type is synchronized.
    #[serde(default = "default_sync")]
    pub sync: bool,
    /// Filter expression restricting which records are fetched.
    #[serde(default)]
    pub filter: Option<String>,
    /// Explicit field subset to fetch and persist; full declared field list
    /// when unset.
    #[serde(default)]
    pub select: Option<Vec<String>>,
    /// Name of the principal entity type to anchor fetches on, instead of the
    /// direct paginated endpoint.
    #[serde(default)]
    pub sync_by: Option<String>,
}

impl Default for EntityRuleConfig {
    fn default() -> Self {
        Self {
            sync: default_sync(),
            filter: None,
            select: None,
            sync_by: None,
        }
    }
}

fn default_sync_unconfigured() -> bool {
    true
}

fn default_sync() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_entities_sync_by_default() {
        let rules: SyncRulesConfig = serde_json::from_str("{}").unwrap();
        assert!(rules.sync_unconfigured);
        assert!(rules.entities.is_empty());
    }

    #[test]
    fn entity_rule_defaults() {
        let rules: SyncRulesConfig =
            serde_json::from_str(r#"{"entities": {"Bill": {}}}"#).unwrap();
        let bill = &rules.entities["Bill"];
        assert!(bill.sync);
        assert!(bill.filter.is_none());
        assert!(bill.select.is_none());
        assert!(bill.sync_by.is_none());
    }

    #[test]
    fn sync_by_parses() {
        let rules: SyncRulesConfig =
            serde_json::from_str(r#"{"entities": {"Voting": {"sync_by": "Vote"}}}"#).unwrap();
        assert_eq!(rules.entities["Voting"].sync_by.as_deref(), Some("Vote"));
    }
}
