//! Per-run synchronization configuration.
//!
//! [`SyncConfig`] is built once through [`SyncConfigBuilder`], validated
//! eagerly against the catalog and dependency graph, and read-only from then
//! on. All configuration mistakes (unknown type names, key-anchored fetch on
//! a relation that does not qualify, field subsets missing mandatory fields)
//! surface here, before any network or database activity.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use relsync_config::shared::SyncRulesConfig;
use tracing::warn;

use crate::bail;
use crate::catalog::graph::DependencyGraph;
use crate::catalog::{Catalog, EntityTypeId, Multiplicity};
use crate::error::{ErrorKind, SyncResult};

/// Validated per-entity-type settings.
#[derive(Debug, Clone, Default)]
pub struct TypeSettings {
    /// Filter expression restricting which records are fetched; the global
    /// filter is already folded in.
    pub filter: Option<String>,
    /// Explicit field subset, in the order fields will be projected and
    /// persisted; full declared order when unset.
    pub fields: Option<Vec<String>>,
    /// Principal type to anchor fetches on instead of the paginated endpoint.
    pub fetch_by: Option<EntityTypeId>,
}

/// The validated, immutable configuration of one synchronization run.
#[derive(Debug)]
pub struct SyncConfig {
    included: Vec<EntityTypeId>,
    settings: HashMap<EntityTypeId, TypeSettings>,
}

impl SyncConfig {
    /// Starts a builder over the given catalog and graph.
    pub fn builder<'a>(
        catalog: &'a Catalog,
        graph: &'a DependencyGraph,
    ) -> SyncConfigBuilder<'a> {
        SyncConfigBuilder {
            catalog,
            graph,
            include_all: false,
            include: Vec::new(),
            skip: Vec::new(),
            global_filter: None,
            filters: BTreeMap::new(),
            field_subsets: BTreeMap::new(),
            fetch_by: BTreeMap::new(),
        }
    }

    /// Builds a configuration straight from the file-level sync rules.
    pub fn from_rules(
        catalog: &Catalog,
        graph: &DependencyGraph,
        rules: &SyncRulesConfig,
    ) -> SyncResult<Self> {
        let mut builder = Self::builder(catalog, graph);

        if rules.sync_unconfigured {
            builder = builder.include_all();
        }
        if let Some(filter) = &rules.filter {
            builder = builder.global_filter(filter);
        }

        for (name, rule) in &rules.entities {
            if rule.sync {
                builder = builder.include(name);
            } else {
                builder = builder.skip(name);
            }
            if let Some(filter) = &rule.filter {
                builder = builder.filter(name, filter);
            }
            if let Some(select) = &rule.select {
                builder = builder.fields(name, select.clone());
            }
            if let Some(principal) = &rule.sync_by {
                builder = builder.fetch_by(name, principal);
            }
        }

        builder.build()
    }

    /// Entity types selected for this run, in catalog order.
    pub fn included(&self) -> &[EntityTypeId] {
        &self.included
    }

    /// Returns `true` if the entity type takes part in this run.
    pub fn is_included(&self, id: EntityTypeId) -> bool {
        self.included.binary_search(&id).is_ok()
    }

    /// Filter expression for an entity type, if any.
    pub fn filter(&self, id: EntityTypeId) -> Option<&str> {
        self.settings.get(&id)?.filter.as_deref()
    }

    /// Explicit field subset for an entity type, if any.
    pub fn fields(&self, id: EntityTypeId) -> Option<&[String]> {
        self.settings.get(&id)?.fields.as_deref()
    }

    /// Principal anchoring the entity type's fetches, if opted in.
    pub fn fetch_by(&self, id: EntityTypeId) -> Option<EntityTypeId> {
        self.settings.get(&id)?.fetch_by
    }
}

/// Validating builder for [`SyncConfig`].
///
/// Collects raw, name-based settings and performs every check in
/// [`SyncConfigBuilder::build`], so that errors carry the offending names.
#[derive(Debug)]
pub struct SyncConfigBuilder<'a> {
    catalog: &'a Catalog,
    graph: &'a DependencyGraph,
    include_all: bool,
    include: Vec<String>,
    skip: Vec<String>,
    global_filter: Option<String>,
    filters: BTreeMap<String, String>,
    field_subsets: BTreeMap<String, Vec<String>>,
    fetch_by: BTreeMap<String, String>,
}

impl<'a> SyncConfigBuilder<'a> {
    /// Includes every catalog entity type.
    pub fn include_all(mut self) -> Self {
        self.include_all = true;
        self
    }

    /// Includes an entity type; its dependencies are pulled in automatically.
    pub fn include(mut self, name: impl Into<String>) -> Self {
        self.include.push(name.into());
        self
    }

    /// Forcefully excludes an entity type, even when it is a dependency of an
    /// included one.
    pub fn skip(mut self, name: impl Into<String>) -> Self {
        self.skip.push(name.into());
        self
    }

    /// Filter applied to every included entity type.
    pub fn global_filter(mut self, filter: impl Into<String>) -> Self {
        self.global_filter = Some(filter.into());
        self
    }

    /// Per-type filter, combined with the global one as `(global) and (type)`.
    pub fn filter(mut self, name: impl Into<String>, filter: impl Into<String>) -> Self {
        self.filters.insert(name.into(), filter.into());
        self
    }

    /// Explicit field subset for an entity type.
    pub fn fields(mut self, name: impl Into<String>, fields: Vec<String>) -> Self {
        self.field_subsets.insert(name.into(), fields);
        self
    }

    /// Anchors an entity type's fetches on the keys of `principal`.
    pub fn fetch_by(mut self, name: impl Into<String>, principal: impl Into<String>) -> Self {
        self.fetch_by.insert(name.into(), principal.into());
        self
    }

    /// Validates everything and produces the immutable [`SyncConfig`].
    pub fn build(self) -> SyncResult<SyncConfig> {
        let resolve = |name: &str| -> SyncResult<EntityTypeId> {
            match self.catalog.resolve(name) {
                Some(id) => Ok(id),
                None => Err(crate::sync_error!(
                    ErrorKind::ConfigError,
                    "Unknown entity type",
                    format!("`{name}` is not part of the catalog")
                )),
            }
        };

        let mut skipped = BTreeSet::new();
        for name in &self.skip {
            skipped.insert(resolve(name)?);
        }

        // The included set is closed over dependencies; a type cannot be
        // synchronized before the types it references.
        let mut included = BTreeSet::new();
        if self.include_all {
            included.extend(self.catalog.iter().map(|(id, _)| id));
        } else {
            for name in &self.include {
                let id = resolve(name)?;
                included.insert(id);
                included.extend(self.graph.transitive_dependencies(id));
            }
        }

        for id in &skipped {
            if included.remove(id) {
                warn!(
                    entity_type = %self.catalog.entity_type(*id).name,
                    "entity type skipped on request; referential completeness is not guaranteed"
                );
            }
        }

        let mut settings: HashMap<EntityTypeId, TypeSettings> = HashMap::new();

        for (name, filter) in &self.filters {
            let id = resolve(name)?;
            settings.entry(id).or_default().filter = Some(filter.clone());
        }

        // Fold the global filter into every included type.
        if let Some(global) = &self.global_filter {
            for id in &included {
                let entry = settings.entry(*id).or_default();
                entry.filter = Some(match entry.filter.take() {
                    Some(own) => format!("({global}) and ({own})"),
                    None => global.clone(),
                });
            }
        }

        for (name, fields) in &self.field_subsets {
            let id = resolve(name)?;
            let entity_type = self.catalog.entity_type(id);

            for field in fields {
                if entity_type.field(field).is_none() {
                    bail!(
                        ErrorKind::ConfigError,
                        "Field subset references unknown field",
                        format!("`{name}` has no field `{field}`")
                    );
                }
            }
            for key_field in &entity_type.key_fields {
                if !fields.contains(key_field) {
                    bail!(
                        ErrorKind::ConfigError,
                        "Field subset misses a key field",
                        format!("subset for `{name}` must contain key field `{key_field}`")
                    );
                }
            }
            for field in &entity_type.fields {
                if !field.nullable && !fields.contains(&field.name) {
                    bail!(
                        ErrorKind::ConfigError,
                        "Field subset misses a non-nullable field",
                        format!(
                            "subset for `{name}` must contain non-nullable field `{}`",
                            field.name
                        )
                    );
                }
            }

            settings.entry(id).or_default().fields = Some(fields.clone());
        }

        for (name, principal_name) in &self.fetch_by {
            let dependent = resolve(name)?;
            let principal = resolve(principal_name)?;

            let Some(relation) = self.catalog.relation_between(dependent, principal) else {
                bail!(
                    ErrorKind::ConfigError,
                    "Key-anchored fetch without a dependency link",
                    format!("`{name}` has no dependency relation towards `{principal_name}`")
                );
            };
            if relation.is_self_referencing() {
                bail!(
                    ErrorKind::ConfigError,
                    "Key-anchored fetch on a self-reference",
                    format!("`{name}` cannot be anchored on its own keys")
                );
            }
            if relation.principal_multiplicity != Multiplicity::ExactlyOne {
                bail!(
                    ErrorKind::ConfigError,
                    "Key-anchored fetch requires an exactly-one principal",
                    format!(
                        "relation `{}` has multiplicity `0..1` on the `{principal_name}` side",
                        relation.name
                    )
                );
            }
            if skipped.contains(&principal) {
                bail!(
                    ErrorKind::ConfigError,
                    "Key-anchored fetch on a skipped principal",
                    format!("`{name}` is anchored on `{principal_name}`, which is skipped")
                );
            }

            settings.entry(dependent).or_default().fetch_by = Some(principal);
        }

        Ok(SyncConfig {
            included: included.into_iter().collect(),
            settings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;
    use crate::catalog::{EntityType, FieldSchema, FieldType, RelationDef};

    fn catalog_and_graph() -> (Catalog, DependencyGraph) {
        let catalog = parliament_catalog();
        let graph = DependencyGraph::build(&catalog).unwrap();
        (catalog, graph)
    }

    #[test]
    fn unknown_type_fails_eagerly() {
        let (catalog, graph) = catalog_and_graph();

        let err = SyncConfig::builder(&catalog, &graph)
            .include("Bogus")
            .build()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(err.detail().unwrap().contains("Bogus"));
    }

    #[test]
    fn include_pulls_dependencies() {
        let (catalog, graph) = catalog_and_graph();

        let config = SyncConfig::builder(&catalog, &graph)
            .include("Vote")
            .build()
            .unwrap();

        for name in ["Party", "Member", "Vote"] {
            assert!(config.is_included(catalog.resolve(name).unwrap()));
        }
    }

    #[test]
    fn skip_wins_over_dependency_closure() {
        let (catalog, graph) = catalog_and_graph();

        let config = SyncConfig::builder(&catalog, &graph)
            .include("Member")
            .skip("Party")
            .build()
            .unwrap();

        assert!(config.is_included(catalog.resolve("Member").unwrap()));
        assert!(!config.is_included(catalog.resolve("Party").unwrap()));
    }

    #[test]
    fn global_and_type_filters_combine() {
        let (catalog, graph) = catalog_and_graph();

        let config = SyncConfig::builder(&catalog, &graph)
            .include_all()
            .global_filter("Language eq 'DE'")
            .filter("Member", "ID gt 10")
            .build()
            .unwrap();

        let member = catalog.resolve("Member").unwrap();
        let party = catalog.resolve("Party").unwrap();

        assert_eq!(
            config.filter(member),
            Some("(Language eq 'DE') and (ID gt 10)")
        );
        assert_eq!(config.filter(party), Some("Language eq 'DE'"));
    }

    #[test]
    fn fetch_by_requires_a_real_relation() {
        let (catalog, graph) = catalog_and_graph();

        let err = SyncConfig::builder(&catalog, &graph)
            .include_all()
            .fetch_by("Party", "Vote")
            .build()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
    }

    #[test]
    fn fetch_by_rejects_at_most_one_principal() {
        let catalog = Catalog::new(
            vec![
                EntityType {
                    name: "Session".to_string(),
                    fields: vec![FieldSchema {
                        name: "ID".to_string(),
                        ty: FieldType::Int32,
                        nullable: false,
                    }],
                    key_fields: vec!["ID".to_string()],
                },
                EntityType {
                    name: "Meeting".to_string(),
                    fields: vec![
                        FieldSchema {
                            name: "ID".to_string(),
                            ty: FieldType::Int32,
                            nullable: false,
                        },
                        FieldSchema {
                            name: "SessionID".to_string(),
                            ty: FieldType::Int32,
                            nullable: true,
                        },
                    ],
                    key_fields: vec!["ID".to_string()],
                },
            ],
            vec![RelationDef {
                name: "fk_meeting_session".to_string(),
                dependent: "Meeting".to_string(),
                principal: "Session".to_string(),
                dependent_fields: vec!["SessionID".to_string()],
                principal_fields: vec!["ID".to_string()],
                principal_multiplicity: Multiplicity::AtMostOne,
            }],
        )
        .unwrap();
        let graph = DependencyGraph::build(&catalog).unwrap();

        let err = SyncConfig::builder(&catalog, &graph)
            .include_all()
            .fetch_by("Meeting", "Session")
            .build()
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::ConfigError);
        assert!(err.detail().unwrap().contains("0..1"));
    }

    #[test]
    fn field_subset_must_cover_key_and_non_nullable_fields() {
        let (catalog, graph) = catalog_and_graph();

        // Missing the key field.
        let err = SyncConfig::builder(&catalog, &graph)
            .include_all()
            .fields("Member", vec!["PartyID".to_string(), "LastName".to_string()])
            .build()
            .unwrap_err();
        assert!(err.detail().unwrap().contains("key field `ID`"));

        // Missing a non-nullable field.
        let err = SyncConfig::builder(&catalog, &graph)
            .include_all()
            .fields("Member", vec!["ID".to_string(), "LastName".to_string()])
            .build()
            .unwrap_err();
        assert!(err.detail().unwrap().contains("non-nullable field `PartyID`"));

        // A complete subset passes and keeps its order.
        let config = SyncConfig::builder(&catalog, &graph)
            .include_all()
            .fields("Member", vec!["PartyID".to_string(), "ID".to_string()])
            .build()
            .unwrap();
        let member = catalog.resolve("Member").unwrap();
        assert_eq!(
            config.fields(member).unwrap(),
            &["PartyID".to_string(), "ID".to_string()]
        );
    }

    #[test]
    fn rules_config_round_trips() {
        let (catalog, graph) = catalog_and_graph();

        let rules: SyncRulesConfig = serde_json::from_str(
            r#"{
                "sync_unconfigured": true,
                "entities": {
                    "Vote": {"sync_by": "Member"}
                }
            }"#,
        )
        .unwrap();

        let config = SyncConfig::from_rules(&catalog, &graph, &rules).unwrap();
        let vote = catalog.resolve("Vote").unwrap();
        let member = catalog.resolve("Member").unwrap();

        assert_eq!(config.fetch_by(vote), Some(member));
        assert_eq!(config.included().len(), 3);
    }
}
