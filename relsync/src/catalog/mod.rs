//! Entity type catalog.
//!
//! The catalog is the immutable, per-run description of the remote schema:
//! every entity type with its declared field order and key fields, plus the
//! dependency relations between types. It is loaded once at startup and
//! validated eagerly; all later stages address types through the dense
//! [`EntityTypeId`] indices the catalog hands out.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::bail;
use crate::error::{ErrorKind, SyncResult};

pub mod graph;

/// Dense index of an entity type within the catalog.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityTypeId(pub u32);

impl EntityTypeId {
    /// Returns the id as a usize for arena indexing.
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EntityTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scalar type of a declared field.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int16,
    Int32,
    Int64,
    Double,
    Text,
    Timestamp,
    TimestampTz,
    Uuid,
}

/// A single declared field of an entity type.
#[derive(Debug, Clone, Deserialize)]
pub struct FieldSchema {
    /// Field name as the remote service spells it.
    pub name: String,
    /// Scalar type of the field.
    #[serde(rename = "type")]
    pub ty: FieldType,
    /// Whether the field may be null.
    #[serde(default = "default_nullable")]
    pub nullable: bool,
}

fn default_nullable() -> bool {
    true
}

/// Named schema of a remote record category.
///
/// Field order is the declared order and is meaningful: rows are projected
/// and persisted positionally.
#[derive(Debug, Clone, Deserialize)]
pub struct EntityType {
    /// Entity type name as the remote service spells it.
    pub name: String,
    /// Declared fields, in order.
    pub fields: Vec<FieldSchema>,
    /// Names of the fields forming the primary key.
    pub key_fields: Vec<String>,
}

impl EntityType {
    /// Returns the schema of a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|field| field.name == name)
    }

    /// Returns all field names in declared order.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|field| field.name.clone()).collect()
    }

    /// Returns `true` if `name` is part of the primary key.
    pub fn is_key_field(&self, name: &str) -> bool {
        self.key_fields.iter().any(|key| key == name)
    }
}

/// Principal-side multiplicity of a dependency relation.
///
/// Spelled the way the remote schema spells it: `"1"` for exactly one,
/// `"0..1"` for at most one.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub enum Multiplicity {
    #[serde(rename = "1")]
    ExactlyOne,
    #[serde(rename = "0..1")]
    AtMostOne,
}

/// A dependency relation as declared in a catalog definition, by name.
#[derive(Debug, Clone, Deserialize)]
pub struct RelationDef {
    /// Relation (constraint) name.
    pub name: String,
    /// Name of the referencing entity type.
    pub dependent: String,
    /// Name of the referenced entity type.
    pub principal: String,
    /// Referencing fields on the dependent type.
    pub dependent_fields: Vec<String>,
    /// Referenced fields on the principal type.
    pub principal_fields: Vec<String>,
    /// Multiplicity on the principal side.
    pub principal_multiplicity: Multiplicity,
}

/// A resolved dependency relation between two catalog entity types.
#[derive(Debug, Clone)]
pub struct Relation {
    /// Relation (constraint) name.
    pub name: String,
    /// The referencing entity type.
    pub dependent: EntityTypeId,
    /// The referenced entity type.
    pub principal: EntityTypeId,
    /// Referencing fields on the dependent type.
    pub dependent_fields: Vec<String>,
    /// Referenced fields on the principal type.
    pub principal_fields: Vec<String>,
    /// Multiplicity on the principal side.
    pub principal_multiplicity: Multiplicity,
}

impl Relation {
    /// Returns `true` if the relation references its own entity type.
    ///
    /// Self-references stay in the catalog for diagnostics but never take
    /// part in scheduling.
    pub fn is_self_referencing(&self) -> bool {
        self.dependent == self.principal
    }
}

/// Raw, name-based catalog definition as found in a catalog file.
#[derive(Debug, Clone, Deserialize)]
pub struct CatalogDef {
    pub entity_types: Vec<EntityType>,
    #[serde(default)]
    pub relations: Vec<RelationDef>,
}

/// The validated, resolved catalog.
#[derive(Debug)]
pub struct Catalog {
    entity_types: Vec<EntityType>,
    relations: Vec<Relation>,
    by_name: HashMap<String, EntityTypeId>,
}

impl Catalog {
    /// Builds a catalog from entity types and name-based relations.
    ///
    /// Rejects duplicate type names, types without key fields, key fields not
    /// present in the field list, and relations naming unknown types or
    /// fields or with empty/mismatched field lists.
    pub fn new(entity_types: Vec<EntityType>, relations: Vec<RelationDef>) -> SyncResult<Self> {
        let mut by_name = HashMap::with_capacity(entity_types.len());
        for (index, entity_type) in entity_types.iter().enumerate() {
            if by_name
                .insert(entity_type.name.clone(), EntityTypeId(index as u32))
                .is_some()
            {
                bail!(
                    ErrorKind::CatalogError,
                    "Duplicate entity type name",
                    format!("entity type `{}` is declared twice", entity_type.name)
                );
            }

            if entity_type.key_fields.is_empty() {
                bail!(
                    ErrorKind::CatalogError,
                    "Entity type without key fields",
                    format!("entity type `{}` declares no key fields", entity_type.name)
                );
            }
            for key_field in &entity_type.key_fields {
                if entity_type.field(key_field).is_none() {
                    bail!(
                        ErrorKind::CatalogError,
                        "Key field not declared",
                        format!(
                            "entity type `{}` names key field `{}` which is not in its field list",
                            entity_type.name, key_field
                        )
                    );
                }
            }
        }

        let mut resolved = Vec::with_capacity(relations.len());
        for relation in relations {
            let Some(&dependent) = by_name.get(&relation.dependent) else {
                bail!(
                    ErrorKind::CatalogError,
                    "Relation references unknown dependent",
                    format!(
                        "relation `{}` references unknown entity type `{}`",
                        relation.name, relation.dependent
                    )
                );
            };
            let Some(&principal) = by_name.get(&relation.principal) else {
                bail!(
                    ErrorKind::CatalogError,
                    "Relation references unknown principal",
                    format!(
                        "relation `{}` references unknown entity type `{}`",
                        relation.name, relation.principal
                    )
                );
            };

            if relation.dependent_fields.is_empty()
                || relation.dependent_fields.len() != relation.principal_fields.len()
            {
                bail!(
                    ErrorKind::CatalogError,
                    "Relation field lists are empty or mismatched",
                    format!(
                        "relation `{}` maps {} dependent field(s) to {} principal field(s)",
                        relation.name,
                        relation.dependent_fields.len(),
                        relation.principal_fields.len()
                    )
                );
            }

            for (owner, fields) in [
                (dependent, &relation.dependent_fields),
                (principal, &relation.principal_fields),
            ] {
                let entity_type = &entity_types[owner.index()];
                for field in fields {
                    if entity_type.field(field).is_none() {
                        bail!(
                            ErrorKind::CatalogError,
                            "Relation references unknown field",
                            format!(
                                "relation `{}` references field `{}` not declared on `{}`",
                                relation.name, field, entity_type.name
                            )
                        );
                    }
                }
            }

            resolved.push(Relation {
                name: relation.name,
                dependent,
                principal,
                dependent_fields: relation.dependent_fields,
                principal_fields: relation.principal_fields,
                principal_multiplicity: relation.principal_multiplicity,
            });
        }

        Ok(Self {
            entity_types,
            relations: resolved,
            by_name,
        })
    }

    /// Builds a catalog from a JSON definition.
    pub fn from_json(json: &str) -> SyncResult<Self> {
        let def: CatalogDef = serde_json::from_str(json).map_err(|err| {
            crate::sync_error!(
                ErrorKind::CatalogError,
                "Catalog definition is not valid JSON",
                source: err
            )
        })?;

        Self::new(def.entity_types, def.relations)
    }

    /// Number of entity types in the catalog.
    pub fn len(&self) -> usize {
        self.entity_types.len()
    }

    /// Returns `true` if the catalog has no entity types.
    pub fn is_empty(&self) -> bool {
        self.entity_types.is_empty()
    }

    /// Resolves an entity type name to its id.
    pub fn resolve(&self, name: &str) -> Option<EntityTypeId> {
        self.by_name.get(name).copied()
    }

    /// Returns the entity type for an id handed out by this catalog.
    pub fn entity_type(&self, id: EntityTypeId) -> &EntityType {
        &self.entity_types[id.index()]
    }

    /// Iterates over all entity types with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (EntityTypeId, &EntityType)> {
        self.entity_types
            .iter()
            .enumerate()
            .map(|(index, entity_type)| (EntityTypeId(index as u32), entity_type))
    }

    /// Returns all resolved relations.
    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    /// Returns the relation connecting `dependent` to `principal`, if any.
    pub fn relation_between(
        &self,
        dependent: EntityTypeId,
        principal: EntityTypeId,
    ) -> Option<&Relation> {
        self.relations
            .iter()
            .find(|relation| relation.dependent == dependent && relation.principal == principal)
    }
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use super::*;

    /// A small parliament-flavored catalog used across unit tests.
    pub(crate) fn parliament_catalog() -> Catalog {
        let entity_types = vec![
            EntityType {
                name: "Party".to_string(),
                fields: vec![
                    FieldSchema {
                        name: "ID".to_string(),
                        ty: FieldType::Int32,
                        nullable: false,
                    },
                    FieldSchema {
                        name: "Name".to_string(),
                        ty: FieldType::Text,
                        nullable: false,
                    },
                ],
                key_fields: vec!["ID".to_string()],
            },
            EntityType {
                name: "Member".to_string(),
                fields: vec![
                    FieldSchema {
                        name: "ID".to_string(),
                        ty: FieldType::Int32,
                        nullable: false,
                    },
                    FieldSchema {
                        name: "PartyID".to_string(),
                        ty: FieldType::Int32,
                        nullable: false,
                    },
                    FieldSchema {
                        name: "LastName".to_string(),
                        ty: FieldType::Text,
                        nullable: true,
                    },
                ],
                key_fields: vec!["ID".to_string()],
            },
            EntityType {
                name: "Vote".to_string(),
                fields: vec![
                    FieldSchema {
                        name: "ID".to_string(),
                        ty: FieldType::Int32,
                        nullable: false,
                    },
                    FieldSchema {
                        name: "MemberID".to_string(),
                        ty: FieldType::Int32,
                        nullable: false,
                    },
                ],
                key_fields: vec!["ID".to_string()],
            },
        ];

        let relations = vec![
            RelationDef {
                name: "fk_member_party".to_string(),
                dependent: "Member".to_string(),
                principal: "Party".to_string(),
                dependent_fields: vec!["PartyID".to_string()],
                principal_fields: vec!["ID".to_string()],
                principal_multiplicity: Multiplicity::ExactlyOne,
            },
            RelationDef {
                name: "fk_vote_member".to_string(),
                dependent: "Vote".to_string(),
                principal: "Member".to_string(),
                dependent_fields: vec!["MemberID".to_string()],
                principal_fields: vec!["ID".to_string()],
                principal_multiplicity: Multiplicity::ExactlyOne,
            },
        ];

        Catalog::new(entity_types, relations).unwrap()
    }
}
