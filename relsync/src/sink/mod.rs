//! The relational sink contract and table identity mapping.
//!
//! The sink side of the engine deals in SQL identities: snake_case table and
//! column names derived from the remote schema's CamelCase names, plus the
//! primary-key constraint the idempotent upsert conflicts on. A
//! [`SinkTable`] carries that mapping for one entity type; it is computed
//! once per scheduled type and shared by every batch of that type.

use std::future::Future;
use std::sync::Arc;

use crate::catalog::{EntityType, EntityTypeId, FieldType};
use crate::error::{SyncError, SyncResult};
use crate::types::Row;

pub mod memory;
pub mod postgres;
pub mod writer;

/// Derives the SQL identifier for a remote schema name.
///
/// CamelCase becomes snake_case; runs of uppercase collapse into one word, so
/// `PartyID` maps to `party_id` and `ID` to `id`.
pub fn sql_name(name: &str) -> String {
    let chars: Vec<char> = name.chars().collect();
    let mut out = String::with_capacity(name.len() + 4);

    for (index, c) in chars.iter().enumerate() {
        if c.is_uppercase() {
            let after_lower = index > 0
                && (chars[index - 1].is_lowercase() || chars[index - 1].is_ascii_digit());
            let upper_run_ends = index > 0
                && chars[index - 1].is_uppercase()
                && chars.get(index + 1).is_some_and(|next| next.is_lowercase());

            if after_lower || upper_run_ends {
                out.push('_');
            }
            out.extend(c.to_lowercase());
        } else {
            out.push(*c);
        }
    }

    out
}

/// One column of a sink table.
#[derive(Debug, Clone)]
pub struct SinkColumn {
    /// SQL column name.
    pub name: String,
    /// Remote field name the column is fed from.
    pub field: String,
    /// Scalar type, used by typed sinks to decode and bind values.
    pub ty: FieldType,
    /// Whether the column is part of the primary key.
    pub primary_key: bool,
}

/// SQL identity of one entity type's target table.
#[derive(Debug, Clone)]
pub struct SinkTable {
    /// Entity type this table mirrors.
    pub entity_type: EntityTypeId,
    /// Table name.
    pub table: String,
    /// Primary-key constraint name the upsert conflicts on.
    pub pk_constraint: String,
    /// Columns in persistence order, matching row value order positionally.
    pub columns: Vec<SinkColumn>,
}

impl SinkTable {
    /// Builds the table identity for an entity type.
    ///
    /// `fields` restricts and orders the persisted columns; the full declared
    /// field order applies when unset. Callers have validated the subset
    /// against the catalog already.
    pub fn for_entity_type(
        id: EntityTypeId,
        entity_type: &EntityType,
        fields: Option<&[String]>,
    ) -> Self {
        let field_names: Vec<String> = match fields {
            Some(subset) => subset.to_vec(),
            None => entity_type.field_names(),
        };

        let columns = field_names
            .iter()
            .map(|field| {
                let schema = entity_type
                    .field(field)
                    .expect("field subsets are validated against the catalog");
                SinkColumn {
                    name: sql_name(field),
                    field: field.clone(),
                    ty: schema.ty,
                    primary_key: entity_type.is_key_field(field),
                }
            })
            .collect();

        Self {
            entity_type: id,
            table: sql_name(&entity_type.name),
            pk_constraint: sql_name(&format!("{}_pkey", entity_type.name)),
            columns,
        }
    }

    /// Remote field names in persistence order.
    pub fn source_fields(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.field.clone()).collect()
    }

    /// SQL column names in persistence order.
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Columns matching the given remote field names, in their order.
    pub fn columns_for_fields(&self, fields: &[String]) -> Vec<SinkColumn> {
        fields
            .iter()
            .filter_map(|field| self.columns.iter().find(|c| &c.field == field).cloned())
            .collect()
    }

    /// Positions of the primary-key columns within the column list.
    pub fn key_positions(&self) -> Vec<usize> {
        self.columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.primary_key)
            .map(|(index, _)| index)
            .collect()
    }
}

/// A batch of rows ready for persistence, produced by a fetch worker.
#[derive(Debug)]
pub struct PersistBatch {
    /// Target table identity.
    pub table: Arc<SinkTable>,
    /// Rows in column order.
    pub rows: Vec<Row>,
}

/// Outcome classification of a failed bulk upsert.
#[derive(Debug)]
pub enum SinkWriteError {
    /// A row inside the batch was rejected; the batch may succeed in parts.
    Data(SyncError),
    /// The generated statement itself failed; retrying cannot help.
    Statement(SyncError),
}

/// Trait for relational stores the engine can replicate into.
///
/// `upsert_batch` must be idempotent per primary key: re-delivery of a row
/// must not create duplicates and must leave the last delivered values in
/// place.
pub trait RelationalSink: Send + Sync + 'static {
    /// Reads the given columns of every persisted row of `table`.
    fn read_all_keys(
        &self,
        table: &SinkTable,
        key_columns: &[SinkColumn],
    ) -> impl Future<Output = SyncResult<Vec<Vec<crate::types::Value>>>> + Send;

    /// Performs one bulk insert-or-update of `rows` into `table`.
    fn upsert_batch(
        &self,
        table: &SinkTable,
        rows: &[Row],
    ) -> impl Future<Output = Result<(), SinkWriteError>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;

    #[test]
    fn sql_names_are_snake_case() {
        assert_eq!(sql_name("Party"), "party");
        assert_eq!(sql_name("PartyID"), "party_id");
        assert_eq!(sql_name("ID"), "id");
        assert_eq!(sql_name("MemberCouncilHistory"), "member_council_history");
        assert_eq!(sql_name("Voting_pkey"), "voting_pkey");
    }

    #[test]
    fn table_identity_follows_declared_order() {
        let catalog = parliament_catalog();
        let member = catalog.resolve("Member").unwrap();

        let table = SinkTable::for_entity_type(member, catalog.entity_type(member), None);

        assert_eq!(table.table, "member");
        assert_eq!(table.pk_constraint, "member_pkey");
        assert_eq!(table.column_names(), vec!["id", "party_id", "last_name"]);
        assert_eq!(table.key_positions(), vec![0]);
    }

    #[test]
    fn field_subset_restricts_and_orders_columns() {
        let catalog = parliament_catalog();
        let member = catalog.resolve("Member").unwrap();

        let subset = vec!["PartyID".to_string(), "ID".to_string()];
        let table =
            SinkTable::for_entity_type(member, catalog.entity_type(member), Some(&subset));

        assert_eq!(table.column_names(), vec!["party_id", "id"]);
        assert_eq!(table.key_positions(), vec![1]);
    }
}
