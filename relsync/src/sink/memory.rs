//! In-memory relational sink for testing and development.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::error::{ErrorKind, SyncResult};
use crate::sink::{RelationalSink, SinkColumn, SinkTable, SinkWriteError};
use crate::sync_error;
use crate::types::{Row, Value};

/// One stored table: column names and rows keyed by their rendered primary
/// key.
#[derive(Debug, Default)]
struct StoredTable {
    columns: Vec<String>,
    rows: BTreeMap<String, Row>,
}

#[derive(Debug, Default)]
struct Inner {
    tables: HashMap<String, StoredTable>,
    /// Keys that fail with a data-level error on upsert, per table.
    poisoned: HashSet<(String, String)>,
    /// Tables whose upserts fail with a statement-level error.
    statement_failures: HashSet<String>,
    upsert_calls: u64,
}

/// In-memory sink for tests and development runs.
///
/// Upserts are idempotent per primary key, like the real store. Tests can
/// script failures: [`MemorySink::poison`] makes individual rows fail with a
/// data-level error (exercising bisection), [`MemorySink::fail_statements`]
/// makes a whole table fail at the statement level. A failed upsert call
/// writes nothing, matching transactional rollback semantics.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    inner: Arc<Mutex<Inner>>,
}

fn key_repr(values: &[&Value]) -> String {
    values
        .iter()
        .map(|value| value.filter_literal())
        .collect::<Vec<_>>()
        .join("\u{1f}")
}

impl MemorySink {
    /// Creates a new empty memory sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks the row of `table` with the given key values as rejected.
    pub async fn poison(&self, table: &str, key_values: &[Value]) {
        let mut inner = self.inner.lock().await;
        let refs: Vec<&Value> = key_values.iter().collect();
        inner.poisoned.insert((table.to_string(), key_repr(&refs)));
    }

    /// Makes every upsert into `table` fail with a statement-level error.
    pub async fn fail_statements(&self, table: &str) {
        let mut inner = self.inner.lock().await;
        inner.statement_failures.insert(table.to_string());
    }

    /// Number of rows currently stored in `table`.
    pub async fn row_count(&self, table: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|stored| stored.rows.len())
            .unwrap_or(0)
    }

    /// All rows of `table` in key order.
    pub async fn table_rows(&self, table: &str) -> Vec<Row> {
        let inner = self.inner.lock().await;
        inner
            .tables
            .get(table)
            .map(|stored| stored.rows.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Total number of upsert calls made so far, including failed ones.
    pub async fn upsert_calls(&self) -> u64 {
        let inner = self.inner.lock().await;
        inner.upsert_calls
    }
}

impl RelationalSink for MemorySink {
    async fn read_all_keys(
        &self,
        table: &SinkTable,
        key_columns: &[SinkColumn],
    ) -> SyncResult<Vec<Vec<Value>>> {
        let inner = self.inner.lock().await;

        let Some(stored) = inner.tables.get(&table.table) else {
            return Ok(Vec::new());
        };

        let mut positions = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            let Some(position) = stored.columns.iter().position(|name| name == &column.name)
            else {
                return Err(sync_error!(
                    ErrorKind::SinkQueryFailed,
                    "Key column not present in stored table",
                    format!("table `{}` has no column `{}`", table.table, column.name)
                ));
            };
            positions.push(position);
        }

        Ok(stored
            .rows
            .values()
            .map(|row| {
                positions
                    .iter()
                    .map(|&position| row.values()[position].clone())
                    .collect()
            })
            .collect())
    }

    async fn upsert_batch(&self, table: &SinkTable, rows: &[Row]) -> Result<(), SinkWriteError> {
        let mut inner = self.inner.lock().await;
        inner.upsert_calls += 1;

        if inner.statement_failures.contains(&table.table) {
            return Err(SinkWriteError::Statement(sync_error!(
                ErrorKind::SinkStatementFailed,
                "Upsert statement rejected",
                format!("statement against `{}` failed", table.table)
            )));
        }

        let key_positions = table.key_positions();

        // Scan the whole batch before touching state; a failed call must
        // leave the table unchanged, like a rolled-back transaction.
        for row in rows {
            if row.len() != table.columns.len() {
                return Err(SinkWriteError::Statement(sync_error!(
                    ErrorKind::SinkStatementFailed,
                    "Row width does not match column list",
                    format!(
                        "table `{}` expects {} values, row has {}",
                        table.table,
                        table.columns.len(),
                        row.len()
                    )
                )));
            }

            let key: Vec<&Value> = key_positions.iter().map(|&p| &row.values()[p]).collect();
            if inner.poisoned.contains(&(table.table.clone(), key_repr(&key))) {
                return Err(SinkWriteError::Data(sync_error!(
                    ErrorKind::SinkRowRejected,
                    "Row violates a column constraint",
                    format!("rejected row with key ({})", key_repr(&key))
                )));
            }
        }

        let stored = inner.tables.entry(table.table.clone()).or_default();
        if stored.columns.is_empty() {
            stored.columns = table.columns.iter().map(|c| c.name.clone()).collect();
        }

        for row in rows {
            let key: Vec<&Value> = key_positions.iter().map(|&p| &row.values()[p]).collect();
            stored.rows.insert(key_repr(&key), row.clone());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;

    fn party_table() -> SinkTable {
        let catalog = parliament_catalog();
        let party = catalog.resolve("Party").unwrap();
        SinkTable::for_entity_type(party, catalog.entity_type(party), None)
    }

    #[tokio::test]
    async fn upsert_replaces_by_key() {
        let sink = MemorySink::new();
        let table = party_table();

        let first = Row::new(vec![Value::I32(1), Value::Text("Old".to_string())]);
        let second = Row::new(vec![Value::I32(1), Value::Text("New".to_string())]);

        sink.upsert_batch(&table, &[first]).await.unwrap();
        sink.upsert_batch(&table, &[second.clone()]).await.unwrap();

        assert_eq!(sink.table_rows("party").await, vec![second]);
    }

    #[tokio::test]
    async fn failed_batch_writes_nothing() {
        let sink = MemorySink::new();
        let table = party_table();

        sink.poison("party", &[Value::I32(2)]).await;

        let rows = vec![
            Row::new(vec![Value::I32(1), Value::Text("A".to_string())]),
            Row::new(vec![Value::I32(2), Value::Text("B".to_string())]),
        ];
        assert!(matches!(
            sink.upsert_batch(&table, &rows).await,
            Err(SinkWriteError::Data(_))
        ));
        assert_eq!(sink.row_count("party").await, 0);
    }

    #[tokio::test]
    async fn reads_back_key_tuples() {
        let sink = MemorySink::new();
        let table = party_table();

        let rows = vec![
            Row::new(vec![Value::I32(2), Value::Text("B".to_string())]),
            Row::new(vec![Value::I32(1), Value::Text("A".to_string())]),
        ];
        sink.upsert_batch(&table, &rows).await.unwrap();

        let key_columns = table.columns_for_fields(&["ID".to_string()]);
        let keys = sink.read_all_keys(&table, &key_columns).await.unwrap();

        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&vec![Value::I32(1)]));
        assert!(keys.contains(&vec![Value::I32(2)]));
    }
}
