//! Postgres relational sink.
//!
//! Mirrors entity types into one schema of a Postgres database. The upsert is
//! the classic `INSERT … ON CONFLICT ON CONSTRAINT <pkey> DO UPDATE SET
//! c = EXCLUDED.c`, executed row by row inside one transaction per batch, so
//! a failed batch leaves the table untouched and bisection can retry halves.
//!
//! Error classification follows SQLSTATE classes: 22 (data exception) and 23
//! (integrity violation) are data-level and recoverable per row; everything
//! else is a statement-level defect that aborts the run.

use sqlx::postgres::{PgArguments, PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::query::Query;
use sqlx::{Postgres, Row as _};

use chrono::{DateTime, NaiveDateTime, Utc};
use uuid::Uuid;

use crate::catalog::FieldType;
use crate::error::{ErrorKind, SyncResult};
use crate::sink::{RelationalSink, SinkColumn, SinkTable, SinkWriteError};
use crate::sync_error;
use crate::types::{Row, Value};

/// Upper bound on pooled connections; the engine has a single writer, the
/// remaining connections serve key reads.
const MAX_POOL_CONNECTIONS: u32 = 4;

/// Postgres-backed [`RelationalSink`].
#[derive(Debug, Clone)]
pub struct PostgresSink {
    pool: PgPool,
    schema: String,
}

impl PostgresSink {
    /// Connects a new pool against the given options.
    pub async fn connect(
        options: PgConnectOptions,
        schema: impl Into<String>,
    ) -> SyncResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_POOL_CONNECTIONS)
            .connect_with(options)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::SinkQueryFailed,
                    "Failed to connect to the target database",
                    source: err
                )
            })?;

        Ok(Self::new(pool, schema))
    }

    /// Wraps an existing pool.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }
}

impl RelationalSink for PostgresSink {
    async fn read_all_keys(
        &self,
        table: &SinkTable,
        key_columns: &[SinkColumn],
    ) -> SyncResult<Vec<Vec<Value>>> {
        let column_list = key_columns
            .iter()
            .map(|column| quote_ident(&column.name))
            .collect::<Vec<_>>()
            .join(", ");
        let statement = format!(
            "SELECT {column_list} FROM {}.{}",
            quote_ident(&self.schema),
            quote_ident(&table.table)
        );

        let rows = sqlx::query(&statement)
            .fetch_all(&self.pool)
            .await
            .map_err(|err| {
                sync_error!(
                    ErrorKind::SinkQueryFailed,
                    "Failed to read persisted keys",
                    format!("query `{statement}` failed"),
                    source: err
                )
            })?;

        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let mut key = Vec::with_capacity(key_columns.len());
            for (index, column) in key_columns.iter().enumerate() {
                key.push(decode_value(&row, index, column)?);
            }
            keys.push(key);
        }

        Ok(keys)
    }

    async fn upsert_batch(&self, table: &SinkTable, rows: &[Row]) -> Result<(), SinkWriteError> {
        let statement = build_upsert_statement(&self.schema, table);

        let mut tx = self.pool.begin().await.map_err(|err| {
            SinkWriteError::Statement(sync_error!(
                ErrorKind::SinkStatementFailed,
                "Failed to open a sink transaction",
                source: err
            ))
        })?;

        for row in rows {
            let mut query = sqlx::query(&statement);
            for (value, column) in row.values().iter().zip(&table.columns) {
                query = bind_value(query, value, column.ty);
            }

            if let Err(err) = query.execute(&mut *tx).await {
                let classified = classify_error(err, &statement);
                let _ = tx.rollback().await;
                return Err(classified);
            }
        }

        tx.commit().await.map_err(|err| {
            SinkWriteError::Statement(sync_error!(
                ErrorKind::SinkStatementFailed,
                "Failed to commit a sink transaction",
                source: err
            ))
        })
    }
}

/// Quotes an SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Builds the idempotent upsert statement for one table.
fn build_upsert_statement(schema: &str, table: &SinkTable) -> String {
    let columns: Vec<String> = table
        .columns
        .iter()
        .map(|column| quote_ident(&column.name))
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("${i}")).collect();
    let updates: Vec<String> = columns
        .iter()
        .map(|column| format!("{column} = EXCLUDED.{column}"))
        .collect();

    format!(
        "INSERT INTO {}.{} ({}) VALUES ({}) ON CONFLICT ON CONSTRAINT {} DO UPDATE SET {}",
        quote_ident(schema),
        quote_ident(&table.table),
        columns.join(", "),
        placeholders.join(", "),
        quote_ident(&table.pk_constraint),
        updates.join(", ")
    )
}

/// SQLSTATE classes 22 and 23 are row-level data faults; everything else is a
/// statement defect.
fn classify_error(err: sqlx::Error, statement: &str) -> SinkWriteError {
    if let sqlx::Error::Database(db_err) = &err {
        if let Some(code) = db_err.code() {
            if code.starts_with("22") || code.starts_with("23") {
                return SinkWriteError::Data(sync_error!(
                    ErrorKind::SinkRowRejected,
                    "Row rejected by the database",
                    format!("sqlstate {code}"),
                    source: err
                ));
            }
        }
    }

    SinkWriteError::Statement(sync_error!(
        ErrorKind::SinkStatementFailed,
        "Upsert statement failed",
        format!("statement: {statement}"),
        source: err
    ))
}

fn bind_value<'q>(
    query: Query<'q, Postgres, PgArguments>,
    value: &Value,
    ty: FieldType,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => bind_null(query, ty),
        Value::Bool(v) => query.bind(*v),
        Value::I16(v) => query.bind(*v),
        Value::I32(v) => query.bind(*v),
        Value::I64(v) => query.bind(*v),
        Value::F64(v) => query.bind(*v),
        Value::Text(v) => query.bind(v.clone()),
        Value::Timestamp(v) => query.bind(*v),
        Value::TimestampTz(v) => query.bind(*v),
        Value::Uuid(v) => query.bind(*v),
    }
}

/// Nulls must be bound with the column's concrete type for the wire protocol.
fn bind_null<'q>(
    query: Query<'q, Postgres, PgArguments>,
    ty: FieldType,
) -> Query<'q, Postgres, PgArguments> {
    match ty {
        FieldType::Bool => query.bind(None::<bool>),
        FieldType::Int16 => query.bind(None::<i16>),
        FieldType::Int32 => query.bind(None::<i32>),
        FieldType::Int64 => query.bind(None::<i64>),
        FieldType::Double => query.bind(None::<f64>),
        FieldType::Text => query.bind(None::<String>),
        FieldType::Timestamp => query.bind(None::<NaiveDateTime>),
        FieldType::TimestampTz => query.bind(None::<DateTime<Utc>>),
        FieldType::Uuid => query.bind(None::<Uuid>),
    }
}

fn decode_value(
    row: &sqlx::postgres::PgRow,
    index: usize,
    column: &SinkColumn,
) -> SyncResult<Value> {
    let decode_failed = |err: sqlx::Error| {
        sync_error!(
            ErrorKind::SinkQueryFailed,
            "Failed to decode a key column",
            format!("column `{}`", column.name),
            source: err
        )
    };

    let value = match column.ty {
        FieldType::Bool => row
            .try_get::<Option<bool>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::Bool),
        FieldType::Int16 => row
            .try_get::<Option<i16>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::I16),
        FieldType::Int32 => row
            .try_get::<Option<i32>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::I32),
        FieldType::Int64 => row
            .try_get::<Option<i64>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::I64),
        FieldType::Double => row
            .try_get::<Option<f64>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::F64),
        FieldType::Text => row
            .try_get::<Option<String>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::Text),
        FieldType::Timestamp => row
            .try_get::<Option<NaiveDateTime>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::Timestamp),
        FieldType::TimestampTz => row
            .try_get::<Option<DateTime<Utc>>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::TimestampTz),
        FieldType::Uuid => row
            .try_get::<Option<Uuid>, _>(index)
            .map_err(decode_failed)?
            .map_or(Value::Null, Value::Uuid),
    };

    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;

    #[test]
    fn upsert_statement_shape() {
        let catalog = parliament_catalog();
        let party = catalog.resolve("Party").unwrap();
        let table = SinkTable::for_entity_type(party, catalog.entity_type(party), None);

        let statement = build_upsert_statement("odata", &table);

        assert_eq!(
            statement,
            "INSERT INTO \"odata\".\"party\" (\"id\", \"name\") VALUES ($1, $2) \
             ON CONFLICT ON CONSTRAINT \"party_pkey\" DO UPDATE SET \
             \"id\" = EXCLUDED.\"id\", \"name\" = EXCLUDED.\"name\""
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("party"), "\"party\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
