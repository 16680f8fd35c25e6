//! Idempotent batch persistence with bisection fault isolation.
//!
//! The writer applies one [`PersistBatch`] at a time; the scheduler's
//! control loop is its only caller, which serializes all writes per table.
//! A statement-level failure aborts the run. A data-level failure triggers
//! bisection: the batch is halved and each half retried independently until
//! failing single rows are isolated, logged, and dropped. Poison rows cost a
//! logarithmic number of round trips instead of one per row.

use std::sync::Arc;

use tracing::{debug, error};

use crate::error::SyncResult;
use crate::sink::{PersistBatch, RelationalSink, SinkWriteError};
use crate::types::Row;

/// Row accounting of one applied batch.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Rows the sink accepted.
    pub written: u64,
    /// Rows isolated and dropped by bisection.
    pub rejected: u64,
}

/// Applies persistence batches against a [`RelationalSink`].
#[derive(Debug)]
pub struct SinkWriter<D> {
    sink: Arc<D>,
}

impl<D> SinkWriter<D>
where
    D: RelationalSink,
{
    /// Creates a writer over a shared sink.
    pub fn new(sink: Arc<D>) -> Self {
        Self { sink }
    }

    /// Applies one batch, isolating rejected rows via bisection.
    ///
    /// Returns the row accounting on success; only a statement-level sink
    /// error propagates as a run failure.
    pub async fn write(&self, batch: &PersistBatch) -> SyncResult<BatchOutcome> {
        let mut outcome = BatchOutcome::default();

        debug!(
            table = %batch.table.table,
            rows = batch.rows.len(),
            "applying persistence batch"
        );

        // Explicit work stack instead of recursion; sub-batches are slices of
        // the original rows, so bisection allocates nothing.
        let mut pending: Vec<&[Row]> = vec![&batch.rows];
        while let Some(rows) = pending.pop() {
            if rows.is_empty() {
                continue;
            }

            match self.sink.upsert_batch(&batch.table, rows).await {
                Ok(()) => {
                    outcome.written += rows.len() as u64;
                }
                Err(SinkWriteError::Statement(err)) => {
                    error!(
                        table = %batch.table.table,
                        error = %err,
                        "upsert statement failed"
                    );
                    return Err(err);
                }
                Err(SinkWriteError::Data(err)) => {
                    if rows.len() == 1 {
                        error!(
                            table = %batch.table.table,
                            columns = ?batch.table.column_names(),
                            row = ?rows[0],
                            error = %err,
                            "dropping row rejected by the sink"
                        );
                        outcome.rejected += 1;
                    } else {
                        let mid = rows.len() / 2;
                        pending.push(&rows[..mid]);
                        pending.push(&rows[mid..]);
                    }
                }
            }
        }

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;
    use crate::sink::SinkTable;
    use crate::sink::memory::MemorySink;
    use crate::types::Value;

    fn party_batch(rows: Vec<Row>) -> PersistBatch {
        let catalog = parliament_catalog();
        let party = catalog.resolve("Party").unwrap();
        let table = SinkTable::for_entity_type(party, catalog.entity_type(party), None);

        PersistBatch {
            table: Arc::new(table),
            rows,
        }
    }

    fn party_row(id: i32, name: &str) -> Row {
        Row::new(vec![Value::I32(id), Value::Text(name.to_string())])
    }

    #[tokio::test]
    async fn clean_batch_writes_every_row() {
        let sink = Arc::new(MemorySink::new());
        let writer = SinkWriter::new(sink.clone());

        let batch = party_batch(vec![party_row(1, "A"), party_row(2, "B")]);
        let outcome = writer.write(&batch).await.unwrap();

        assert_eq!(outcome, BatchOutcome { written: 2, rejected: 0 });
        assert_eq!(sink.row_count("party").await, 2);
    }

    #[tokio::test]
    async fn repeated_batch_is_idempotent() {
        let sink = Arc::new(MemorySink::new());
        let writer = SinkWriter::new(sink.clone());

        let batch = party_batch(vec![party_row(7, "X")]);
        writer.write(&batch).await.unwrap();
        writer.write(&batch).await.unwrap();

        assert_eq!(sink.row_count("party").await, 1);
        let rows = sink.table_rows("party").await;
        assert_eq!(rows[0].values()[1], Value::Text("X".to_string()));
    }

    #[tokio::test]
    async fn bisection_drops_exactly_the_poison_rows() {
        let sink = Arc::new(MemorySink::new());
        let writer = SinkWriter::new(sink.clone());

        // Poison rows in arbitrary positions of an 8-row batch.
        sink.poison("party", &[Value::I32(2)]).await;
        sink.poison("party", &[Value::I32(5)]).await;

        let rows: Vec<Row> = (0..8).map(|id| party_row(id, "N")).collect();
        let batch = party_batch(rows);

        let outcome = writer.write(&batch).await.unwrap();

        assert_eq!(outcome, BatchOutcome { written: 6, rejected: 2 });
        assert_eq!(sink.row_count("party").await, 6);
    }

    #[tokio::test]
    async fn single_poison_row_in_small_batch() {
        let sink = Arc::new(MemorySink::new());
        let writer = SinkWriter::new(sink.clone());

        sink.poison("party", &[Value::I32(2)]).await;

        let rows: Vec<Row> = (0..4).map(|id| party_row(id, "N")).collect();
        let outcome = writer.write(&party_batch(rows)).await.unwrap();

        assert_eq!(outcome, BatchOutcome { written: 3, rejected: 1 });
    }

    #[tokio::test]
    async fn statement_error_aborts() {
        let sink = Arc::new(MemorySink::new());
        let writer = SinkWriter::new(sink.clone());

        sink.fail_statements("party").await;

        let batch = party_batch(vec![party_row(1, "A")]);
        let err = writer.write(&batch).await.unwrap_err();

        assert_eq!(err.kind(), crate::error::ErrorKind::SinkStatementFailed);
    }
}
