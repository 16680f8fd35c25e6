//! Work items and fetch strategy execution.
//!
//! A [`WorkItem`] is one bounded fetch task: either the sequential paginated
//! scan of a whole entity type, or a single filtered request anchored on one
//! principal key. Workers execute items against the entity source and emit
//! persistence batches plus a completion signal to the scheduler; they never
//! touch backlog state themselves.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use relsync_config::shared::RetryConfig;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::backlog::WorkItemId;
use crate::bail;
use crate::catalog::{Catalog, EntityTypeId};
use crate::concurrency::shutdown::ShutdownRx;
use crate::error::{ErrorKind, SyncResult};
use crate::scheduler::WorkerMessage;
use crate::sink::{PersistBatch, SinkTable};
use crate::source::{EntitySource, PageRequest};
use crate::types::{Record, Value};

/// How a work item fetches its records.
#[derive(Debug, Clone)]
pub enum FetchKind {
    /// Sequential cursor pagination over the type's bulk endpoint. Page N+1
    /// is never requested before page N's cursor is known.
    Paged { filter: Option<String> },
    /// One unpaginated request selecting the records referencing a single
    /// principal key. Items of this kind run in parallel with each other.
    ByPrincipalKey { filter: String },
}

/// One bounded fetch task assigned to a worker.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub id: WorkItemId,
    pub entity_type: EntityTypeId,
    /// Target table identity, shared by every batch this item emits.
    pub table: Arc<SinkTable>,
    /// Configured field subset to request from the server; full records
    /// otherwise.
    pub fields: Option<Vec<String>>,
    pub kind: FetchKind,
}

/// Builds the filter selecting the dependents of one principal key,
/// optionally folded into an existing filter expression.
pub(crate) fn key_filter(
    dependent_fields: &[String],
    key: &[Value],
    existing: Option<&str>,
) -> SyncResult<String> {
    if dependent_fields.is_empty() || dependent_fields.len() != key.len() {
        bail!(
            ErrorKind::InvalidState,
            "Key width does not match the relation's field list",
            format!(
                "{} referencing field(s) vs {} key value(s)",
                dependent_fields.len(),
                key.len()
            )
        );
    }

    let clauses = dependent_fields
        .iter()
        .zip(key)
        .map(|(field, value)| format!("{field} eq {}", value.filter_literal()))
        .collect::<Vec<_>>()
        .join(" and ");

    Ok(match existing {
        Some(existing) => format!("({existing}) and ({clauses})"),
        None => clauses,
    })
}

/// Executes one work item to completion and reports the outcome to the
/// scheduler.
///
/// Every page/request boundary polls the shutdown signal, so an abort stops
/// the worker promptly instead of letting it run through remaining pages.
pub(crate) async fn execute_work_item<S>(
    item: WorkItem,
    catalog: Arc<Catalog>,
    source: Arc<S>,
    retry: RetryConfig,
    tx: mpsc::Sender<WorkerMessage>,
    shutdown_rx: ShutdownRx,
) where
    S: EntitySource,
{
    let item_id = item.id;
    let entity_type = item.entity_type;

    let result = run_item(item, catalog, source, retry, &tx, shutdown_rx).await;

    let message = match result {
        Ok(records) => WorkerMessage::ItemCompleted {
            item: item_id,
            entity_type,
            records,
        },
        Err(error) => WorkerMessage::ItemFailed {
            item: item_id,
            entity_type,
            error,
        },
    };

    // A closed channel means the scheduler is gone; nothing left to report.
    let _ = tx.send(message).await;
}

async fn run_item<S>(
    item: WorkItem,
    catalog: Arc<Catalog>,
    source: Arc<S>,
    retry: RetryConfig,
    tx: &mpsc::Sender<WorkerMessage>,
    shutdown_rx: ShutdownRx,
) -> SyncResult<u64>
where
    S: EntitySource,
{
    match &item.kind {
        FetchKind::Paged { filter } => {
            let filter = filter.clone();
            run_paged(&item, filter, catalog, source, retry, tx, shutdown_rx).await
        }
        FetchKind::ByPrincipalKey { filter } => {
            let filter = filter.clone();
            run_keyed(&item, filter, catalog, source, retry, tx, shutdown_rx).await
        }
    }
}

async fn run_paged<S>(
    item: &WorkItem,
    filter: Option<String>,
    catalog: Arc<Catalog>,
    source: Arc<S>,
    retry: RetryConfig,
    tx: &mpsc::Sender<WorkerMessage>,
    shutdown_rx: ShutdownRx,
) -> SyncResult<u64>
where
    S: EntitySource,
{
    let entity_type = catalog.entity_type(item.entity_type);

    let mut cursor = None;
    let mut fetched = 0u64;
    let mut expected: Option<u64> = None;

    loop {
        if shutdown_rx.is_triggered() {
            bail!(
                ErrorKind::OperationCanceled,
                "Fetch canceled",
                format!("paginated fetch of `{}` stopped on shutdown", entity_type.name)
            );
        }

        let page = with_retry(&retry, &shutdown_rx, || {
            source.fetch_page(PageRequest {
                entity_type,
                filter: filter.as_deref(),
                fields: item.fields.as_deref(),
                cursor: cursor.clone(),
            })
        })
        .await?;

        match expected {
            None => expected = Some(page.reported_total),
            Some(previous) if previous != page.reported_total => {
                // Seen in the wild: the server revises its own count between
                // pages of the same scan.
                warn!(
                    entity_type = %entity_type.name,
                    previous,
                    reported = page.reported_total,
                    "total count changed between pages"
                );
                expected = Some(page.reported_total);
            }
            Some(_) => {}
        }

        fetched += page.records.len() as u64;
        debug!(
            entity_type = %entity_type.name,
            fetched,
            expected = expected.unwrap_or(0),
            "fetched page"
        );

        emit_batch(item, page.records, tx).await?;

        match page.next {
            Some(next) => cursor = Some(next),
            None => break,
        }
    }

    Ok(fetched)
}

async fn run_keyed<S>(
    item: &WorkItem,
    filter: String,
    catalog: Arc<Catalog>,
    source: Arc<S>,
    retry: RetryConfig,
    tx: &mpsc::Sender<WorkerMessage>,
    shutdown_rx: ShutdownRx,
) -> SyncResult<u64>
where
    S: EntitySource,
{
    let entity_type = catalog.entity_type(item.entity_type);

    if shutdown_rx.is_triggered() {
        bail!(
            ErrorKind::OperationCanceled,
            "Fetch canceled",
            format!("keyed fetch of `{}` stopped on shutdown", entity_type.name)
        );
    }

    let records = with_retry(&retry, &shutdown_rx, || {
        source.fetch_filtered(entity_type, &filter)
    })
    .await?;

    let fetched = records.len() as u64;
    emit_batch(item, records, tx).await?;

    Ok(fetched)
}

/// Projects records into column-ordered rows and hands them to the
/// persistence queue.
async fn emit_batch(
    item: &WorkItem,
    records: Vec<Record>,
    tx: &mpsc::Sender<WorkerMessage>,
) -> SyncResult<()> {
    if records.is_empty() {
        return Ok(());
    }

    let projection = item.table.source_fields();
    let rows = records
        .iter()
        .map(|record| record.project(&projection))
        .collect();

    let batch = PersistBatch {
        table: item.table.clone(),
        rows,
    };

    if tx.send(WorkerMessage::Batch(batch)).await.is_err() {
        bail!(
            ErrorKind::OperationCanceled,
            "Persistence queue closed",
            "the scheduler stopped accepting batches".to_string()
        );
    }

    Ok(())
}

/// Runs `op`, retrying transient failures with exponential backoff and
/// jitter until the configured attempts are exhausted.
async fn with_retry<T, F, Fut>(
    retry: &RetryConfig,
    shutdown_rx: &ShutdownRx,
    mut op: F,
) -> SyncResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SyncResult<T>>,
{
    let mut attempt = 0u32;

    loop {
        attempt += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(err)
                if err.kind().is_transient()
                    && attempt < retry.max_attempts
                    && !shutdown_rx.is_triggered() =>
            {
                let delay = backoff_delay(retry, attempt);
                warn!(
                    error = %err,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "transient fetch failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// delay = initial * multiplier^(attempt - 1), jittered by ±50%.
fn backoff_delay(retry: &RetryConfig, attempt: u32) -> Duration {
    let exponent = retry.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
    let base = retry.initial_delay_ms as f64 * exponent;
    let jitter = rand::thread_rng().gen_range(0.5..1.5);

    Duration::from_millis((base * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::test_fixtures::parliament_catalog;
    use crate::concurrency::shutdown::create_shutdown_channel;
    use crate::source::memory::MemorySource;

    fn retry_fast() -> RetryConfig {
        RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 1,
            backoff_multiplier: 1.0,
        }
    }

    fn party_records(count: i32) -> Vec<Record> {
        (0..count)
            .map(|id| {
                [
                    ("ID", Value::I32(id)),
                    ("Name", Value::Text(format!("P{id}"))),
                ]
                .into_iter()
                .collect()
            })
            .collect()
    }

    fn party_item(catalog: &Catalog) -> WorkItem {
        let party = catalog.resolve("Party").unwrap();
        let table = SinkTable::for_entity_type(party, catalog.entity_type(party), None);

        WorkItem {
            id: WorkItemId(0),
            entity_type: party,
            table: Arc::new(table),
            fields: None,
            kind: FetchKind::Paged { filter: None },
        }
    }

    #[test]
    fn key_filter_joins_clauses_and_folds_existing() {
        let fields = vec!["MemberID".to_string()];
        let key = vec![Value::I32(7)];

        assert_eq!(key_filter(&fields, &key, None).unwrap(), "MemberID eq 7");
        assert_eq!(
            key_filter(&fields, &key, Some("Language eq 'DE'")).unwrap(),
            "(Language eq 'DE') and (MemberID eq 7)"
        );
    }

    #[test]
    fn key_filter_rejects_width_mismatch() {
        let err = key_filter(&["A".to_string()], &[], None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
    }

    #[tokio::test]
    async fn paged_item_emits_one_batch_per_page_then_completes() {
        let catalog = Arc::new(parliament_catalog());
        let source = Arc::new(MemorySource::with_page_size(2));
        source.insert_records("Party", party_records(5)).await;

        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        execute_work_item(
            party_item(&catalog),
            catalog.clone(),
            source,
            retry_fast(),
            tx,
            shutdown_rx,
        )
        .await;

        let mut batches = 0;
        let mut rows = 0;
        loop {
            match rx.recv().await.unwrap() {
                WorkerMessage::Batch(batch) => {
                    batches += 1;
                    rows += batch.rows.len();
                }
                WorkerMessage::ItemCompleted { records, .. } => {
                    assert_eq!(records, 5);
                    break;
                }
                WorkerMessage::ItemFailed { error, .. } => panic!("unexpected failure: {error}"),
            }
        }

        assert_eq!(batches, 3);
        assert_eq!(rows, 5);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let catalog = Arc::new(parliament_catalog());
        let source = Arc::new(MemorySource::new());
        source.insert_records("Party", party_records(1)).await;
        source.fail_next_requests("Party", 2).await;

        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        execute_work_item(
            party_item(&catalog),
            catalog.clone(),
            source,
            retry_fast(),
            tx,
            shutdown_rx,
        )
        .await;

        loop {
            match rx.recv().await.unwrap() {
                WorkerMessage::Batch(_) => {}
                WorkerMessage::ItemCompleted { records, .. } => {
                    assert_eq!(records, 1);
                    break;
                }
                WorkerMessage::ItemFailed { error, .. } => panic!("unexpected failure: {error}"),
            }
        }
    }

    #[tokio::test]
    async fn exhausted_retries_fail_the_item() {
        let catalog = Arc::new(parliament_catalog());
        let source = Arc::new(MemorySource::new());
        source.insert_records("Party", party_records(1)).await;
        source.fail_next_requests("Party", 5).await;

        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        execute_work_item(
            party_item(&catalog),
            catalog.clone(),
            source,
            retry_fast(),
            tx,
            shutdown_rx,
        )
        .await;

        match rx.recv().await.unwrap() {
            WorkerMessage::ItemFailed { error, .. } => {
                assert_eq!(error.kind(), ErrorKind::SourceRequestFailed);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keyed_item_fetches_matching_records_only() {
        let catalog = Arc::new(parliament_catalog());
        let member = catalog.resolve("Member").unwrap();

        let source = Arc::new(MemorySource::new());
        source
            .insert_records(
                "Member",
                vec![
                    [("ID", Value::I32(1)), ("PartyID", Value::I32(10))]
                        .into_iter()
                        .collect(),
                    [("ID", Value::I32(2)), ("PartyID", Value::I32(20))]
                        .into_iter()
                        .collect(),
                ],
            )
            .await;

        let table = SinkTable::for_entity_type(member, catalog.entity_type(member), None);
        let item = WorkItem {
            id: WorkItemId(1),
            entity_type: member,
            table: Arc::new(table),
            fields: None,
            kind: FetchKind::ByPrincipalKey {
                filter: "PartyID eq 10".to_string(),
            },
        };

        let (tx, mut rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = create_shutdown_channel();

        execute_work_item(item, catalog.clone(), source, retry_fast(), tx, shutdown_rx).await;

        match rx.recv().await.unwrap() {
            WorkerMessage::Batch(batch) => {
                assert_eq!(batch.rows.len(), 1);
                assert_eq!(batch.rows[0].values()[0], Value::I32(1));
            }
            other => panic!("expected a batch, got {other:?}"),
        }
    }
}
