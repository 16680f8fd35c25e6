//! The work scheduler.
//!
//! Owns the whole fetch → persist → unblock cycle of a run. Fetch workers
//! run as tasks in a [`JoinSet`], gated by a [`Semaphore`] so at most the
//! configured number execute concurrently; they report back over a single
//! mpsc channel of tagged [`WorkerMessage`]s. The control loop is the only
//! consumer of that channel and the only mutator of the backlog, and it
//! applies every persistence batch itself: one writer, so upserts into a
//! table never race while fetches keep running concurrently.
//!
//! mpsc preserves per-sender order, which guarantees a work item's batches
//! are persisted before its completion signal is processed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use relsync_config::shared::{PipelineConfig, RetryConfig};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::backlog::{Backlog, WorkItemId};
use crate::bail;
use crate::catalog::graph::DependencyGraph;
use crate::catalog::{Catalog, EntityTypeId};
use crate::concurrency::shutdown::{ShutdownRx, ShutdownTx};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::fetch::{self, FetchKind, WorkItem};
use crate::progress::ProgressReporter;
use crate::sink::writer::SinkWriter;
use crate::sink::{PersistBatch, RelationalSink, SinkTable};
use crate::source::EntitySource;
use crate::sync_error;

/// Depth of the persistence queue between workers and the control loop.
/// A full queue blocks workers on send, which is the intended backpressure.
const PERSIST_QUEUE_DEPTH: usize = 64;

/// Message from a fetch worker to the scheduler's control loop.
#[derive(Debug)]
pub(crate) enum WorkerMessage {
    /// A batch of rows ready for persistence.
    Batch(PersistBatch),
    /// A work item finished after fetching `records` records.
    ItemCompleted {
        item: WorkItemId,
        entity_type: EntityTypeId,
        records: u64,
    },
    /// A work item failed fatally.
    ItemFailed {
        item: WorkItemId,
        entity_type: EntityTypeId,
        error: SyncError,
    },
}

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct SyncReport {
    /// Entity types synchronized to completion.
    pub entity_types_done: usize,
    /// Records fetched from the source.
    pub records_fetched: u64,
    /// Rows the sink accepted.
    pub rows_written: u64,
    /// Rows isolated and dropped as poison.
    pub rows_rejected: u64,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Drives one synchronization run to completion.
pub struct WorkScheduler<S, D> {
    catalog: Arc<Catalog>,
    config: Arc<SyncConfig>,
    graph: DependencyGraph,
    source: Arc<S>,
    sink: Arc<D>,
    writer: SinkWriter<D>,
    backlog: Backlog,
    workers: JoinSet<()>,
    permits: Arc<Semaphore>,
    retry: RetryConfig,
    result_tx: mpsc::Sender<WorkerMessage>,
    result_rx: mpsc::Receiver<WorkerMessage>,
    shutdown_tx: ShutdownTx,
    shutdown_rx: ShutdownRx,
    next_item: u64,
    records_fetched: u64,
    rows_written: u64,
    rows_rejected: u64,
    progress: ProgressReporter,
}

impl<S, D> WorkScheduler<S, D>
where
    S: EntitySource,
    D: RelationalSink,
{
    /// Creates a scheduler for one run.
    pub fn new(
        catalog: Arc<Catalog>,
        config: Arc<SyncConfig>,
        pipeline_config: &PipelineConfig,
        graph: DependencyGraph,
        source: Arc<S>,
        sink: Arc<D>,
        shutdown_tx: ShutdownTx,
    ) -> Self {
        let (result_tx, result_rx) = mpsc::channel(PERSIST_QUEUE_DEPTH);
        let shutdown_rx = shutdown_tx.subscribe();
        let backlog = Backlog::new(catalog.len());
        let writer = SinkWriter::new(sink.clone());

        Self {
            catalog,
            config,
            graph,
            source,
            sink,
            writer,
            backlog,
            workers: JoinSet::new(),
            permits: Arc::new(Semaphore::new(pipeline_config.max_fetch_workers as usize)),
            retry: pipeline_config.retry.clone(),
            result_tx,
            result_rx,
            shutdown_tx,
            shutdown_rx,
            next_item: 0,
            records_fetched: 0,
            rows_written: 0,
            rows_rejected: 0,
            progress: ProgressReporter::new(),
        }
    }

    /// Runs the backlog to completion.
    ///
    /// Succeeds once no entry is waiting or in progress; fails on the first
    /// unrecoverable fetch or persistence error, after draining in-flight
    /// workers.
    pub async fn run(mut self) -> SyncResult<SyncReport> {
        match self.run_inner().await {
            Ok(report) => Ok(report),
            Err(err) => {
                self.abort().await;
                Err(err)
            }
        }
    }

    async fn run_inner(&mut self) -> SyncResult<SyncReport> {
        self.seed_backlog();
        self.progress.observe(&self.backlog);

        let ready = self.backlog.ready_types();
        self.promote_all(ready).await?;

        while !self.backlog.is_complete() {
            let mut shutdown_rx = self.shutdown_rx.clone();

            tokio::select! {
                message = self.result_rx.recv() => {
                    let Some(message) = message else {
                        // All senders dropped with work outstanding; cannot
                        // happen while we hold a sender, but do not hang on it.
                        bail!(
                            ErrorKind::InvalidState,
                            "Worker channel closed with backlog outstanding"
                        );
                    };
                    self.handle_message(message).await?;
                }
                Some(join_result) = self.workers.join_next(), if !self.workers.is_empty() => {
                    if let Err(join_error) = join_result
                        && join_error.is_panic()
                    {
                        return Err(sync_error!(
                            ErrorKind::WorkerPanic,
                            "Fetch worker panicked",
                            source: join_error
                        ));
                    }
                }
                _ = shutdown_rx.triggered() => {
                    bail!(
                        ErrorKind::OperationCanceled,
                        "Run canceled",
                        "shutdown requested while the backlog was outstanding".to_string()
                    );
                }
            }
        }

        while let Some(join_result) = self.workers.join_next().await {
            if let Err(join_error) = join_result
                && join_error.is_panic()
            {
                return Err(sync_error!(
                    ErrorKind::WorkerPanic,
                    "Fetch worker panicked",
                    source: join_error
                ));
            }
        }

        let (_, _, done) = self.backlog.counts();
        info!(
            entity_types = done,
            records = self.records_fetched,
            rows_written = self.rows_written,
            rows_rejected = self.rows_rejected,
            "run complete"
        );

        Ok(SyncReport {
            entity_types_done: done,
            records_fetched: self.records_fetched,
            rows_written: self.rows_written,
            rows_rejected: self.rows_rejected,
            elapsed: self.progress.elapsed(),
        })
    }

    /// Creates a waiting entry per included type, blocked on its included
    /// direct dependencies.
    fn seed_backlog(&mut self) {
        for &id in self.config.included() {
            let blockers: HashSet<EntityTypeId> = self
                .graph
                .direct_dependencies(id)
                .iter()
                .copied()
                .filter(|dependency| self.config.is_included(*dependency))
                .collect();

            self.backlog
                .insert_waiting(id, self.catalog.entity_type(id).name.clone(), blockers);
        }
    }

    async fn handle_message(&mut self, message: WorkerMessage) -> SyncResult<()> {
        match message {
            WorkerMessage::Batch(batch) => {
                let outcome = self.writer.write(&batch).await?;
                self.rows_written += outcome.written;
                self.rows_rejected += outcome.rejected;
            }
            WorkerMessage::ItemCompleted {
                item,
                entity_type,
                records,
            } => {
                self.records_fetched += records;

                let exhausted = self.backlog.complete_item(entity_type, item, records)?;
                if exhausted {
                    let newly_ready = self.backlog.finish(entity_type)?;
                    self.promote_all(newly_ready).await?;
                }
                self.progress.observe(&self.backlog);
            }
            WorkerMessage::ItemFailed {
                entity_type, error, ..
            } => {
                error!(
                    entity_type = %self.catalog.entity_type(entity_type).name,
                    %error,
                    "work item failed"
                );
                return Err(error);
            }
        }

        Ok(())
    }

    /// Promotes every listed entity type into `InProgress`, following up on
    /// types that complete immediately because they have no work to do.
    async fn promote_all(&mut self, ready: Vec<EntityTypeId>) -> SyncResult<()> {
        let mut pending = ready;

        while let Some(entity_type) = pending.pop() {
            let newly_ready = self.promote_one(entity_type).await?;
            pending.extend(newly_ready);
        }

        Ok(())
    }

    /// Moves one ready entity type into `InProgress`: queries its expected
    /// total, expands it into work items per the configured strategy, and
    /// spawns the workers.
    ///
    /// Returns entity types unblocked immediately, which happens when a
    /// key-anchored type has no principal keys and therefore no work items.
    async fn promote_one(&mut self, entity_type: EntityTypeId) -> SyncResult<Vec<EntityTypeId>> {
        let fields = self.config.fields(entity_type).map(<[String]>::to_vec);
        let filter = self.config.filter(entity_type).map(str::to_string);

        let type_name = self.catalog.entity_type(entity_type).name.clone();
        let (table, expected_total) = {
            let schema = self.catalog.entity_type(entity_type);
            let table = Arc::new(SinkTable::for_entity_type(
                entity_type,
                schema,
                fields.as_deref(),
            ));
            let expected_total = self.source.total_count(schema, filter.as_deref()).await?;
            (table, expected_total)
        };

        let items = match self.config.fetch_by(entity_type) {
            Some(principal) => {
                self.keyed_items(entity_type, principal, &table, &fields, filter.as_deref())
                    .await?
            }
            None => vec![WorkItem {
                id: self.next_item_id(),
                entity_type,
                table: table.clone(),
                fields: fields.clone(),
                kind: FetchKind::Paged { filter },
            }],
        };

        info!(
            entity_type = %type_name,
            expected_total,
            items = items.len(),
            "enqueueing work for entity type"
        );

        self.backlog
            .begin(entity_type, expected_total, items.iter().map(|item| item.id))?;

        if items.is_empty() {
            // No principal keys, nothing to fetch; the entry is done as soon
            // as it started.
            let newly_ready = self.backlog.finish(entity_type)?;
            self.progress.observe(&self.backlog);
            return Ok(newly_ready);
        }

        self.progress.observe(&self.backlog);
        for item in items {
            self.spawn_item(item);
        }

        Ok(Vec::new())
    }

    /// Expands a key-anchored type into one work item per persisted principal
    /// key.
    async fn keyed_items(
        &mut self,
        entity_type: EntityTypeId,
        principal: EntityTypeId,
        table: &Arc<SinkTable>,
        fields: &Option<Vec<String>>,
        filter: Option<&str>,
    ) -> SyncResult<Vec<WorkItem>> {
        let Some(relation) = self.catalog.relation_between(entity_type, principal) else {
            // Validated at configuration build time.
            bail!(
                ErrorKind::InvalidState,
                "Key-anchored type lost its relation",
                format!(
                    "no relation from `{}` to `{}`",
                    self.catalog.entity_type(entity_type).name,
                    self.catalog.entity_type(principal).name
                )
            );
        };

        let principal_schema = self.catalog.entity_type(principal);
        let principal_table = SinkTable::for_entity_type(
            principal,
            principal_schema,
            self.config.fields(principal),
        );
        let key_columns = principal_table.columns_for_fields(&relation.principal_fields);

        let keys = self
            .sink
            .read_all_keys(&principal_table, &key_columns)
            .await?;

        let dependent_fields = relation.dependent_fields.clone();
        let mut items = Vec::with_capacity(keys.len());
        for key in keys {
            let key_filter = fetch::key_filter(&dependent_fields, &key, filter)?;
            items.push(WorkItem {
                id: self.next_item_id(),
                entity_type,
                table: table.clone(),
                fields: fields.clone(),
                kind: FetchKind::ByPrincipalKey { filter: key_filter },
            });
        }

        Ok(items)
    }

    fn spawn_item(&mut self, item: WorkItem) {
        let permits = self.permits.clone();
        let catalog = self.catalog.clone();
        let source = self.source.clone();
        let retry = self.retry.clone();
        let tx = self.result_tx.clone();
        let shutdown_rx = self.shutdown_rx.clone();

        self.workers.spawn(async move {
            // A closed semaphore means the run is aborting; give the item up
            // without fetching.
            let Ok(_permit) = permits.acquire().await else {
                return;
            };
            if shutdown_rx.is_triggered() {
                return;
            }

            fetch::execute_work_item(item, catalog, source, retry, tx, shutdown_rx).await;
        });
    }

    /// Stops admitting queued work and drains in-flight workers.
    async fn abort(&mut self) {
        info!("aborting run, draining in-flight workers");

        self.shutdown_tx.shutdown();
        self.permits.close();
        // Closing the receiver makes pending worker sends fail instead of
        // blocking forever on a queue nobody reads.
        self.result_rx.close();

        while self.workers.join_next().await.is_some() {}
    }

    fn next_item_id(&mut self) -> WorkItemId {
        let id = WorkItemId(self.next_item);
        self.next_item += 1;
        id
    }
}
