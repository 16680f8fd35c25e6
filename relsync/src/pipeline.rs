//! Pipeline lifecycle around one synchronization run.
//!
//! A [`Pipeline`] wires catalog, configuration, source, and sink into a
//! [`WorkScheduler`], runs it on a background task, and exposes
//! start/wait/shutdown to the embedding service.

use std::sync::Arc;

use relsync_config::shared::PipelineConfig;
use tokio::task::JoinHandle;
use tracing::{error, info};
use uuid::Uuid;

use crate::bail;
use crate::catalog::Catalog;
use crate::catalog::graph::DependencyGraph;
use crate::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use crate::config::SyncConfig;
use crate::error::{ErrorKind, SyncResult};
use crate::scheduler::{SyncReport, WorkScheduler};
use crate::sink::RelationalSink;
use crate::source::EntitySource;
use crate::sync_error;

#[derive(Debug)]
enum PipelineState {
    NotStarted,
    Started {
        handle: JoinHandle<SyncResult<SyncReport>>,
    },
}

/// One configured synchronization pipeline.
pub struct Pipeline<S, D> {
    config: Arc<PipelineConfig>,
    catalog: Arc<Catalog>,
    sync_config: Arc<SyncConfig>,
    source: Arc<S>,
    sink: Arc<D>,
    /// Identity of this run, attached to logs for correlation.
    run_id: Uuid,
    shutdown_tx: ShutdownTx,
    state: PipelineState,
}

impl<S, D> Pipeline<S, D>
where
    S: EntitySource,
    D: RelationalSink,
{
    /// Creates a pipeline; nothing runs until [`Pipeline::start`].
    pub fn new(
        config: PipelineConfig,
        catalog: Arc<Catalog>,
        sync_config: SyncConfig,
        source: S,
        sink: D,
    ) -> Self {
        let (shutdown_tx, _) = create_shutdown_channel();

        Self {
            config: Arc::new(config),
            catalog,
            sync_config: Arc::new(sync_config),
            source: Arc::new(source),
            sink: Arc::new(sink),
            run_id: Uuid::new_v4(),
            shutdown_tx,
            state: PipelineState::NotStarted,
        }
    }

    /// Identity of this run.
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Handle for requesting shutdown from elsewhere, e.g. a signal handler.
    pub fn shutdown_tx(&self) -> ShutdownTx {
        self.shutdown_tx.clone()
    }

    /// Builds the dependency graph and launches the scheduler.
    pub fn start(&mut self) -> SyncResult<()> {
        if matches!(self.state, PipelineState::Started { .. }) {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline already started",
                format!("run {} is already in progress", self.run_id)
            );
        }

        info!(
            pipeline_id = self.config.id,
            run_id = %self.run_id,
            entity_types = self.sync_config.included().len(),
            "starting pipeline"
        );

        let graph = DependencyGraph::build(&self.catalog)?;

        let scheduler = WorkScheduler::new(
            self.catalog.clone(),
            self.sync_config.clone(),
            &self.config,
            graph,
            self.source.clone(),
            self.sink.clone(),
            self.shutdown_tx.clone(),
        );

        let handle = tokio::spawn(scheduler.run());
        self.state = PipelineState::Started { handle };

        Ok(())
    }

    /// Waits for the run to end and returns its report.
    pub async fn wait(self) -> SyncResult<SyncReport> {
        let PipelineState::Started { handle } = self.state else {
            bail!(
                ErrorKind::InvalidState,
                "Pipeline was not started",
                "nothing to wait for".to_string()
            );
        };

        match handle.await {
            Ok(result) => result,
            Err(join_error) => Err(sync_error!(
                ErrorKind::WorkerPanic,
                "Scheduler task panicked",
                source: join_error
            )),
        }
    }

    /// Requests a prompt stop of the run.
    pub fn shutdown(&self) {
        info!(run_id = %self.run_id, "requesting pipeline shutdown");
        self.shutdown_tx.shutdown();
    }

    /// Requests shutdown and waits for the run to wind down.
    pub async fn shutdown_and_wait(self) -> SyncResult<SyncReport> {
        self.shutdown();

        let result = self.wait().await;
        if let Err(err) = &result {
            error!(error = %err, "pipeline ended with an error after shutdown");
        }

        result
    }
}
