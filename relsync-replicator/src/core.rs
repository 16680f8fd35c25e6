//! Service wiring: catalog, source, sink, pipeline, and signal handling.

use std::fs;
use std::sync::Arc;

use anyhow::Context;
use relsync::catalog::Catalog;
use relsync::catalog::graph::DependencyGraph;
use relsync::config::SyncConfig;
use relsync::pipeline::Pipeline;
use relsync::sink::postgres::PostgresSink;
use relsync::source::odata::OdataSource;
use relsync_config::shared::ReplicatorConfig;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{info, warn};

/// Starts the replicator service with the provided configuration.
///
/// Builds the catalog and validated sync configuration, connects source and
/// sink, and runs the pipeline to completion. SIGINT/SIGTERM request a
/// prompt, orderly stop through the pipeline's shutdown channel.
pub async fn start_replicator_with_config(config: ReplicatorConfig) -> anyhow::Result<()> {
    info!(
        pipeline_id = config.pipeline.id,
        source = %config.source.base_url,
        "starting replicator service"
    );

    let catalog_json = fs::read_to_string(&config.source.catalog_path).with_context(|| {
        format!(
            "failed to read catalog file `{}`",
            config.source.catalog_path.display()
        )
    })?;
    let catalog = Arc::new(Catalog::from_json(&catalog_json)?);

    // Everything that can be wrong with the configuration surfaces here,
    // before the first fetch.
    let graph = DependencyGraph::build(&catalog)?;
    let sync_config = SyncConfig::from_rules(&catalog, &graph, &config.sync)?;

    let source = OdataSource::new(&config.source)?;
    let sink = PostgresSink::connect(config.sink.with_db(), config.sink.schema.clone()).await?;

    let mut pipeline = Pipeline::new(config.pipeline, catalog, sync_config, source, sink);
    pipeline.start()?;

    let shutdown_tx = pipeline.shutdown_tx();
    tokio::spawn(async move {
        match wait_for_termination().await {
            Ok(()) => {
                info!("termination signal received, shutting down");
                shutdown_tx.shutdown();
            }
            Err(err) => warn!(error = %err, "failed to listen for termination signals"),
        }
    });

    let report = pipeline.wait().await?;
    info!(
        entity_types = report.entity_types_done,
        records = report.records_fetched,
        rows_written = report.rows_written,
        rows_rejected = report.rows_rejected,
        elapsed_s = report.elapsed.as_secs(),
        "synchronization finished"
    );

    Ok(())
}

async fn wait_for_termination() -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {}
        _ = sigint.recv() => {}
    }

    Ok(())
}
