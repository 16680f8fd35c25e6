//! relsync replicator service binary.
//!
//! Loads configuration, initializes tracing, and runs one synchronization of
//! the configured remote service into the target database. The process exits
//! non-zero on the first unrecoverable error, with the cause logged.

use relsync_config::load_config;
use relsync_config::shared::ReplicatorConfig;
use relsync_telemetry::tracing::init_tracing;
use tracing::error;

mod core;

fn main() -> anyhow::Result<()> {
    let config: ReplicatorConfig = load_config()?;
    config.validate()?;

    init_tracing(env!("CARGO_BIN_NAME"))?;

    let result = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(core::start_replicator_with_config(config));

    if let Err(err) = &result {
        error!("replicator failed: {err:#}");
    }

    result
}
