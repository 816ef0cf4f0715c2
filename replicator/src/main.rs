use telemetry::init_tracing;
use telemetry::tracing::set_global_database;

use crate::config::load_replicator_config;
use crate::core::start_replicator;

mod config;
mod core;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let app_name = env!("CARGO_BIN_NAME");

    // The configuration decides the default log level, so it is loaded before tracing starts.
    let replicator_config = load_replicator_config()?;

    let default_filter = if replicator_config.verbose {
        "debug"
    } else {
        "info"
    };
    let _log_flusher = init_tracing(app_name, default_filter)?;
    set_global_database(replicator_config.source.database.clone());

    start_replicator(replicator_config).await?;

    Ok(())
}
