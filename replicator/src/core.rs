use config::shared::{
    BatchConfig, DestinationConfig, PgConnectionConfig, PipelineConfig, ReplicatorConfig,
    SourceConfig,
};
use couchwarehouse::destination::Destination;
use couchwarehouse::destination::elasticsearch::ElasticsearchDestination;
use couchwarehouse::destination::memory::MemoryDestination;
use couchwarehouse::destination::mysql::MySqlDestination;
use couchwarehouse::destination::postgres::PostgresDestination;
use couchwarehouse::destination::sqlite::SqliteDestination;
use couchwarehouse::pipeline::Pipeline;
use couchwarehouse::replication::transform::FieldTransform;
use couchwarehouse::source::base::ChangeSource;
use couchwarehouse::source::couchdb::CouchDbSource;
use secrecy::ExposeSecret;
use std::sync::Arc;
use tracing::{info, warn};

pub async fn start_replicator(mut replicator_config: ReplicatorConfig) -> anyhow::Result<()> {
    info!("starting replicator service");

    // The pipeline only knows the prefetch depth, not which destination picks which default.
    replicator_config.pipeline.batch.buffer_size = Some(replicator_config.buffer_size());
    log_config(&replicator_config);

    let source = CouchDbSource::new(&replicator_config.source)?;
    let ReplicatorConfig {
        source: source_config,
        destination,
        pipeline: pipeline_config,
        ..
    } = replicator_config;

    // Static dispatch over the destination: every arm builds its own concrete pipeline.
    match destination {
        DestinationConfig::Memory => {
            let destination = MemoryDestination::new();
            run(source_config, pipeline_config, source, destination).await?;
        }
        DestinationConfig::Sqlite { path } => {
            let destination = SqliteDestination::connect(&path).await?;
            run(source_config, pipeline_config, source, destination).await?;
        }
        DestinationConfig::Postgres(pg_connection) => {
            let destination = PostgresDestination::connect(&pg_connection).await?;
            run(source_config, pipeline_config, source, destination).await?;
        }
        DestinationConfig::Mysql { url } => {
            let destination = MySqlDestination::connect(url.expose_secret()).await?;
            run(source_config, pipeline_config, source, destination).await?;
        }
        DestinationConfig::Elasticsearch {
            url,
            username,
            password,
        } => {
            let password = password.map(|password| password.expose_secret().to_string());
            let destination = ElasticsearchDestination::new(&url, username, password);
            run(source_config, pipeline_config, source, destination).await?;
        }
    }

    info!("replicator service completed");
    Ok(())
}

fn log_config(config: &ReplicatorConfig) {
    log_source_config(&config.source);
    log_destination_config(&config.destination);
    log_pipeline_config(&config.pipeline);
}

fn log_source_config(config: &SourceConfig) {
    info!(
        url = config.url,
        database = config.database,
        username = config.username,
        since = config.since,
        sample_size = config.sample_size,
        longpoll_timeout_ms = config.longpoll_timeout_ms,
        "couchdb source config"
    );
}

fn log_destination_config(config: &DestinationConfig) {
    match config {
        DestinationConfig::Memory => {
            info!("memory destination config");
        }
        DestinationConfig::Sqlite { path } => {
            info!(path, "sqlite destination config");
        }
        DestinationConfig::Postgres(pg_connection) => {
            log_pg_connection_config(pg_connection);
        }
        DestinationConfig::Mysql { url: _ } => {
            info!("mysql destination config");
        }
        DestinationConfig::Elasticsearch {
            url,
            username,
            password: _,
        } => {
            info!(url, username, "elasticsearch destination config");
        }
    }
}

fn log_pg_connection_config(config: &PgConnectionConfig) {
    info!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        tls_enabled = config.tls.enabled,
        "postgres destination config",
    );
}

fn log_pipeline_config(config: &PipelineConfig) {
    info!(
        reset = config.reset,
        split = config.split,
        transform = config.transform.as_ref().map(|path| path.display().to_string()),
        "pipeline config"
    );
    log_batch_config(&config.batch);
}

fn log_batch_config(config: &BatchConfig) {
    info!(
        max_size = config.max_size,
        buffer_size = config.buffer_size,
        "batch config"
    );
}

#[tracing::instrument(skip_all, fields(database = %source_config.database, destination = D::name()))]
async fn run<S, D>(
    source_config: SourceConfig,
    pipeline_config: PipelineConfig,
    source: S,
    destination: D,
) -> anyhow::Result<()>
where
    S: ChangeSource + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    let transform = match &pipeline_config.transform {
        Some(path) => {
            info!(path = %path.display(), "loading transform");
            Some(FieldTransform::from_path(path)?)
        }
        None => None,
    };

    let mut pipeline = Pipeline::new(source_config, pipeline_config, source, destination);
    if let Some(transform) = transform {
        pipeline = pipeline.with_transform(Arc::new(transform));
    }

    start_pipeline(pipeline).await
}

async fn start_pipeline<S, D>(mut pipeline: Pipeline<S, D>) -> anyhow::Result<()>
where
    S: ChangeSource + Clone + Send + Sync + 'static,
    D: Destination + Clone + Send + Sync + 'static,
{
    pipeline.start().await?;

    let shutdown_tx = pipeline.shutdown_tx();
    let shutdown_handle = tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(err) => {
                warn!("failed to register SIGTERM handler: {}", err);
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT (Ctrl+C) received, stopping pipeline");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, stopping pipeline");
            }
        }

        if let Err(e) = shutdown_tx.shutdown() {
            warn!("failed to send shutdown signal: {:?}", e);
            return;
        }

        info!("pipeline stop requested, finishing the current batch")
    });

    let result = pipeline.wait().await;

    // The pipeline may end on its own, in which case nothing waits for a signal anymore.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;

    Ok(())
}
