//! modcas Ingest - Go module content-addressing daemon

use anyhow::{Context, Result};
use modcas_common::logging::{init_logging, LogConfig, LogLevel};
use modcas_ingest::config::{Backend, IngestConfig};
use modcas_ingest::store::{FileStore, HashStore, SqlStore};
use modcas_ingest::{IpfsClient, Pipeline};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = IngestConfig::load()?;

    // Initialize logging based on verbose flag
    let log_level = if config.verbose {
        LogLevel::Debug
    } else {
        LogLevel::Info
    };

    let log_config = LogConfig::builder()
        .level(log_level)
        .log_file_prefix("modcas-ingest")
        .filter_directives("sqlx=warn,hyper=info,reqwest=info")
        .build();

    // Environment variables take precedence
    let log_config = log_config.merge_env()?;
    let _guard = init_logging(&log_config)?;

    info!(
        feed = %config.feed_url,
        mirror = %config.mirror_url,
        api = %config.api,
        backend = ?config.backend,
        parallel = config.parallel,
        cursor_policy = %config.cursor_policy,
        "starting modcas-ingest"
    );

    let store = open_store(&config).await?;

    let client = config.http_client()?;

    let ipfs = IpfsClient::new(client.clone(), config.api.clone());
    ipfs.ping()
        .await
        .with_context(|| format!("Blob store API unreachable at {}", config.api))?;

    let mut pipeline = Pipeline::new(config.pipeline_config(), store, Arc::new(ipfs)).with_http_client(client);
    pipeline.run_until_ctrl_c().await?;

    let stats = pipeline.stats().snapshot();
    info!(
        succeeded = stats.succeeded,
        failed = stats.failed,
        records = stats.records_persisted,
        "ingestion stopped"
    );
    Ok(())
}

async fn open_store(config: &IngestConfig) -> Result<Arc<dyn HashStore>> {
    let store: Arc<dyn HashStore> = match config.backend {
        Backend::File => Arc::new(
            FileStore::open(&config.data_dir)
                .await
                .with_context(|| format!("Failed to open data directory {}", config.data_dir.display()))?,
        ),
        Backend::Sql => Arc::new(
            SqlStore::connect(&config.dsn, config.sql_max_connections)
                .await
                .with_context(|| format!("Failed to open database {}", config.dsn))?,
        ),
    };
    Ok(store)
}
