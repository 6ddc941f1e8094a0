//! Command-line and environment configuration

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::time::Duration;

use crate::blobstore::DEFAULT_API_URL;
use crate::buffer_pool::DEFAULT_FILE_CAPACITY;
use crate::commit::CursorPolicy;
use crate::feed::{CrawlerConfig, DEFAULT_FEED_URL, DEFAULT_HIGH_WATER_MARK};
use crate::loader::{LoaderConfig, DEFAULT_MAX_ARCHIVE_BYTES, DEFAULT_MAX_CONCURRENCY, DEFAULT_MIRROR_URL};
use crate::pipeline::PipelineConfig;
use crate::store::sql::DEFAULT_MAX_CONNECTIONS;

// ============================================================================
// Ingest Configuration Constants
// ============================================================================

/// Default flat-file store directory.
pub const DEFAULT_DATA_DIR: &str = "/data";

/// Default relational store DSN.
pub const DEFAULT_DSN: &str = "sqlite:/data/modcas.db";

/// Default seconds between polls of a quiet feed.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;

/// Default archive buffer size class in MiB.
pub const DEFAULT_ARCHIVE_BUFFER_MB: usize = 512;

/// Default seconds an HTTP connection may stay silent before the request fails.
pub const DEFAULT_READ_TIMEOUT_SECS: u64 = 120;

/// Default seconds allowed to establish an HTTP connection.
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

const USER_AGENT: &str = concat!("modcas-ingest/", env!("CARGO_PKG_VERSION"));

/// Persistence backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// `latest` cursor file plus `cid.csv` record log
    File,
    /// SQLite database
    Sql,
}

/// modcas ingestion daemon configuration
#[derive(Parser, Debug, Clone)]
#[command(name = "modcas-ingest")]
#[command(author, version, about = "Content-address every file of every new Go module release")]
pub struct IngestConfig {
    /// Change feed URL
    #[arg(long, env = "MODCAS_FEED_URL", default_value = DEFAULT_FEED_URL)]
    pub feed_url: String,

    /// Module mirror URL
    #[arg(long, env = "MODCAS_MIRROR_URL", default_value = DEFAULT_MIRROR_URL)]
    pub mirror_url: String,

    /// Blob store HTTP API URL
    #[arg(long, env = "MODCAS_IPFS_API", default_value = DEFAULT_API_URL)]
    pub api: String,

    /// Persistence backend
    #[arg(long, env = "MODCAS_BACKEND", value_enum, default_value_t = Backend::File)]
    pub backend: Backend,

    /// Directory of the flat-file store
    #[arg(long, env = "MODCAS_DATA_DIR", default_value = DEFAULT_DATA_DIR)]
    pub data_dir: PathBuf,

    /// DSN of the relational store
    #[arg(long, env = "MODCAS_DSN", default_value = DEFAULT_DSN)]
    pub dsn: String,

    /// Connection pool size of the relational store
    #[arg(long, env = "MODCAS_SQL_MAX_CONNECTIONS", default_value_t = DEFAULT_MAX_CONNECTIONS)]
    pub sql_max_connections: u32,

    /// Releases processed concurrently
    #[arg(long, env = "MODCAS_PARALLEL", default_value_t = DEFAULT_MAX_CONCURRENCY)]
    pub parallel: usize,

    /// Seconds to wait before polling a quiet feed again
    #[arg(long, env = "MODCAS_POLL_INTERVAL_SECS", default_value_t = DEFAULT_POLL_INTERVAL_SECS)]
    pub poll_interval_secs: u64,

    /// Rounds with at least this many entries are followed immediately by another
    #[arg(long, env = "MODCAS_HIGH_WATER_MARK", default_value_t = DEFAULT_HIGH_WATER_MARK)]
    pub high_water_mark: usize,

    /// When the persisted cursor may advance
    #[arg(long, env = "MODCAS_CURSOR_POLICY", value_enum, default_value_t = CursorPolicy::Eager)]
    pub cursor_policy: CursorPolicy,

    /// Seconds an HTTP connection may stay silent before the request fails
    #[arg(long, env = "MODCAS_READ_TIMEOUT_SECS", default_value_t = DEFAULT_READ_TIMEOUT_SECS)]
    pub read_timeout_secs: u64,

    /// Size of pooled archive buffers in MiB
    #[arg(long, env = "MODCAS_ARCHIVE_BUFFER_MB", default_value_t = DEFAULT_ARCHIVE_BUFFER_MB)]
    pub archive_buffer_mb: usize,

    /// Verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

impl IngestConfig {
    /// Load `.env`, parse the command line and validate.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::parse();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.feed_url.trim().is_empty() {
            bail!("Feed URL cannot be empty");
        }
        if self.mirror_url.trim().is_empty() {
            bail!("Mirror URL cannot be empty");
        }
        if self.api.trim().is_empty() {
            bail!("Blob store API URL cannot be empty");
        }

        if self.parallel == 0 {
            bail!("Parallelism must be greater than 0");
        }
        if self.high_water_mark == 0 {
            bail!("High-water mark must be greater than 0");
        }
        if self.archive_buffer_mb == 0 {
            bail!("Archive buffer size must be greater than 0");
        }
        if self.read_timeout_secs == 0 {
            bail!("Read timeout must be greater than 0");
        }

        match self.backend {
            Backend::Sql if self.dsn.trim().is_empty() => bail!("DSN cannot be empty for the sql backend"),
            Backend::Sql if self.sql_max_connections == 0 => {
                bail!("SQL max connections must be greater than 0")
            }
            Backend::File if self.data_dir.as_os_str().is_empty() => {
                bail!("Data directory cannot be empty for the file backend")
            }
            _ => {}
        }

        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// HTTP client shared by the crawler, the loader and the blob store.
    pub fn http_client(&self) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS))
            .read_timeout(self.read_timeout())
            .build()
            .context("Failed to build HTTP client")
    }

    /// Library-level configuration for [`crate::Pipeline`].
    pub fn pipeline_config(&self) -> PipelineConfig {
        let crawler = CrawlerConfig::default()
            .with_feed_url(&self.feed_url)
            .with_poll_interval(self.poll_interval())
            .with_high_water_mark(self.high_water_mark);

        let loader = LoaderConfig::default()
            .with_mirror_url(&self.mirror_url)
            .with_max_concurrency(self.parallel)
            .with_buffer_capacities(self.archive_buffer_mb * 1024 * 1024, DEFAULT_FILE_CAPACITY)
            .with_max_archive_bytes(DEFAULT_MAX_ARCHIVE_BYTES);

        PipelineConfig::default()
            .with_crawler(crawler)
            .with_loader(loader)
            .with_cursor_policy(self.cursor_policy)
    }
}
