//! Wires the crawler, dispatcher and persistence into one running pipeline
//!
//! A single root [`CancellationToken`] reaches every blocking point: crawler
//! sends and sleeps, dispatcher receives and permit waits, and release
//! downloads.

use anyhow::{anyhow, Context, Result};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::blobstore::ContentAddresser;
use crate::buffer_pool::BufferPool;
use crate::commit::{CommitTracker, CursorPolicy};
use crate::feed::{CrawlerConfig, IndexCrawler};
use crate::loader::{Loader, LoaderConfig, LoaderStats};
use crate::store::HashStore;

/// Capacity of the crawler to dispatcher channel. The crawler waits for its
/// slot to drain after every send, so with one slot each handoff completes
/// only once the dispatcher has received the notification.
pub const HANDOFF_CAPACITY: usize = 1;

/// Everything the pipeline needs besides its collaborators
#[derive(Debug, Clone, Default)]
pub struct PipelineConfig {
    pub crawler: CrawlerConfig,
    pub loader: LoaderConfig,
    pub cursor_policy: CursorPolicy,
}

impl PipelineConfig {
    pub fn with_crawler(mut self, crawler: CrawlerConfig) -> Self {
        self.crawler = crawler;
        self
    }

    pub fn with_loader(mut self, loader: LoaderConfig) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_cursor_policy(mut self, policy: CursorPolicy) -> Self {
        self.cursor_policy = policy;
        self
    }
}

struct Running {
    crawler: JoinHandle<()>,
    loader: JoinHandle<()>,
}

/// The ingestion pipeline
pub struct Pipeline {
    config: PipelineConfig,
    store: Arc<dyn HashStore>,
    addresser: Arc<dyn ContentAddresser>,
    client: reqwest::Client,
    pool: BufferPool,
    shutdown: CancellationToken,
    stats: Arc<LoaderStats>,
    tracker: Option<Arc<CommitTracker>>,
    running: Option<Running>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, store: Arc<dyn HashStore>, addresser: Arc<dyn ContentAddresser>) -> Self {
        Self {
            config,
            store,
            addresser,
            client: reqwest::Client::new(),
            pool: BufferPool::default(),
            shutdown: CancellationToken::new(),
            stats: Arc::new(LoaderStats::default()),
            tracker: None,
            running: None,
        }
    }

    /// HTTP client for the feed and the mirror.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    pub fn with_buffer_pool(mut self, pool: BufferPool) -> Self {
        self.pool = pool;
        self
    }

    /// Root token; cancelling it stops the pipeline.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Dispatcher counters of the current (or last) run.
    pub fn stats(&self) -> Arc<LoaderStats> {
        self.stats.clone()
    }

    /// Commit tracker of the current run, under the after-commit policy.
    pub fn commit_tracker(&self) -> Option<Arc<CommitTracker>> {
        self.tracker.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Read the stored cursor and spawn the crawler and dispatcher.
    pub async fn start(&mut self) -> Result<()> {
        if self.running.is_some() {
            return Ok(());
        }
        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let cursor = self
            .store
            .read_cursor()
            .await
            .with_context(|| format!("Failed to read cursor from {} store", self.store.backend()))?;

        let (tx, rx) = mpsc::channel(HANDOFF_CAPACITY);

        let tracker = match self.config.cursor_policy {
            CursorPolicy::Eager => None,
            CursorPolicy::AfterCommit => Some(Arc::new(CommitTracker::new(self.store.clone()))),
        };

        let crawler = match &tracker {
            None => IndexCrawler::eager(
                self.config.crawler.clone(),
                self.client.clone(),
                tx,
                self.store.clone(),
                self.shutdown.clone(),
            ),
            Some(tracker) => IndexCrawler::after_commit(
                self.config.crawler.clone(),
                self.client.clone(),
                tx,
                tracker.clone(),
                self.shutdown.clone(),
            ),
        };

        let loader = Loader::with_parts(
            self.config.loader.clone(),
            self.client.clone(),
            self.store.clone(),
            self.addresser.clone(),
            self.pool.clone(),
            tracker.clone(),
        );
        self.stats = loader.stats();
        self.tracker = tracker;

        info!(
            backend = self.store.backend(),
            cursor_policy = %self.config.cursor_policy,
            since = %cursor,
            "starting pipeline"
        );

        let loader_token = self.shutdown.clone();
        let running = Running {
            crawler: tokio::spawn(crawler.run(cursor).instrument(info_span!("crawler"))),
            loader: tokio::spawn(async move { loader.run(rx, loader_token).await }.instrument(info_span!("loader"))),
        };
        self.running = Some(running);
        Ok(())
    }

    /// Cancel the root token and wait for the crawler and every in-flight
    /// release to finish.
    pub async fn shutdown(&mut self) -> Result<()> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };

        self.shutdown.cancel();
        let crawler = running.crawler.await;
        let loader = running.loader.await;
        crawler.map_err(|err| anyhow!("crawler task failed: {err}"))?;
        loader.map_err(|err| anyhow!("loader task failed: {err}"))?;

        info!("pipeline stopped");
        Ok(())
    }

    /// Run until Ctrl-C (SIGINT) or until the root token is cancelled elsewhere.
    pub async fn run_until_ctrl_c(&mut self) -> Result<()> {
        self.start().await?;
        info!("pipeline running; waiting for Ctrl-C (SIGINT) to shut down");

        let signalled = tokio::select! {
            result = signal::ctrl_c() => {
                info!("Ctrl-C received; shutting down pipeline");
                result.context("Failed to listen for Ctrl-C")
            }
            _ = self.shutdown.cancelled() => {
                info!("pipeline shutdown token cancelled");
                Ok(())
            }
        };

        self.shutdown().await?;
        signalled
    }
}
