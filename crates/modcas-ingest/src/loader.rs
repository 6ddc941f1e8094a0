//! Bounded-concurrency release dispatcher
//!
//! [`Loader::run`] pulls notifications off the pipeline channel and runs each
//! release in its own task, admitting at most `max_concurrency` at a time. A
//! release is downloaded into a pooled buffer, content-addressed as a whole
//! (unpinned) and per file (pinned), and persisted as one batch.

use bytes::Bytes;
use futures::{FutureExt, StreamExt};
use modcas_common::{FileHashRecord, ReleaseNotification};
use reqwest::StatusCode;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::archive::ModuleArchive;
use crate::blobstore::ContentAddresser;
use crate::buffer_pool::{BufferPool, DEFAULT_ARCHIVE_CAPACITY, DEFAULT_FILE_CAPACITY};
use crate::commit::CommitTracker;
use crate::error::{FetchError, ReleaseError, StoreError};
use crate::store::HashStore;

/// Default module mirror.
pub const DEFAULT_MIRROR_URL: &str = "https://proxy.golang.org";

/// Default number of releases processed at once.
pub const DEFAULT_MAX_CONCURRENCY: usize = 10;

/// Largest module zip the mirror serves.
pub const DEFAULT_MAX_ARCHIVE_BYTES: usize = 500 * 1024 * 1024;

/// Dispatcher settings
#[derive(Debug, Clone)]
pub struct LoaderConfig {
    pub mirror_url: String,
    pub max_concurrency: usize,
    /// Capacity requested from the pool for each archive download
    pub archive_capacity: usize,
    /// Capacity requested from the pool for each unpacked file
    pub file_capacity: usize,
    /// Downloads beyond this size are abandoned
    pub max_archive_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            mirror_url: DEFAULT_MIRROR_URL.to_string(),
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            archive_capacity: DEFAULT_ARCHIVE_CAPACITY,
            file_capacity: DEFAULT_FILE_CAPACITY,
            max_archive_bytes: DEFAULT_MAX_ARCHIVE_BYTES,
        }
    }
}

impl LoaderConfig {
    pub fn with_mirror_url(mut self, url: impl Into<String>) -> Self {
        self.mirror_url = url.into();
        self
    }

    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.max_concurrency = max_concurrency;
        self
    }

    pub fn with_buffer_capacities(mut self, archive: usize, file: usize) -> Self {
        self.archive_capacity = archive;
        self.file_capacity = file;
        self
    }

    pub fn with_max_archive_bytes(mut self, max: usize) -> Self {
        self.max_archive_bytes = max;
        self
    }
}

/// Result of processing one release
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// The batch with this many records was persisted
    Committed(usize),
    /// Abandoned before persistence; nothing was written
    Skipped(ReleaseError),
    /// Addressed, but the batch could not be persisted
    PersistFailed(StoreError),
    /// Processing panicked part way through
    Panicked(String),
}

impl ReleaseOutcome {
    /// Whether the after-commit cursor may move past this release.
    pub fn settles(&self) -> bool {
        !matches!(self, ReleaseOutcome::PersistFailed(_) | ReleaseOutcome::Panicked(_))
    }

    pub fn is_committed(&self) -> bool {
        matches!(self, ReleaseOutcome::Committed(_))
    }
}

/// Dispatcher counters
#[derive(Debug, Default)]
pub struct LoaderStats {
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    succeeded: AtomicU64,
    failed: AtomicU64,
    records_persisted: AtomicU64,
}

/// Point-in-time copy of [`LoaderStats`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoaderSnapshot {
    pub in_flight: usize,
    pub peak_in_flight: usize,
    pub succeeded: u64,
    pub failed: u64,
    pub records_persisted: u64,
}

impl LoaderStats {
    pub fn snapshot(&self) -> LoaderSnapshot {
        LoaderSnapshot {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            peak_in_flight: self.peak_in_flight.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            records_persisted: self.records_persisted.load(Ordering::SeqCst),
        }
    }

    fn enter(&self) -> InFlight<'_> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        InFlight(self)
    }

    fn record(&self, outcome: &ReleaseOutcome) {
        match outcome {
            ReleaseOutcome::Committed(records) => {
                self.succeeded.fetch_add(1, Ordering::SeqCst);
                self.records_persisted.fetch_add(*records as u64, Ordering::SeqCst);
            }
            ReleaseOutcome::Skipped(_) | ReleaseOutcome::PersistFailed(_) | ReleaseOutcome::Panicked(_) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
            }
        }
    }
}

struct InFlight<'a>(&'a LoaderStats);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Escape a module path or version for the module proxy protocol: every
/// uppercase letter becomes `!` followed by its lowercase form.
pub fn escape_path(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii_uppercase() {
            escaped.push('!');
            escaped.push(c.to_ascii_lowercase());
        } else {
            escaped.push(c);
        }
    }
    escaped
}

/// Mirror URL of a release's zip.
pub fn archive_url(mirror_url: &str, module_path: &str, version: &str) -> String {
    format!(
        "{}/{}/@v/{}.zip",
        mirror_url.trim_end_matches('/'),
        escape_path(module_path),
        escape_path(version)
    )
}

struct Inner {
    config: LoaderConfig,
    client: reqwest::Client,
    store: Arc<dyn HashStore>,
    addresser: Arc<dyn ContentAddresser>,
    pool: BufferPool,
    stats: Arc<LoaderStats>,
    tracker: Option<Arc<CommitTracker>>,
}

/// Release dispatcher
#[derive(Clone)]
pub struct Loader {
    inner: Arc<Inner>,
}

impl Loader {
    pub fn new(
        config: LoaderConfig,
        client: reqwest::Client,
        store: Arc<dyn HashStore>,
        addresser: Arc<dyn ContentAddresser>,
    ) -> Self {
        Self::with_parts(config, client, store, addresser, BufferPool::default(), None)
    }

    pub fn with_parts(
        config: LoaderConfig,
        client: reqwest::Client,
        store: Arc<dyn HashStore>,
        addresser: Arc<dyn ContentAddresser>,
        pool: BufferPool,
        tracker: Option<Arc<CommitTracker>>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                client,
                store,
                addresser,
                pool,
                stats: Arc::new(LoaderStats::default()),
                tracker,
            }),
        }
    }

    pub fn stats(&self) -> Arc<LoaderStats> {
        self.inner.stats.clone()
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    /// Dispatch releases until the channel closes or `token` is cancelled,
    /// then wait for every in-flight release to finish.
    pub async fn run(&self, mut releases: mpsc::Receiver<ReleaseNotification>, token: CancellationToken) {
        let limit = self.inner.config.max_concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(limit));
        let mut workers = JoinSet::new();

        info!(max_concurrency = limit, mirror = %self.inner.config.mirror_url, "loader started");

        loop {
            let release = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                next = releases.recv() => match next {
                    Some(release) => release,
                    None => {
                        debug!("release channel closed");
                        break;
                    }
                },
            };

            let permit = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    debug!(module = %release.module_path, version = %release.version, "shutdown while waiting for a worker slot");
                    break;
                }
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            while let Some(joined) = workers.try_join_next() {
                log_join(joined);
            }

            let inner = self.inner.clone();
            let worker_token = token.clone();
            let span = info_span!("release", module = %release.module_path, version = %release.version);
            workers.spawn(
                async move {
                    let _permit = permit;
                    inner.handle(release, &worker_token).await;
                }
                .instrument(span),
            );
        }

        drop(releases);
        if !workers.is_empty() {
            info!(in_flight = workers.len(), "waiting for in-flight releases");
        }
        while let Some(joined) = workers.join_next().await {
            log_join(joined);
        }

        let stats = self.inner.stats.snapshot();
        info!(
            succeeded = stats.succeeded,
            failed = stats.failed,
            records = stats.records_persisted,
            "loader stopped"
        );
    }

    /// Fetch, address and persist one release.
    pub async fn process_release(&self, release: &ReleaseNotification, token: &CancellationToken) -> ReleaseOutcome {
        self.inner.process_release(release, token).await
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "release worker panicked");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

impl Inner {
    async fn handle(&self, release: ReleaseNotification, token: &CancellationToken) {
        let _in_flight = self.stats.enter();
        let outcome = match AssertUnwindSafe(self.process_release(&release, token))
            .catch_unwind()
            .await
        {
            Ok(outcome) => outcome,
            Err(panic) => ReleaseOutcome::Panicked(panic_message(panic.as_ref())),
        };
        self.stats.record(&outcome);

        match &outcome {
            ReleaseOutcome::Committed(records) => {
                info!(module = %release.module_path, version = %release.version, records, "release stored");
            }
            ReleaseOutcome::Skipped(err) => {
                warn!(module = %release.module_path, version = %release.version, error = %err, "release skipped");
            }
            ReleaseOutcome::PersistFailed(err) => {
                error!(module = %release.module_path, version = %release.version, error = %err, "failed to persist release records");
            }
            ReleaseOutcome::Panicked(panic) => {
                error!(module = %release.module_path, version = %release.version, panic = %panic, "release worker panicked");
            }
        }

        if let Some(tracker) = &self.tracker {
            tracker.settle(release.seq, &outcome).await;
        }
    }

    async fn process_release(&self, release: &ReleaseNotification, token: &CancellationToken) -> ReleaseOutcome {
        let records = {
            let mut archive = self.pool.acquire(self.config.archive_capacity);
            if let Err(err) = self.download(release, &mut archive, token).await {
                return ReleaseOutcome::Skipped(err.into());
            }
            let bytes = archive.share();
            let addressed = self.address(release, &bytes).await;
            archive.restore(bytes);
            match addressed {
                Ok(records) => records,
                Err(err) => return ReleaseOutcome::Skipped(err),
            }
        };

        match self.store.append_records(&records).await {
            Ok(()) => ReleaseOutcome::Committed(records.len()),
            Err(err) => ReleaseOutcome::PersistFailed(err),
        }
    }

    async fn download(
        &self,
        release: &ReleaseNotification,
        buf: &mut Vec<u8>,
        token: &CancellationToken,
    ) -> Result<(), FetchError> {
        let url = archive_url(&self.config.mirror_url, &release.module_path, &release.version);
        let limit = self.config.max_archive_bytes;

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(FetchError::Cancelled),
            response = self.client.get(&url).send() => response?,
        };

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(FetchError::TooLarge { limit, url });
        }

        let mut body = Box::pin(response.bytes_stream());
        loop {
            let chunk = tokio::select! {
                biased;
                _ = token.cancelled() => return Err(FetchError::Cancelled),
                chunk = body.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;
            if buf.len() + chunk.len() > limit {
                return Err(FetchError::TooLarge { limit, url });
            }
            buf.extend_from_slice(&chunk);
        }

        debug!(url = %url, bytes = buf.len(), "archive downloaded");
        Ok(())
    }

    async fn address(&self, release: &ReleaseNotification, bytes: &Bytes) -> Result<Vec<FileHashRecord>, ReleaseError> {
        let bundle = self.addresser.add(bytes.clone(), false).await?;
        let mut records = vec![FileHashRecord::bundle(release, bundle)];

        let mut archive = ModuleArchive::open(bytes)?;
        let mut file = self.pool.acquire(self.config.file_capacity);

        for index in 0..archive.len() {
            let name = match archive.read_entry(index, &mut file) {
                Ok(Some(name)) => name,
                Ok(None) => continue,
                Err(err) => {
                    warn!(index, error = %err, "skipping unreadable archive entry");
                    continue;
                }
            };
            let contents = file.share();
            let added = self.addresser.add(contents.clone(), true).await;
            file.restore(contents);
            records.push(FileHashRecord::file(release, name, added?));
        }

        Ok(records)
    }
}
