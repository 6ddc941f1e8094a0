//! modcas Ingest Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Continuously content-addresses Go module releases.
//!
//! # Pipeline
//!
//! - **Crawler** ([`feed`]): polls the module index with a resumable cursor
//! - **Dispatcher** ([`loader`]): fetches each release from the module mirror
//!   with bounded concurrency
//! - **Addressing** ([`blobstore`], [`archive`]): stores the whole zip unpinned
//!   and every file in it pinned
//! - **Persistence** ([`store`]): appends `(module, version, file, cid)`
//!   records and the feed cursor to a flat-file or SQLite backend
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use modcas_ingest::{blobstore::IpfsClient, store::FileStore, Pipeline, PipelineConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let store = Arc::new(FileStore::open("./data").await?);
//!     let ipfs = Arc::new(IpfsClient::new(reqwest::Client::new(), "http://127.0.0.1:5001"));
//!
//!     let mut pipeline = Pipeline::new(PipelineConfig::default(), store, ipfs);
//!     pipeline.run_until_ctrl_c().await
//! }
//! ```

pub mod archive;
pub mod blobstore;
pub mod buffer_pool;
pub mod commit;
pub mod config;
pub mod error;
pub mod feed;
pub mod loader;
pub mod pipeline;
pub mod store;

pub use blobstore::{ContentAddresser, IpfsClient, MemoryBlobStore};
pub use buffer_pool::{BufferPool, PooledBuffer};
pub use commit::{CommitTracker, CursorPolicy};
pub use config::{Backend, IngestConfig};
pub use feed::{CrawlerConfig, IndexCrawler};
pub use loader::{Loader, LoaderConfig, LoaderStats, ReleaseOutcome};
pub use pipeline::{Pipeline, PipelineConfig};
pub use store::{FileStore, HashStore, MemoryStore, RetryPolicy, SqlStore};
