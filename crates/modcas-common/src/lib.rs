//! modcas Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types and utilities for the modcas workspace.
//!
//! # Overview
//!
//! - **Types**: feed entries, release notifications and file hash records
//! - **Checksums**: deterministic content digests
//! - **Logging**: tracing subscriber configuration shared by every binary
//!
//! # Example
//!
//! ```no_run
//! use modcas_common::checksum::content_id;
//! use modcas_common::logging::{init_logging, LogConfig};
//!
//! fn main() -> anyhow::Result<()> {
//!     init_logging(&LogConfig::from_env()?)?;
//!     tracing::info!(cid = %content_id(b"hello"), "addressed");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use types::{FeedEntry, FileHashRecord, ReleaseNotification};
