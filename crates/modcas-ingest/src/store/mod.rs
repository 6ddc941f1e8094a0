//! Durable storage for the feed cursor and the file hash record log
//!
//! Every backend implements [`HashStore`]. The pipeline only ever sees an
//! `Arc<dyn HashStore>`; which backend sits behind it is decided once at
//! startup.
//!
//! | backend | cursor | records |
//! |---|---|---|
//! | [`FileStore`] | `latest` file, replaced by rename | `cid.csv` append log |
//! | [`SqlStore`] | single-row `feed_cursor` table | `file_hashes` table |
//! | [`MemoryStore`] | in memory | in memory, with fault injection |

pub mod file;
pub mod memory;
pub mod retry;
pub mod sql;

use async_trait::async_trait;
use modcas_common::FileHashRecord;

use crate::error::StoreError;

pub use file::FileStore;
pub use memory::{AppendFault, MemoryStore};
pub use retry::{retry_on_conflict, RetryPolicy};
pub use sql::SqlStore;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Persistence contract shared by all backends
#[async_trait]
pub trait HashStore: Send + Sync {
    /// Short backend name for logs
    fn backend(&self) -> &'static str;

    /// Last persisted cursor, or an empty string if none was ever written.
    async fn read_cursor(&self) -> Result<String>;

    /// Replace the persisted cursor.
    async fn write_cursor(&self, cursor: &str) -> Result<()>;

    /// Append one release's records.
    ///
    /// Atomic: readers observe either the whole batch or none of it. Safe to
    /// call concurrently from several workers.
    async fn append_records(&self, batch: &[FileHashRecord]) -> Result<()>;
}
