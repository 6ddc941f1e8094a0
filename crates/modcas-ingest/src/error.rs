//! Error types for the ingestion pipeline
//!
//! Each seam of the pipeline has its own error so callers can tell transient
//! failures (worth retrying at the next cycle) from everything else.

use thiserror::Error;

/// Persistence layer failure
#[derive(Error, Debug)]
pub enum StoreError {
    /// Flat-file I/O failed
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be encoded or decoded as CSV
    #[error("Record log encoding error: {0}")]
    Csv(#[from] csv::Error),

    /// Relational backend failure
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Schema bootstrap failed
    #[error("Migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// Transient contention reported by a backend; safe to retry the whole unit of work
    #[error("Write conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Whether retrying the same transaction may succeed.
    pub fn is_conflict(&self) -> bool {
        match self {
            StoreError::Conflict(_) => true,
            StoreError::Database(err) => is_retryable_sqlx(err),
            _ => false,
        }
    }
}

/// SQLite busy/locked (extended) result codes and PostgreSQL-wire
/// serialization failure / deadlock SQLSTATEs.
const RETRYABLE_CODES: &[&str] = &["5", "6", "261", "262", "517", "773", "40001", "40P01"];

/// Classify a driver error as transient contention.
pub fn is_retryable_sqlx(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db) => db
            .code()
            .map(|code| RETRYABLE_CODES.contains(&&*code))
            .unwrap_or(false),
        _ => false,
    }
}

/// Blob store failure
#[derive(Error, Debug)]
pub enum BlobStoreError {
    #[error("Blob store request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Blob store returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Blob store response missing content id")]
    MissingHash,
}

/// Archive download failure for one release
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Mirror request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Mirror returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Archive larger than {limit} bytes: {url}")]
    TooLarge { limit: usize, url: String },

    #[error("Download cancelled")]
    Cancelled,
}

/// Archive could not be opened as a zip container
#[derive(Error, Debug)]
#[error("Invalid archive: {0}")]
pub struct ArchiveError(#[from] pub zip::result::ZipError);

/// Change-feed round failure; the round ends and is retried from the last handed-off cursor
#[derive(Error, Debug)]
pub enum FeedError {
    #[error("Feed request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Feed returned {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Feed stream broken: {0}")]
    Stream(#[source] std::io::Error),
}

/// Why a release was abandoned before persistence
#[derive(Error, Debug)]
pub enum ReleaseError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error(transparent)]
    Archive(#[from] ArchiveError),

    #[error(transparent)]
    BlobStore(#[from] BlobStoreError),
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_classification() {
        assert!(StoreError::conflict("busy").is_conflict());
        assert!(!StoreError::Io(std::io::Error::other("disk full")).is_conflict());
        assert!(!StoreError::Database(sqlx::Error::RowNotFound).is_conflict());
        assert!(!is_retryable_sqlx(&sqlx::Error::PoolTimedOut));
    }
}
