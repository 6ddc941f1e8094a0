//! Relational backend on SQLite via sqlx
//!
//! Cursor upserts and batch inserts each run as one transaction driven by
//! [`retry_on_conflict`], so a busy database costs a retry rather than a lost
//! batch.

use async_trait::async_trait;
use modcas_common::FileHashRecord;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use sqlx::Row;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

use super::{retry_on_conflict, HashStore, Result, RetryPolicy};
use crate::error::StoreError;

/// Default number of pooled connections.
pub const DEFAULT_MAX_CONNECTIONS: u32 = 4;

/// Relational [`HashStore`]
pub struct SqlStore {
    pool: SqlitePool,
    retry: RetryPolicy,
}

impl SqlStore {
    /// Connect to `dsn` (e.g. `sqlite:/data/modcas.db`) and apply the schema.
    pub async fn connect(dsn: &str, max_connections: u32) -> Result<Self> {
        let in_memory = dsn.contains(":memory:");
        let mut options = SqliteConnectOptions::from_str(dsn)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_millis(250));
        if !in_memory {
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // Every connection to `sqlite::memory:` is a separate database.
        let max_connections = if in_memory { 1 } else { max_connections.max(1) };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Wrap an existing pool and apply the schema.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("sql store schema ready");

        Ok(Self {
            pool,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Every record in insertion order.
    pub async fn read_records(&self) -> Result<Vec<FileHashRecord>> {
        let rows = sqlx::query("SELECT module, version, file, cid FROM file_hashes ORDER BY seq")
            .fetch_all(&self.pool)
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| FileHashRecord {
                module: row.get("module"),
                version: row.get("version"),
                file: row.get("file"),
                cid: row.get("cid"),
            })
            .collect())
    }

    async fn upsert_cursor_once(&self, cursor: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO feed_cursor (id, value) VALUES (1, ?1)
            ON CONFLICT(id) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(cursor)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn insert_batch_once(&self, batch: &[FileHashRecord]) -> Result<()> {
        // Dropping `tx` on any error path rolls the whole batch back.
        let mut tx = self.pool.begin().await?;
        for record in batch {
            sqlx::query("INSERT INTO file_hashes (module, version, file, cid) VALUES (?1, ?2, ?3, ?4)")
                .bind(&record.module)
                .bind(&record.version)
                .bind(&record.file)
                .bind(&record.cid)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}

#[async_trait]
impl HashStore for SqlStore {
    fn backend(&self) -> &'static str {
        "sql"
    }

    async fn read_cursor(&self) -> Result<String> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM feed_cursor WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        Ok(value.unwrap_or_default())
    }

    async fn write_cursor(&self, cursor: &str) -> Result<()> {
        retry_on_conflict(
            self.retry,
            |_| self.upsert_cursor_once(cursor),
            StoreError::is_conflict,
        )
        .await
    }

    async fn append_records(&self, batch: &[FileHashRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        retry_on_conflict(
            self.retry,
            |_| self.insert_batch_once(batch),
            StoreError::is_conflict,
        )
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use sqlx::{Connection, SqliteConnection};

    async fn memory_store() -> SqlStore {
        SqlStore::connect("sqlite::memory:", DEFAULT_MAX_CONNECTIONS)
            .await
            .unwrap()
    }

    fn record(version: &str, file: &str) -> FileHashRecord {
        FileHashRecord {
            module: "example.com/m".into(),
            version: version.into(),
            file: file.into(),
            cid: format!("cid-{version}-{file}"),
        }
    }

    #[tokio::test]
    async fn test_cursor_roundtrip() {
        let store = memory_store().await;
        assert_eq!(store.read_cursor().await.unwrap(), "");

        store.write_cursor("t1").await.unwrap();
        store.write_cursor("t2").await.unwrap();
        assert_eq!(store.read_cursor().await.unwrap(), "t2");

        let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM feed_cursor")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[tokio::test]
    async fn test_duplicate_batches_are_kept() {
        let store = memory_store().await;
        let batch = vec![record("v1.0.0", ""), record("v1.0.0", "go.mod")];

        store.append_records(&batch).await.unwrap();
        store.append_records(&batch).await.unwrap();

        let records = store.read_records().await.unwrap();
        assert_eq!(records.len(), 4);
        assert_eq!(records[2], batch[0]);
    }

    #[tokio::test]
    async fn test_failure_mid_batch_leaves_no_rows() {
        let store = memory_store().await;
        store.append_records(&[record("v0.9.0", "")]).await.unwrap();

        // The first two rows of the next batch go in, the third aborts.
        sqlx::query(
            r#"
            CREATE TRIGGER fail_third_row BEFORE INSERT ON file_hashes
            WHEN (SELECT COUNT(*) FROM file_hashes) >= 3
            BEGIN
                SELECT RAISE(ABORT, 'disk full');
            END
            "#,
        )
        .execute(store.pool())
        .await
        .unwrap();

        let batch: Vec<_> = ["", "go.mod", "a.go", "b.go"]
            .into_iter()
            .map(|file| record("v1.0.0", file))
            .collect();
        let err = store.append_records(&batch).await.unwrap_err();
        assert!(!err.is_conflict());

        let records = store.read_records().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].version, "v0.9.0");
    }

    #[tokio::test]
    async fn test_busy_database_is_retried_into_one_batch() {
        let dir = tempfile::TempDir::new().unwrap();
        let dsn = format!("sqlite:{}", dir.path().join("modcas.db").display());
        let store = SqlStore::connect(&dsn, 2)
            .await
            .unwrap()
            .with_retry_policy(
                RetryPolicy::default()
                    .with_max_attempts(20)
                    .with_delays(Duration::from_millis(50), Duration::from_millis(200)),
            );

        // Another writer holds the write lock past the store's busy timeout.
        let mut holder = SqliteConnection::connect(&dsn).await.unwrap();
        sqlx::query("BEGIN IMMEDIATE").execute(&mut holder).await.unwrap();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(600)).await;
            sqlx::query("COMMIT").execute(&mut holder).await.unwrap();
            holder
        });

        let started = std::time::Instant::now();
        let batch = vec![record("v1.0.0", ""), record("v1.0.0", "go.mod")];
        store.append_records(&batch).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        release.await.unwrap();

        assert_eq!(store.read_records().await.unwrap(), batch);
    }

    #[tokio::test]
    async fn test_file_database_reopens_with_cursor() {
        let dir = tempfile::TempDir::new().unwrap();
        let dsn = format!("sqlite:{}", dir.path().join("modcas.db").display());

        {
            let store = SqlStore::connect(&dsn, 2).await.unwrap();
            store.write_cursor("t9").await.unwrap();
            store.append_records(&[record("v2.0.0", "")]).await.unwrap();
            store.pool().close().await;
        }

        let store = SqlStore::connect(&dsn, 2).await.unwrap();
        assert_eq!(store.read_cursor().await.unwrap(), "t9");
        assert_eq!(store.read_records().await.unwrap().len(), 1);
    }
}
