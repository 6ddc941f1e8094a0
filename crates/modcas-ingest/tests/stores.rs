//! Contract tests run against every persistence backend

use modcas_common::FileHashRecord;
use modcas_ingest::store::{FileStore, HashStore, MemoryStore, SqlStore};
use std::sync::Arc;
use tempfile::TempDir;

fn batch(version: &str, files: usize) -> Vec<FileHashRecord> {
    std::iter::once(String::new())
        .chain((0..files).map(|i| format!("f{i}.go")))
        .map(|file| FileHashRecord {
            module: "example.com/m".into(),
            version: version.into(),
            cid: format!("cid-{version}-{file}"),
            file,
        })
        .collect()
}

async fn backends(dir: &TempDir) -> Vec<Arc<dyn HashStore>> {
    vec![
        Arc::new(FileStore::open(dir.path()).await.unwrap()),
        Arc::new(SqlStore::connect("sqlite::memory:", 1).await.unwrap()),
        Arc::new(MemoryStore::new()),
    ]
}

#[tokio::test]
async fn test_cursor_contract() {
    let dir = TempDir::new().unwrap();
    for store in backends(&dir).await {
        assert_eq!(store.read_cursor().await.unwrap(), "", "{}", store.backend());

        store.write_cursor("2019-04-10T19:08:52.997264Z").await.unwrap();
        store.write_cursor("2019-04-10T19:09:00.000000Z").await.unwrap();
        assert_eq!(
            store.read_cursor().await.unwrap(),
            "2019-04-10T19:09:00.000000Z",
            "{}",
            store.backend()
        );
    }
}

#[tokio::test]
async fn test_empty_batch_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    for store in backends(&dir).await {
        store.append_records(&[]).await.unwrap();
    }
    let file = FileStore::open(dir.path()).await.unwrap();
    assert!(file.read_records().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_batches_stay_whole() {
    let dir = TempDir::new().unwrap();
    let file = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let sql = Arc::new(SqlStore::connect("sqlite::memory:", 1).await.unwrap());

    let mut tasks = tokio::task::JoinSet::new();
    for i in 0..6 {
        let version = format!("v1.0.{i}");
        let file = file.clone();
        let sql = sql.clone();
        tasks.spawn(async move {
            let records = batch(&version, 10);
            file.append_records(&records).await.unwrap();
            sql.append_records(&records).await.unwrap();
        });
    }
    while let Some(joined) = tasks.join_next().await {
        joined.unwrap();
    }

    for records in [file.read_records().await.unwrap(), sql.read_records().await.unwrap()] {
        assert_eq!(records.len(), 66);
        for chunk in records.chunks(11) {
            assert!(chunk[0].is_bundle());
            assert!(chunk.iter().all(|r| r.version == chunk[0].version));
        }
    }
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = TempDir::new().unwrap();
    {
        let store = FileStore::open(dir.path()).await.unwrap();
        store.append_records(&batch("v1.0.0", 2)).await.unwrap();
        store.write_cursor("t1").await.unwrap();
    }

    let store = FileStore::open(dir.path()).await.unwrap();
    store.append_records(&batch("v1.0.1", 1)).await.unwrap();

    assert_eq!(store.read_cursor().await.unwrap(), "t1");
    let records = store.read_records().await.unwrap();
    assert_eq!(records.len(), 5);
    assert_eq!(records[3].version, "v1.0.1");
}
