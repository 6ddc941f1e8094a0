//! Flat-file backend: a `latest` cursor file and a `cid.csv` append log
//!
//! Cursor and records are not atomic with respect to each other; each is
//! independently durable and the cursor write can simply be repeated.

use async_trait::async_trait;
use modcas_common::FileHashRecord;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{HashStore, Result};

pub const CURSOR_FILE: &str = "latest";
pub const RECORDS_FILE: &str = "cid.csv";

/// Read size used when scanning back for the last complete row.
const TAIL_CHUNK: usize = 64 * 1024;

/// Flat-file [`HashStore`]
pub struct FileStore {
    dir: PathBuf,
    log: Mutex<File>,
    #[cfg(test)]
    write_fault: std::sync::atomic::AtomicUsize,
}

impl FileStore {
    /// Open (creating if needed) the store rooted at `dir`.
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;

        let mut log = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(dir.join(RECORDS_FILE))
            .await?;
        repair_torn_tail(&mut log).await?;

        debug!(dir = %dir.display(), "opened flat-file store");

        Ok(Self {
            dir,
            log: Mutex::new(log),
            #[cfg(test)]
            write_fault: std::sync::atomic::AtomicUsize::new(usize::MAX),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read back every record in the log, in append order.
    pub async fn read_records(&self) -> Result<Vec<FileHashRecord>> {
        let data = {
            let _log = self.log.lock().await;
            fs::read(self.dir.join(RECORDS_FILE)).await?
        };
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(data.as_slice());

        let mut records = Vec::new();
        for row in reader.deserialize() {
            records.push(row?);
        }
        Ok(records)
    }

    fn encode(batch: &[FileHashRecord]) -> Result<Vec<u8>> {
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(Vec::new());
        for record in batch {
            writer.serialize(record)?;
        }
        writer
            .into_inner()
            .map_err(|err| std::io::Error::other(err.to_string()).into())
    }

    /// Make the next append fail after writing `bytes` bytes of its batch.
    #[cfg(test)]
    fn fail_next_write_after(&self, bytes: usize) {
        self.write_fault.store(bytes, std::sync::atomic::Ordering::SeqCst);
    }
}

/// Cut a row left half-written by a crash so the next batch starts on a
/// fresh line.
async fn repair_torn_tail(log: &mut File) -> Result<()> {
    let len = log.metadata().await?.len();
    let mut chunk = vec![0u8; TAIL_CHUNK];
    let mut end = len;
    let mut keep = 0;

    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK as u64);
        let read = (end - start) as usize;
        log.seek(SeekFrom::Start(start)).await?;
        log.read_exact(&mut chunk[..read]).await?;
        if let Some(newline) = chunk[..read].iter().rposition(|b| *b == b'\n') {
            keep = start + newline as u64 + 1;
            break;
        }
        end = start;
    }

    if keep < len {
        warn!(kept = keep, dropped = len - keep, "truncating torn row at the end of the record log");
        log.set_len(keep).await?;
    }
    Ok(())
}

#[async_trait]
impl HashStore for FileStore {
    fn backend(&self) -> &'static str {
        "file"
    }

    async fn read_cursor(&self) -> Result<String> {
        match fs::read_to_string(self.dir.join(CURSOR_FILE)).await {
            Ok(cursor) => Ok(cursor.trim().to_string()),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(err) => Err(err.into()),
        }
    }

    async fn write_cursor(&self, cursor: &str) -> Result<()> {
        let tmp = self.dir.join(format!("{CURSOR_FILE}.tmp"));
        let mut file = File::create(&tmp).await?;
        file.write_all(cursor.as_bytes()).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&tmp, self.dir.join(CURSOR_FILE)).await?;
        Ok(())
    }

    async fn append_records(&self, batch: &[FileHashRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }

        // Encode up front so an encoding failure never touches the log.
        let bytes = Self::encode(batch)?;

        let mut log = self.log.lock().await;
        let committed_len = log.metadata().await?.len();

        let written = async {
            #[cfg(test)]
            {
                let limit = self.write_fault.swap(usize::MAX, std::sync::atomic::Ordering::SeqCst);
                if limit != usize::MAX {
                    log.write_all(&bytes[..limit.min(bytes.len())]).await?;
                    log.flush().await?;
                    return Err(std::io::Error::other("injected write failure"));
                }
            }
            log.write_all(&bytes).await?;
            log.flush().await?;
            log.sync_data().await
        }
        .await;

        if let Err(err) = written {
            warn!(error = %err, records = batch.len(), "record log write failed, truncating partial batch");
            log.set_len(committed_len).await?;
            return Err(err.into());
        }

        Ok(())
    }
}
