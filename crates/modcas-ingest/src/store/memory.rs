//! In-process backend with fault injection
//!
//! Batches are staged record by record and only published once the whole
//! batch is staged, so an injected failure part-way through leaves the
//! visible log untouched.

use async_trait::async_trait;
use modcas_common::FileHashRecord;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};

use super::{HashStore, Result};
use crate::error::StoreError;

/// Failure to inject into a future `append_records` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendFault {
    /// Fail with a retryable conflict after staging this many records
    ConflictAfter(usize),
    /// Fail with a non-retryable I/O error after staging this many records
    FatalAfter(usize),
}

#[derive(Default)]
struct State {
    cursor: String,
    records: Vec<FileHashRecord>,
    cursor_writes: Vec<String>,
    append_faults: VecDeque<AppendFault>,
    fail_cursor_writes: u32,
}

/// Memory-backed [`HashStore`]
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    append_calls: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an existing cursor, as if resuming after a restart.
    pub fn with_cursor(cursor: impl Into<String>) -> Self {
        let store = Self::default();
        store.lock().cursor = cursor.into();
        store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue a fault for the next append call that has none queued before it.
    pub fn inject_append_fault(&self, fault: AppendFault) {
        self.lock().append_faults.push_back(fault);
    }

    /// Make the next `count` cursor writes fail.
    pub fn fail_cursor_writes(&self, count: u32) {
        self.lock().fail_cursor_writes = count;
    }

    pub fn records(&self) -> Vec<FileHashRecord> {
        self.lock().records.clone()
    }

    pub fn cursor(&self) -> String {
        self.lock().cursor.clone()
    }

    /// Every successfully written cursor value, oldest first.
    pub fn cursor_history(&self) -> Vec<String> {
        self.lock().cursor_writes.clone()
    }

    /// Number of `append_records` calls, including failed ones.
    pub fn append_calls(&self) -> u32 {
        self.append_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl HashStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn read_cursor(&self) -> Result<String> {
        Ok(self.cursor())
    }

    async fn write_cursor(&self, cursor: &str) -> Result<()> {
        let mut state = self.lock();
        if state.fail_cursor_writes > 0 {
            state.fail_cursor_writes -= 1;
            return Err(StoreError::Io(std::io::Error::other("injected cursor write failure")));
        }
        state.cursor = cursor.to_string();
        state.cursor_writes.push(cursor.to_string());
        Ok(())
    }

    async fn append_records(&self, batch: &[FileHashRecord]) -> Result<()> {
        self.append_calls.fetch_add(1, Ordering::SeqCst);

        let mut state = self.lock();
        let fault = state.append_faults.pop_front();

        let mut staged = Vec::with_capacity(batch.len());
        for record in batch {
            match fault {
                Some(AppendFault::ConflictAfter(n)) if staged.len() == n => {
                    return Err(StoreError::conflict("injected write conflict"));
                }
                Some(AppendFault::FatalAfter(n)) if staged.len() == n => {
                    return Err(StoreError::Io(std::io::Error::other("injected write failure")));
                }
                _ => staged.push(record.clone()),
            }
        }

        state.records.extend(staged);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::{retry_on_conflict, RetryPolicy};
    use std::time::Duration;

    fn batch(n: usize) -> Vec<FileHashRecord> {
        (0..n)
            .map(|i| FileHashRecord {
                module: "example.com/m".into(),
                version: "v1.0.0".into(),
                file: if i == 0 { String::new() } else { format!("f{i}.go") },
                cid: format!("cid-{i}"),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_failure_mid_batch_leaves_nothing_visible() {
        let store = MemoryStore::new();
        store.append_records(&batch(2)).await.unwrap();

        store.inject_append_fault(AppendFault::FatalAfter(3));
        let err = store.append_records(&batch(5)).await.unwrap_err();

        assert!(!err.is_conflict());
        assert_eq!(store.records().len(), 2);
    }

    #[tokio::test]
    async fn test_single_conflict_then_retry_yields_one_batch() {
        let store = MemoryStore::new();
        store.inject_append_fault(AppendFault::ConflictAfter(1));
        let records = batch(4);

        retry_on_conflict(
            RetryPolicy::default().with_delays(Duration::ZERO, Duration::ZERO),
            |_| store.append_records(&records),
            StoreError::is_conflict,
        )
        .await
        .unwrap();

        assert_eq!(store.append_calls(), 2);
        assert_eq!(store.records(), records);
    }

    #[tokio::test]
    async fn test_cursor_write_failures_are_counted() {
        let store = MemoryStore::with_cursor("t0");
        store.fail_cursor_writes(1);

        assert!(store.write_cursor("t1").await.is_err());
        store.write_cursor("t2").await.unwrap();

        assert_eq!(store.read_cursor().await.unwrap(), "t2");
        assert_eq!(store.cursor_history(), vec!["t2".to_string()]);
    }
}
