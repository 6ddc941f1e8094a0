//! Cursor advancement policies
//!
//! Under [`CursorPolicy::Eager`] the crawler persists its cursor at the end of
//! every round. Under [`CursorPolicy::AfterCommit`] the crawler registers each
//! handed-off release with a [`CommitTracker`] and the cursor only moves past a
//! release once it and every release before it have settled.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::loader::ReleaseOutcome;
use crate::store::HashStore;

/// When the persisted feed cursor may move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CursorPolicy {
    /// Persist at the end of each crawler round, regardless of release outcomes
    #[default]
    Eager,
    /// Persist only the cursor of the longest contiguous run of settled releases
    AfterCommit,
}

impl fmt::Display for CursorPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CursorPolicy::Eager => write!(f, "eager"),
            CursorPolicy::AfterCommit => write!(f, "after-commit"),
        }
    }
}

impl FromStr for CursorPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "eager" => Ok(CursorPolicy::Eager),
            "after-commit" | "after_commit" => Ok(CursorPolicy::AfterCommit),
            other => Err(format!("unknown cursor policy: {other}")),
        }
    }
}

#[derive(Debug)]
enum Slot {
    InFlight(String),
    Settled(String),
    Failed,
}

#[derive(Default)]
struct TrackerState {
    pending: BTreeMap<u64, Slot>,
    pinned_at: Option<u64>,
    unwritten: Option<String>,
    last_written: Option<String>,
}

/// Tracks handed-off releases by sequence number and persists the cursor of
/// the settled prefix.
pub struct CommitTracker {
    store: Arc<dyn HashStore>,
    state: Mutex<TrackerState>,
}

impl CommitTracker {
    pub fn new(store: Arc<dyn HashStore>) -> Self {
        Self {
            store,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Record a release about to be handed to the dispatcher.
    ///
    /// Must be called before the release can settle, i.e. before it is sent.
    pub async fn register(&self, seq: u64, cursor: &str) {
        let mut state = self.state.lock().await;
        if state.pinned_at.is_some_and(|pinned| seq > pinned) {
            return;
        }
        state.pending.insert(seq, Slot::InFlight(cursor.to_string()));
    }

    /// Record the outcome of release `seq` and persist any cursor progress.
    pub async fn settle(&self, seq: u64, outcome: &ReleaseOutcome) {
        let mut guard = self.state.lock().await;
        let state = &mut *guard;

        match state.pending.get_mut(&seq) {
            None => return,
            Some(slot) if outcome.settles() => {
                if let Slot::InFlight(cursor) = slot {
                    *slot = Slot::Settled(std::mem::take(cursor));
                }
            }
            Some(slot) => {
                *slot = Slot::Failed;
                state.pinned_at = Some(state.pinned_at.map_or(seq, |pinned| pinned.min(seq)));
                // Nothing past a failed release can ever be persisted.
                let _ = state.pending.split_off(&(seq + 1));
                warn!(seq, "release was not persisted, cursor pinned before it until restart");
            }
        }

        let mut advanced = None;
        while let Some(entry) = state.pending.first_entry() {
            if !matches!(entry.get(), Slot::Settled(_)) {
                break;
            }
            if let Slot::Settled(cursor) = entry.remove() {
                advanced = Some(cursor);
            }
        }
        if advanced.is_some() {
            state.unwritten = advanced;
        }

        let Some(cursor) = state.unwritten.take() else {
            return;
        };
        match self.store.write_cursor(&cursor).await {
            Ok(()) => {
                debug!(cursor = %cursor, backend = self.store.backend(), "committed cursor advanced");
                state.last_written = Some(cursor);
            }
            Err(err) => {
                error!(cursor = %cursor, error = %err, "failed to persist committed cursor, will retry");
                state.unwritten = Some(cursor);
            }
        }
    }

    /// Last cursor this tracker persisted.
    pub async fn last_written(&self) -> Option<String> {
        self.state.lock().await.last_written.clone()
    }

    /// Releases registered but not yet folded into the persisted cursor.
    pub async fn pending(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn is_pinned(&self) -> bool {
        self.state.lock().await.pinned_at.is_some()
    }
}
