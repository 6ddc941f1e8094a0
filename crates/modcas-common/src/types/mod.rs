//! Common types used across modcas

use serde::{Deserialize, Serialize};

// ============================================================================
// Feed Types
// ============================================================================

/// One entry of the upstream module index.
///
/// Field names follow the upstream wire format, which capitalises them.
/// `Timestamp` is an opaque position token: it is passed back verbatim as the
/// `since` parameter and never parsed.
///
/// # Examples
///
/// ```rust
/// use modcas_common::types::FeedEntry;
///
/// let line = r#"{"Path":"golang.org/x/text","Version":"v0.3.0","Timestamp":"2019-04-10T19:08:52.997264Z"}"#;
/// let entry: FeedEntry = serde_json::from_str(line).unwrap();
/// assert_eq!(entry.path, "golang.org/x/text");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    /// Module path (e.g., "golang.org/x/text")
    #[serde(rename = "Path")]
    pub path: String,

    /// Module version (e.g., "v0.3.0")
    #[serde(rename = "Version")]
    pub version: String,

    /// Feed position token of this entry
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
}

/// A release handed from the poller to the dispatcher.
///
/// Created once per feed entry and consumed by exactly one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseNotification {
    /// Module path
    pub module_path: String,

    /// Module version
    pub version: String,

    /// Feed position of the entry that announced this release
    pub cursor: String,

    /// Hand-off sequence number, strictly increasing within one poller run
    pub seq: u64,
}

impl ReleaseNotification {
    /// Build a notification from a decoded feed entry.
    pub fn from_entry(entry: FeedEntry, seq: u64) -> Self {
        Self {
            module_path: entry.path,
            version: entry.version,
            cursor: entry.timestamp,
            seq,
        }
    }
}

impl std::fmt::Display for ReleaseNotification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.module_path, self.version)
    }
}

// ============================================================================
// Record Types
// ============================================================================

/// Content id recorded for one file of a release.
///
/// An empty `file` denotes the whole archive bundle. Records are append-only
/// and not unique-keyed: re-delivered releases produce duplicate rows.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileHashRecord {
    /// Module path
    pub module: String,

    /// Module version
    pub version: String,

    /// File name inside the archive, empty for the bundle itself
    pub file: String,

    /// Content identifier returned by the blob store
    pub cid: String,
}

impl FileHashRecord {
    /// Record for the whole archive of a release.
    pub fn bundle(release: &ReleaseNotification, cid: impl Into<String>) -> Self {
        Self::file(release, "", cid)
    }

    /// Record for one file inside the archive of a release.
    pub fn file(
        release: &ReleaseNotification,
        name: impl Into<String>,
        cid: impl Into<String>,
    ) -> Self {
        Self {
            module: release.module_path.clone(),
            version: release.version.clone(),
            file: name.into(),
            cid: cid.into(),
        }
    }

    /// Whether this record describes the whole bundle rather than one file.
    pub fn is_bundle(&self) -> bool {
        self.file.is_empty()
    }
}
