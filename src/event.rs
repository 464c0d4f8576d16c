//! Change events emitted to consumers.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// A change observed on a watched source.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    /// Logical path of the affected file, or `"commit"` / `"tag"` for
    /// repository-mode events.
    pub key: String,

    /// The kind of change.
    pub kind: EventKind,

    /// The backend record at the moment the event was synthesised. For
    /// `Deleted` this is the last-known record.
    pub record: Option<Record>,
}

impl Event {
    /// Create a new event.
    pub fn new(key: impl Into<String>, kind: EventKind, record: Option<Record>) -> Self {
        Self {
            key: key.into(),
            kind,
            record,
        }
    }
}

/// Kind of change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A file appeared that was not in the previous listing.
    Created,

    /// Content, size or modification time changed.
    Changed,

    /// A previously listed file is gone.
    Deleted,

    /// Tags or file mode changed without a content change.
    MetadataChanged,
}

impl EventKind {
    /// The diagnostic token for this kind.
    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Created => "FileCreated",
            EventKind::Changed => "FileChanged",
            EventKind::Deleted => "FileDeleted",
            EventKind::MetadataChanged => "TagsChanged",
        }
    }

    /// Numeric wire code of this kind.
    pub fn code(self) -> u32 {
        match self {
            EventKind::Created => 0,
            EventKind::Changed => 1,
            EventKind::Deleted => 2,
            EventKind::MetadataChanged => 3,
        }
    }

    /// Map a numeric code back to a kind.
    pub fn from_code(code: u32) -> Option<EventKind> {
        match code {
            0 => Some(EventKind::Created),
            1 => Some(EventKind::Changed),
            2 => Some(EventKind::Deleted),
            3 => Some(EventKind::MetadataChanged),
            _ => None,
        }
    }

    /// Diagnostic token for a numeric code, `"unknown"` for anything that is
    /// not a valid kind.
    pub fn token(code: u32) -> &'static str {
        EventKind::from_code(code).map_or("unknown", EventKind::as_str)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backend-specific record attached to an event.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Record {
    /// Local filesystem entry.
    Local(LocalRecord),

    /// Object-store entry.
    Object(ObjectRecord),

    /// Cloud-drive or cloud-file-store entry.
    Drive(DriveRecord),

    /// Blob in a repository tree.
    RepoFile(RepoFileRecord),

    /// New commits or tags in a repository.
    RepoLog(RepoLogRecord),
}

/// A file or directory on the local filesystem.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LocalRecord {
    /// Absolute path.
    pub key: String,

    /// Size in bytes.
    pub size: u64,

    /// Modification time.
    pub last_modified: DateTime<Utc>,

    /// Unix file mode bits.
    pub file_mode: u32,
}

/// An object in an object-store bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ObjectRecord {
    /// Object key.
    pub key: String,

    /// Normalised ETag (lowercase, quotes stripped).
    pub etag: String,

    /// Size in bytes.
    pub size: i64,

    /// Last modification time.
    pub last_modified: DateTime<Utc>,

    /// Object tags.
    pub tags: HashMap<String, String>,
}

/// A file on a cloud drive or cloud file store.
///
/// For providers that address files by opaque id the `id` differs from the
/// reconstructed path; file stores that address by path use the path for
/// both.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DriveRecord {
    /// Provider identity, used as the cache key.
    pub id: String,

    /// Full path of the file.
    pub key: String,

    /// Size in bytes.
    pub size: i64,

    /// Last modification time.
    pub last_modified: DateTime<Utc>,

    /// Provider content hash.
    pub hash: String,
}

/// A blob in the watched repository tree.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoFileRecord {
    /// Path within the tree.
    pub key: String,

    /// Blob size in bytes.
    pub size: u64,

    /// Tree-entry file mode.
    pub file_mode: u32,

    /// Blob hash.
    pub hash: String,
}

/// New commits or tags observed on the watched repository.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoLogRecord {
    /// The new entries, newest first.
    pub commits: Vec<RepoCommit>,
}

/// A single commit or tag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoCommit {
    /// Commit hash, or the hash a tag points at.
    pub hash: String,

    /// Commit message, or the tag name for tag entries.
    pub message: String,

    /// Branch the commit was observed on; empty for tags.
    pub branch: String,

    /// Author name.
    pub author_name: String,

    /// Author email.
    pub author_email: String,

    /// Author timestamp; absent for tags.
    pub time: Option<DateTime<Utc>>,
}
