//! Types for the metadata store.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Stable identifier of a logical file. Survives renames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FileId(pub Uuid);

impl FileId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn parse(s: &str) -> Option<Self> {
        Uuid::parse_str(s).ok().map(Self)
    }
}

impl Default for FileId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Device + inode pair. Survives renames within a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    pub device: u64,
    pub inode: u64,
}

impl FileIdentity {
    #[cfg(unix)]
    pub fn from_metadata(meta: &std::fs::Metadata) -> Option<Self> {
        use std::os::unix::fs::MetadataExt;
        Some(Self {
            device: meta.dev(),
            inode: meta.ino(),
        })
    }

    #[cfg(not(unix))]
    pub fn from_metadata(_meta: &std::fs::Metadata) -> Option<Self> {
        None
    }

    pub fn of_path(path: &Path) -> Option<Self> {
        std::fs::symlink_metadata(path)
            .ok()
            .and_then(|meta| Self::from_metadata(&meta))
    }
}

/// SHA-256 content fingerprint. Identifies both whole files and chunks.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(pub [u8; 32]);

impl Fingerprint {
    pub fn of(bytes: &[u8]) -> Self {
        Self(Sha256::digest(bytes).into())
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(Self(out))
    }

    /// Abbreviated form for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl std::fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fingerprint({})", self.short())
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::from_hex(&s).ok_or_else(|| serde::de::Error::custom("invalid fingerprint"))
    }
}

/// One entry of a version manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRef {
    pub fingerprint: Fingerprint,
    pub offset: u64,
    pub length: u32,
}

/// Sync status of a tracked file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Current content is committed on the backend.
    Clean,
    /// A version is allocated but not yet uploading.
    Pending,
    /// A version is being transferred.
    Uploading,
    /// The backend chain diverged; a conflict copy was written.
    Conflict,
    /// The last attempt failed terminally (retried on the next scan).
    Failed,
}

impl SyncStatus {
    /// Convert to the string stored in the database.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Clean => "clean",
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Conflict => "conflict",
            Self::Failed => "failed",
        }
    }

    /// Parse from the string stored in the database.
    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "clean" => Some(Self::Clean),
            "pending" => Some(Self::Pending),
            "uploading" => Some(Self::Uploading),
            "conflict" => Some(Self::Conflict),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Lifecycle of a file version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionState {
    Pending,
    Committed,
}

impl VersionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Committed => "committed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "committed" => Some(Self::Committed),
            _ => None,
        }
    }
}

/// A tracked file record.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedFile {
    pub id: FileId,
    pub path: PathBuf,
    pub identity: Option<FileIdentity>,
    /// Last committed version, `None` before the first commit.
    pub current_version: Option<u64>,
    pub current_fingerprint: Option<Fingerprint>,
    pub size_bytes: u64,
    pub status: SyncStatus,
    pub last_error: Option<String>,
    pub last_checked_at: Option<DateTime<Utc>>,
    /// Timestamp of the newest change event applied to this file.
    pub last_event_at: Option<DateTime<Utc>>,
    /// The current committed version is a tombstone.
    pub deleted: bool,
}

impl TrackedFile {
    pub fn new(path: PathBuf, identity: Option<FileIdentity>) -> Self {
        Self {
            id: FileId::new(),
            path,
            identity,
            current_version: None,
            current_fingerprint: None,
            size_bytes: 0,
            status: SyncStatus::Pending,
            last_error: None,
            last_checked_at: None,
            last_event_at: None,
            deleted: false,
        }
    }
}

/// One version of a file. Immutable once committed.
#[derive(Debug, Clone, PartialEq)]
pub struct FileVersion {
    pub file_id: FileId,
    pub version: u64,
    pub fingerprint: Fingerprint,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
    pub manifest: Vec<ChunkRef>,
    pub tombstone: bool,
    pub state: VersionState,
}

impl FileVersion {
    /// Whether two versions describe the same content.
    pub fn same_content(&self, fingerprint: &Fingerprint, tombstone: bool) -> bool {
        self.tombstone == tombstone && (tombstone || self.fingerprint == *fingerprint)
    }
}

/// What started a sync run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    /// Engine startup reconciliation followed by live watching.
    Realtime,
    /// Periodic full rescan.
    Scheduled,
    /// Explicitly requested rescan.
    User,
}

impl RunSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Realtime => "realtime",
            Self::Scheduled => "scheduled",
            Self::User => "user",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "realtime" => Some(Self::Realtime),
            "scheduled" => Some(Self::Scheduled),
            "user" => Some(Self::User),
            _ => None,
        }
    }
}

/// Statistics for a sync run.
#[derive(Debug, Clone, Default)]
pub struct SyncRunStats {
    pub files_seen: u64,
    pub versions_committed: u64,
    pub files_failed: u64,
    pub interrupted: bool,
}

/// A recorded sync run.
#[derive(Debug, Clone)]
pub struct SyncRunRecord {
    pub id: i64,
    pub source: RunSource,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stats: SyncRunStats,
}

/// Summary of the store contents.
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub total_files: u64,
    pub clean: u64,
    pub pending: u64,
    pub failed: u64,
    pub conflicts: u64,
    pub deleted: u64,
    pub committed_versions: u64,
    pub pending_versions: u64,
    pub known_chunks: u64,
    pub gc_queued: u64,
    pub last_sync_started: Option<DateTime<Utc>>,
    pub last_sync_completed: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sync_status_roundtrip() {
        for status in [
            SyncStatus::Clean,
            SyncStatus::Pending,
            SyncStatus::Uploading,
            SyncStatus::Conflict,
            SyncStatus::Failed,
        ] {
            assert_eq!(SyncStatus::from_str(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::from_str("bogus"), None);
    }

    #[test]
    fn test_fingerprint_hex() {
        let fp = Fingerprint::of(b"hello");
        assert_eq!(
            fp.to_hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(Fingerprint::from_hex(&fp.to_hex()), Some(fp));
        assert_eq!(Fingerprint::from_hex("abcd"), None);
        assert_eq!(Fingerprint::from_hex("zz"), None);
    }

    #[test]
    fn test_fingerprint_serde_is_hex_string() {
        let fp = Fingerprint::of(b"x");
        let json = serde_json::to_string(&fp).unwrap();
        assert_eq!(json, format!("\"{}\"", fp.to_hex()));
        let back: Fingerprint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, fp);
    }

    #[test]
    fn test_same_content() {
        let fp = Fingerprint::of(b"a");
        let version = FileVersion {
            file_id: FileId::new(),
            version: 1,
            fingerprint: fp,
            size_bytes: 1,
            created_at: Utc::now(),
            manifest: Vec::new(),
            tombstone: false,
            state: VersionState::Committed,
        };
        assert!(version.same_content(&fp, false));
        assert!(!version.same_content(&Fingerprint::of(b"b"), false));
        assert!(!version.same_content(&fp, true));
    }

    #[test]
    fn test_new_tracked_file_is_pending() {
        let file = TrackedFile::new(PathBuf::from("/tmp/a.txt"), None);
        assert_eq!(file.status, SyncStatus::Pending);
        assert_eq!(file.current_version, None);
        assert!(!file.deleted);
    }

    #[cfg(unix)]
    #[test]
    fn test_identity_stable_across_rename() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"data").unwrap();
        let before = FileIdentity::of_path(&a).unwrap();
        std::fs::rename(&a, &b).unwrap();
        assert_eq!(FileIdentity::of_path(&b), Some(before));
        assert_eq!(FileIdentity::of_path(&a), None);
    }
}
