//! Remote storage backend seam.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::TransferError;
use crate::state::{ChunkRef, FileId, FileVersion, Fingerprint, VersionState};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadRequest {
    pub file_id: FileId,
    pub path: PathBuf,
    pub version: u64,
    pub size: u64,
    pub chunk_count: usize,
}

/// Handle for an in-progress version upload on the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadSession {
    pub id: String,
}

/// Makes a version durable on the backend. `parent_version` is the version
/// the client believes is the current head; the backend rejects the commit
/// with a conflict when its head differs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommitRequest {
    pub upload_id: String,
    pub file_id: FileId,
    pub path: PathBuf,
    pub version: u64,
    pub parent_version: Option<u64>,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    pub manifest: Vec<ChunkRef>,
    pub tombstone: bool,
}

impl CommitRequest {
    pub fn for_version(session: &UploadSession, path: PathBuf, version: &FileVersion) -> Self {
        Self {
            upload_id: session.id.clone(),
            file_id: version.file_id,
            path,
            version: version.version,
            parent_version: version.version.checked_sub(1).filter(|v| *v > 0),
            fingerprint: version.fingerprint,
            size: version.size_bytes,
            created_at: version.created_at,
            manifest: version.manifest.clone(),
            tombstone: version.tombstone,
        }
    }
}

/// A committed version as the backend reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteVersion {
    pub version: u64,
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub manifest: Vec<ChunkRef>,
    #[serde(default)]
    pub tombstone: bool,
}

impl RemoteVersion {
    pub fn into_version(self, file_id: FileId, state: VersionState) -> FileVersion {
        FileVersion {
            file_id,
            version: self.version,
            fingerprint: self.fingerprint,
            size_bytes: self.size,
            created_at: self.created_at,
            manifest: self.manifest,
            tombstone: self.tombstone,
            state,
        }
    }
}

/// Remote chunk and version storage.
///
/// Chunks are addressed by the fingerprint of their plaintext and stored
/// sealed, so a chunk uploaded once is shared by every version that
/// references it.
#[async_trait::async_trait]
pub trait Backend: Send + Sync {
    async fn initiate_upload(&self, request: &UploadRequest)
        -> Result<UploadSession, TransferError>;

    /// Store one sealed chunk. Idempotent per fingerprint.
    async fn put_chunk(
        &self,
        session: &UploadSession,
        fingerprint: &Fingerprint,
        sealed: Vec<u8>,
    ) -> Result<(), TransferError>;

    /// Subset of `fingerprints` the backend does not hold.
    async fn missing_chunks(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<Fingerprint>, TransferError>;

    async fn commit_version(&self, request: &CommitRequest) -> Result<(), TransferError>;

    /// Committed versions of a file, oldest first.
    async fn list_versions(&self, file_id: FileId) -> Result<Vec<RemoteVersion>, TransferError>;

    async fn get_chunk(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>, TransferError>;

    async fn delete_chunks(&self, fingerprints: &[Fingerprint]) -> Result<(), TransferError>;

    /// Liveness heartbeat. Fails with `Auth` when credentials are revoked.
    async fn keepalive(&self) -> Result<(), TransferError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(n: u64) -> FileVersion {
        FileVersion {
            file_id: FileId::new(),
            version: n,
            fingerprint: Fingerprint::of(b"abc"),
            size_bytes: 3,
            created_at: Utc::now(),
            manifest: vec![ChunkRef {
                fingerprint: Fingerprint::of(b"abc"),
                offset: 0,
                length: 3,
            }],
            tombstone: false,
            state: VersionState::Pending,
        }
    }

    #[test]
    fn test_commit_request_parent() {
        let session = UploadSession { id: "u1".into() };
        let first = CommitRequest::for_version(&session, "a".into(), &version(1));
        assert_eq!(first.parent_version, None);
        let third = CommitRequest::for_version(&session, "a".into(), &version(3));
        assert_eq!(third.parent_version, Some(2));
        assert_eq!(third.upload_id, "u1");
    }

    #[test]
    fn test_remote_version_json() {
        let fp = Fingerprint::of(b"x");
        let json = format!(
            r#"{{"version":2,"fingerprint":"{}","size":1,"created_at":"2024-05-01T10:00:00Z"}}"#,
            fp.to_hex()
        );
        let remote: RemoteVersion = serde_json::from_str(&json).unwrap();
        assert_eq!(remote.version, 2);
        assert!(remote.manifest.is_empty());
        assert!(!remote.tombstone);
        let id = FileId::new();
        let v = remote.into_version(id, VersionState::Committed);
        assert_eq!(v.file_id, id);
        assert_eq!(v.fingerprint, fp);
    }
}
