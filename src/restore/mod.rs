//! Restore: rebuild a committed version from its chunks and write it
//! atomically.

pub mod cache;
pub mod error;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

pub use cache::ChunkCache;
pub use error::RestoreError;

use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};
use crate::state::{
    FileId, FileVersion, Fingerprint, MetadataStore, TrackedFile, VersionState,
};
use crate::transfer::{Backend, ChunkCipher, TransferError};
use crate::watcher::filter::PART_SUFFIX;

/// Chunks downloaded concurrently ahead of the write position.
const PREFETCH_CHUNKS: usize = 4;

/// How a restore request names its file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRef {
    Id(FileId),
    Path(PathBuf),
}

impl FileRef {
    /// Parse a CLI argument: a file id if it parses as one, else a path.
    pub fn parse(s: &str) -> Self {
        match FileId::parse(s) {
            Some(id) => Self::Id(id),
            None => Self::Path(PathBuf::from(s)),
        }
    }
}

impl std::fmt::Display for FileRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "{id}"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestoreOutcome {
    pub file_id: FileId,
    pub version: u64,
    pub path: PathBuf,
    pub bytes: u64,
    pub chunks_downloaded: usize,
}

pub struct RestoreCoordinator {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn Backend>,
    cipher: Arc<ChunkCipher>,
    cache: ChunkCache,
    retry: RetryConfig,
    cancel: CancellationToken,
}

impl RestoreCoordinator {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn Backend>,
        cipher: Arc<ChunkCipher>,
        cache_dir: PathBuf,
        retry: RetryConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            store,
            backend,
            cipher,
            cache: ChunkCache::new(cache_dir),
            retry,
            cancel,
        }
    }

    async fn resolve(&self, file: &FileRef) -> Result<TrackedFile, RestoreError> {
        let found = match file {
            FileRef::Id(id) => self.store.get_by_id(*id).await?,
            FileRef::Path(path) => self.store.get(path).await?,
        };
        found.ok_or_else(|| RestoreError::UnknownFile(file.to_string()))
    }

    /// The committed version, from the store or else the backend history.
    async fn find_version(
        &self,
        tracked: &TrackedFile,
        version: u64,
    ) -> Result<FileVersion, RestoreError> {
        let name = tracked.path.display().to_string();
        match self.store.get_version(tracked.id, version).await? {
            Some(v) if v.state == VersionState::Committed => return Ok(v),
            Some(_) => {
                return Err(RestoreError::NotCommitted {
                    file: name,
                    version,
                })
            }
            None => {}
        }
        // Pruned locally by retention; the backend may still hold it.
        let remote = self.backend.list_versions(tracked.id).await?;
        remote
            .into_iter()
            .find(|r| r.version == version)
            .map(|r| r.into_version(tracked.id, VersionState::Committed))
            .ok_or(RestoreError::VersionNotFound {
                file: name,
                version,
            })
    }

    /// Restore `version` of `file` to `destination` (the tracked path when
    /// `None`). The destination is replaced atomically.
    pub async fn restore(
        &self,
        file: &FileRef,
        version: u64,
        destination: Option<PathBuf>,
    ) -> Result<RestoreOutcome, RestoreError> {
        let tracked = self.resolve(file).await?;
        let found = self.find_version(&tracked, version).await?;
        if found.tombstone {
            return Err(RestoreError::Tombstone {
                file: tracked.path.display().to_string(),
                version,
            });
        }
        let destination = destination.unwrap_or_else(|| tracked.path.clone());
        tracing::info!(
            file_id = %tracked.id,
            version,
            destination = %destination.display(),
            "Restoring"
        );
        let downloaded = self.write_version(&found, &destination).await?;
        Ok(RestoreOutcome {
            file_id: tracked.id,
            version,
            path: destination,
            bytes: found.size_bytes,
            chunks_downloaded: downloaded,
        })
    }

    /// Drop cached copies of chunks the backend no longer stores.
    pub async fn evict_cached(&self, fingerprints: &[Fingerprint]) {
        for fingerprint in fingerprints {
            let _guard = self.cache.lock(fingerprint).await;
            if let Err(e) = self.cache.evict(fingerprint).await {
                tracing::debug!(
                    chunk = %fingerprint.short(),
                    error = %e,
                    "Failed to evict cached chunk"
                );
            }
        }
    }

    async fn write_version(
        &self,
        version: &FileVersion,
        destination: &Path,
    ) -> Result<usize, RestoreError> {
        let dir = destination.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir)
            .await
            .map_err(|e| RestoreError::io(dir, e))?;
        let name = destination
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "restore".to_string());
        let part = dir.join(format!(".{name}{PART_SUFFIX}"));

        let result = self.fill_part(version, &part).await;
        match result {
            Ok(downloaded) => {
                fs::rename(&part, destination)
                    .await
                    .map_err(|e| RestoreError::io(destination, e))?;
                Ok(downloaded)
            }
            Err(e) => {
                let _ = fs::remove_file(&part).await;
                Err(e)
            }
        }
    }

    async fn fill_part(&self, version: &FileVersion, part: &Path) -> Result<usize, RestoreError> {
        let mut out = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(part)
            .await
            .map_err(|e| RestoreError::io(part, e))?;
        let mut whole = Sha256::new();
        let mut downloaded = 0;
        // Chunks are fetched ahead but written strictly in manifest order.
        let fingerprints: Vec<Fingerprint> =
            version.manifest.iter().map(|c| c.fingerprint).collect();
        let mut chunks = stream::iter(fingerprints)
            .map(|fingerprint| async move { self.chunk(&fingerprint).await })
            .buffered(PREFETCH_CHUNKS);
        while let Some(fetched) = chunks.next().await {
            let (plain, fetched) = fetched?;
            downloaded += usize::from(fetched);
            whole.update(&plain);
            out.write_all(&plain)
                .await
                .map_err(|e| RestoreError::io(part, e))?;
        }
        out.flush().await.map_err(|e| RestoreError::io(part, e))?;
        out.sync_all().await.map_err(|e| RestoreError::io(part, e))?;

        let digest: [u8; 32] = whole.finalize().into();
        if Fingerprint(digest) != version.fingerprint {
            return Err(RestoreError::ContentMismatch(part.display().to_string()));
        }
        Ok(downloaded)
    }

    /// Plaintext of a chunk, from the cache or the backend. The flag is set
    /// when the chunk was downloaded.
    async fn chunk(&self, fingerprint: &Fingerprint) -> Result<(Vec<u8>, bool), RestoreError> {
        if let Some(plain) = self.cached(fingerprint).await {
            return Ok((plain, false));
        }
        let _guard = self.cache.lock(fingerprint).await;
        // Someone else may have fetched it while we waited.
        if let Some(plain) = self.cached(fingerprint).await {
            return Ok((plain, false));
        }
        for attempt in 0..2 {
            let sealed = retry_with_backoff(
                &self.retry,
                &self.cancel,
                |e: &TransferError| {
                    if e.is_retryable() {
                        RetryAction::Retry
                    } else {
                        RetryAction::Abort
                    }
                },
                || self.backend.get_chunk(fingerprint),
            )
            .await?;
            match self.cipher.open(&sealed) {
                Ok(plain) if Fingerprint::of(&plain) == *fingerprint => {
                    if let Err(e) = self.cache.write(fingerprint, &sealed).await {
                        tracing::warn!(chunk = %fingerprint.short(), error = %e, "Failed to cache chunk");
                    }
                    return Ok((plain, true));
                }
                _ => {
                    tracing::warn!(chunk = %fingerprint.short(), attempt, "Downloaded chunk failed verification");
                }
            }
        }
        Err(RestoreError::Corruption(fingerprint.to_hex()))
    }

    async fn cached(&self, fingerprint: &Fingerprint) -> Option<Vec<u8>> {
        let sealed = match self.cache.read(fingerprint).await {
            Ok(Some(sealed)) => sealed,
            Ok(None) => return None,
            Err(e) => {
                tracing::debug!(chunk = %fingerprint.short(), error = %e, "Chunk cache read failed");
                return None;
            }
        };
        match self.cipher.open(&sealed) {
            Ok(plain) if Fingerprint::of(&plain) == *fingerprint => Some(plain),
            _ => {
                tracing::warn!(chunk = %fingerprint.short(), "Evicting corrupt cache entry");
                let _ = self.cache.evict(fingerprint).await;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use chrono::Utc;

    use crate::classify::chunker::{scan_file, ChunkPolicy};
    use crate::state::{SqliteMetadataStore, TrackedFile};
    use crate::transfer::memory::MemoryBackend;
    use crate::transfer::{CommitRequest, UploadSession};

    struct Fixture {
        store: Arc<dyn MetadataStore>,
        backend: Arc<MemoryBackend>,
        cipher: Arc<ChunkCipher>,
        restore: RestoreCoordinator,
        dir: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store: Arc<dyn MetadataStore> =
            Arc::new(SqliteMetadataStore::open_in_memory().unwrap());
        let backend = Arc::new(MemoryBackend::new());
        let cipher = Arc::new(ChunkCipher::from_secret(b"restore test secret").unwrap());
        let restore = RestoreCoordinator::new(
            store.clone(),
            backend.clone(),
            cipher.clone(),
            dir.path().join("cache"),
            RetryConfig {
                max_retries: 1,
                base_delay: Duration::ZERO,
                max_delay: Duration::ZERO,
            },
            CancellationToken::new(),
        );
        Fixture {
            store,
            backend,
            cipher,
            restore,
            dir,
        }
    }

    impl Fixture {
        /// Back up `content` as the next committed version of `name`.
        async fn backup(&self, name: &str, content: &[u8]) -> (FileId, u64) {
            let path = self.dir.path().join(name);
            std::fs::write(&path, content).unwrap();
            let file = match self.store.get(&path).await.unwrap() {
                Some(f) => f,
                None => {
                    let f = TrackedFile::new(path.clone(), None);
                    self.store.upsert(&f).await.unwrap();
                    f
                }
            };
            let scan = scan_file(
                &path,
                ChunkPolicy {
                    threshold: 4,
                    chunk_size: 4,
                },
            )
            .unwrap();
            let next = self
                .store
                .latest_version(file.id)
                .await
                .unwrap()
                .map_or(1, |v| v.version + 1);
            let version = FileVersion {
                file_id: file.id,
                version: next,
                fingerprint: scan.fingerprint,
                size_bytes: scan.size,
                created_at: Utc::now(),
                manifest: scan.manifest,
                tombstone: false,
                state: VersionState::Pending,
            };
            let session = UploadSession { id: "s".into() };
            for chunk in &version.manifest {
                let start = chunk.offset as usize;
                let bytes = &content[start..start + chunk.length as usize];
                self.backend
                    .put_chunk(&session, &chunk.fingerprint, self.cipher.seal(bytes).unwrap())
                    .await
                    .unwrap();
            }
            self.backend
                .commit_version(&CommitRequest::for_version(&session, path, &version))
                .await
                .unwrap();
            self.store.record_version(&version).await.unwrap();
            self.store.commit_version(file.id, next).await.unwrap();
            (file.id, next)
        }
    }

    #[tokio::test]
    async fn test_restore_each_version() {
        let f = fixture();
        let (id, v1) = f.backup("report.doc", b"version A content").await;
        let (_, v2) = f.backup("report.doc", b"version B").await;
        f.backup("report.doc", b"version A content").await;

        let original = f.dir.path().join("report.doc");
        let out = f.dir.path().join("restored-1.doc");
        let outcome = f
            .restore
            .restore(&FileRef::Id(id), v1, Some(out.clone()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"version A content");
        assert_eq!(outcome.bytes, 17);

        f.restore
            .restore(&FileRef::Path(original.clone()), v2, None)
            .await
            .unwrap();
        assert_eq!(std::fs::read(&original).unwrap(), b"version B");
        // No part files left behind
        let leftovers = std::fs::read_dir(f.dir.path())
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .ends_with(PART_SUFFIX)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_cache_avoids_second_download() {
        let f = fixture();
        let (id, v1) = f.backup("cached.bin", b"abcdefgh").await;
        let out = f.dir.path().join("out.bin");
        let first = f
            .restore
            .restore(&FileRef::Id(id), v1, Some(out.clone()))
            .await
            .unwrap();
        assert_eq!(first.chunks_downloaded, 2);
        let second = f
            .restore
            .restore(&FileRef::Id(id), v1, Some(out.clone()))
            .await
            .unwrap();
        assert_eq!(second.chunks_downloaded, 0);
    }

    #[tokio::test]
    async fn test_corrupt_chunk_redownloaded_once() {
        let f = fixture();
        let (id, v1) = f.backup("flaky.bin", b"abcd").await;
        let out = f.dir.path().join("out.bin");

        f.backend.corrupt_next_gets(1);
        f.restore
            .restore(&FileRef::Id(id), v1, Some(out.clone()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"abcd");
    }

    #[tokio::test]
    async fn test_persistent_corruption_fails() {
        let f = fixture();
        let (id, v1) = f.backup("bad.bin", b"abcd").await;
        let out = f.dir.path().join("out.bin");
        std::fs::write(&out, b"keep me").unwrap();

        f.backend.corrupt_next_gets(2);
        let err = f
            .restore
            .restore(&FileRef::Id(id), v1, Some(out.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Corruption(_)));
        assert_eq!(err.class(), crate::error::ErrorClass::Corruption);
        // Destination untouched
        assert_eq!(std::fs::read(&out).unwrap(), b"keep me");
    }

    #[tokio::test]
    async fn test_tombstone_and_unknown_rejected() {
        let f = fixture();
        let (id, _) = f.backup("deleted.txt", b"data").await;
        let tomb = FileVersion {
            file_id: id,
            version: 2,
            fingerprint: Fingerprint::of(&[]),
            size_bytes: 0,
            created_at: Utc::now(),
            manifest: Vec::new(),
            tombstone: true,
            state: VersionState::Pending,
        };
        f.store.record_version(&tomb).await.unwrap();
        f.store.commit_version(id, 2).await.unwrap();

        let err = f.restore.restore(&FileRef::Id(id), 2, None).await.unwrap_err();
        assert!(matches!(err, RestoreError::Tombstone { .. }));
        let err = f
            .restore
            .restore(&FileRef::Id(FileId::new()), 1, None)
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::UnknownFile(_)));
        let err = f.restore.restore(&FileRef::Id(id), 9, None).await.unwrap_err();
        assert!(matches!(err, RestoreError::VersionNotFound { .. }));
    }

    #[tokio::test]
    async fn test_pruned_version_restored_from_backend_history() {
        let f = fixture();
        let (id, v1) = f.backup("pruned.txt", b"old bytes").await;
        f.backup("pruned.txt", b"new bytes").await;
        f.store.remove_versions(id, &[v1]).await.unwrap();

        let out = f.dir.path().join("old.txt");
        f.restore
            .restore(&FileRef::Id(id), v1, Some(out.clone()))
            .await
            .unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"old bytes");
    }

    #[test]
    fn test_file_ref_parse() {
        let id = FileId::new();
        assert_eq!(FileRef::parse(&id.to_string()), FileRef::Id(id));
        assert_eq!(
            FileRef::parse("/home/me/doc.txt"),
            FileRef::Path("/home/me/doc.txt".into())
        );
    }
}
