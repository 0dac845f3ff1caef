//! Change classification.
//!
//! Turns a normalized [`ChangeEvent`] into a decision: nothing changed, a
//! new version (or tombstone) to upload, a rename, or a directory whose
//! entries must be classified individually. Content is fingerprinted on the
//! blocking pool; version numbers come from the [`VersionManager`].

pub mod chunker;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

pub use chunker::{ChunkPolicy, ContentScan};

use crate::error::ErrorClass;
use crate::locks::{KeyGuard, KeyedLocks};
use crate::state::{
    FileId, FileIdentity, MetadataStore, StateError, SyncStatus, TrackedFile, VersionState,
};
use crate::transfer::UploadJob;
use crate::versions::{Allocation, Candidate, VersionManager};
use crate::watcher::event::{ChangeEvent, ChangeKind};

#[derive(Debug, Error)]
pub enum ClassifyError {
    #[error("Failed to read {path}: {source}")]
    Io { path: PathBuf, source: io::Error },

    #[error(transparent)]
    State(#[from] StateError),

    #[error("Hashing task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ClassifyError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Io
    }

    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Classification {
    /// Content matches the latest version.
    NoOp { file_id: FileId },
    /// Stale event, untracked delete, or not a regular file.
    Ignored,
    /// A tracked file moved without changing content.
    Renamed {
        file_id: FileId,
        from: PathBuf,
        to: PathBuf,
    },
    NewVersion(UploadJob),
    Tombstone(UploadJob),
    /// Forced re-verification of an unchanged, committed file.
    Verify(UploadJob),
    /// Paths to classify individually (directory contents, or both sides
    /// of a rename onto another tracked file).
    Expand(Vec<PathBuf>),
}

pub struct Classifier {
    store: Arc<dyn MetadataStore>,
    versions: Arc<VersionManager>,
    policy: ChunkPolicy,
    path_locks: KeyedLocks<PathBuf>,
}

impl Classifier {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        versions: Arc<VersionManager>,
        policy: ChunkPolicy,
    ) -> Self {
        Self {
            store,
            versions,
            policy,
            path_locks: KeyedLocks::new(),
        }
    }

    /// Classify one event. With `force`, unchanged committed files are
    /// returned as [`Classification::Verify`] so their chunks get checked
    /// against the backend.
    pub async fn classify(
        &self,
        event: &ChangeEvent,
        force: bool,
    ) -> Result<Classification, ClassifyError> {
        match &event.kind {
            ChangeKind::Create | ChangeKind::Modify => {
                let _guard = self.path_locks.lock(&event.path).await;
                self.write(&event.path, event.timestamp, force, None).await
            }
            ChangeKind::Delete => {
                let _guard = self.path_locks.lock(&event.path).await;
                match tokio::fs::symlink_metadata(&event.path).await {
                    // Recreated since the delete: classify what is there now.
                    Ok(_) => self.write(&event.path, event.timestamp, force, None).await,
                    Err(_) => self.delete(&event.path, event.timestamp).await,
                }
            }
            ChangeKind::Rename { from } => {
                let _guards = self.lock_pair(from, &event.path).await;
                self.rename(from, &event.path, event.timestamp, force).await
            }
        }
    }

    async fn lock_pair(&self, a: &Path, b: &Path) -> Vec<KeyGuard> {
        let mut keys = vec![a.to_path_buf(), b.to_path_buf()];
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.path_locks.lock(key).await);
        }
        guards
    }

    async fn write(
        &self,
        path: &Path,
        at: DateTime<Utc>,
        force: bool,
        renamed_from: Option<PathBuf>,
    ) -> Result<Classification, ClassifyError> {
        let meta = match tokio::fs::symlink_metadata(path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.delete(path, at).await,
            Err(e) => return Err(ClassifyError::io(path, e)),
        };
        if meta.is_dir() {
            return Ok(Classification::Expand(list_dir(path).await?));
        }
        if !meta.is_file() {
            return Ok(Classification::Ignored);
        }
        let identity = FileIdentity::from_metadata(&meta);

        let mut renamed_from = renamed_from;
        let mut file = match self.store.get(path).await? {
            Some(file) => file,
            None => match self.find_moved(path, identity).await? {
                Some(moved) => {
                    tracing::info!(
                        file_id = %moved.id,
                        from = %moved.path.display(),
                        to = %path.display(),
                        "Detected rename by file identity"
                    );
                    self.store.rename(moved.id, path, identity).await?;
                    renamed_from = Some(moved.path.clone());
                    TrackedFile {
                        path: path.to_path_buf(),
                        identity,
                        ..moved
                    }
                }
                None => {
                    let file = TrackedFile::new(path.to_path_buf(), identity);
                    self.store.upsert(&file).await?;
                    tracing::debug!(file_id = %file.id, path = %path.display(), "Tracking new file");
                    file
                }
            },
        };

        if !force && file.last_event_at.is_some_and(|last| at < last) {
            tracing::debug!(path = %path.display(), "Ignoring stale event");
            return Ok(Classification::Ignored);
        }
        if file.identity != identity {
            file.identity = identity;
            self.store.upsert(&file).await?;
        }

        let policy = self.policy;
        let owned = path.to_path_buf();
        let scan = match tokio::task::spawn_blocking(move || chunker::scan_file(&owned, policy))
            .await?
        {
            Ok(scan) => scan,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return self.delete(path, at).await,
            Err(e) => return Err(ClassifyError::io(path, e)),
        };

        match self.versions.allocate(file.id, Candidate::from(scan)).await? {
            Allocation::Allocated(version) => {
                self.store.touch_checked(file.id, Some(at)).await?;
                tracing::debug!(
                    file_id = %file.id,
                    path = %path.display(),
                    version = version.version,
                    "Content changed"
                );
                Ok(Classification::NewVersion(UploadJob::commit(
                    path.to_path_buf(),
                    version,
                )))
            }
            Allocation::Unchanged(latest) => {
                self.store.touch_checked(file.id, Some(at)).await?;
                let committed = latest.filter(|v| v.state == VersionState::Committed);
                if committed.is_some()
                    && matches!(file.status, SyncStatus::Pending | SyncStatus::Failed)
                {
                    self.store.set_status(file.id, SyncStatus::Clean, None).await?;
                }
                match (committed, renamed_from) {
                    (Some(version), _) if force && !version.tombstone => Ok(
                        Classification::Verify(UploadJob::repair(path.to_path_buf(), version)),
                    ),
                    (_, Some(from)) => Ok(Classification::Renamed {
                        file_id: file.id,
                        from,
                        to: path.to_path_buf(),
                    }),
                    _ => Ok(Classification::NoOp { file_id: file.id }),
                }
            }
        }
    }

    /// A tracked file with the same identity whose recorded path is gone.
    async fn find_moved(
        &self,
        path: &Path,
        identity: Option<FileIdentity>,
    ) -> Result<Option<TrackedFile>, ClassifyError> {
        let Some(identity) = identity else {
            return Ok(None);
        };
        let mut candidates = self.store.get_by_identity(identity).await?;
        candidates.retain(|f| f.path != path && !f.deleted);
        for candidate in candidates {
            if tokio::fs::symlink_metadata(&candidate.path).await.is_err() {
                return Ok(Some(candidate));
            }
        }
        Ok(None)
    }

    async fn delete(&self, path: &Path, at: DateTime<Utc>) -> Result<Classification, ClassifyError> {
        let Some(file) = self.store.get(path).await? else {
            // Possibly a removed directory: its tracked descendants are gone too.
            let descendants: Vec<PathBuf> = self
                .store
                .all_files()
                .await?
                .into_iter()
                .filter(|f| f.path.starts_with(path) && f.path != path && !f.deleted)
                .map(|f| f.path)
                .collect();
            return Ok(if descendants.is_empty() {
                Classification::Ignored
            } else {
                Classification::Expand(descendants)
            });
        };
        if file.last_event_at.is_some_and(|last| at < last) {
            tracing::debug!(path = %path.display(), "Ignoring stale delete");
            return Ok(Classification::Ignored);
        }
        if self.store.latest_version(file.id).await?.is_none() {
            let orphans = self.store.forget(file.id).await?;
            self.store.schedule_gc(&orphans).await?;
            tracing::debug!(file_id = %file.id, path = %path.display(), "Forgot unversioned file");
            return Ok(Classification::Ignored);
        }
        match self.versions.allocate(file.id, Candidate::tombstone()).await? {
            Allocation::Allocated(version) => {
                self.store.touch_checked(file.id, Some(at)).await?;
                tracing::debug!(
                    file_id = %file.id,
                    path = %path.display(),
                    version = version.version,
                    "File deleted"
                );
                Ok(Classification::Tombstone(UploadJob::commit(
                    path.to_path_buf(),
                    version,
                )))
            }
            Allocation::Unchanged(_) => Ok(Classification::NoOp { file_id: file.id }),
        }
    }

    async fn rename(
        &self,
        from: &Path,
        to: &Path,
        at: DateTime<Utc>,
        force: bool,
    ) -> Result<Classification, ClassifyError> {
        let meta = match tokio::fs::symlink_metadata(to).await {
            Ok(meta) => meta,
            // Moved again or removed before we looked.
            Err(_) => return self.delete(from, at).await,
        };
        if meta.is_dir() {
            return self.rename_dir(from, to).await;
        }
        let Some(source) = self.store.get(from).await? else {
            return self.write(to, at, force, None).await;
        };
        if let Some(target) = self.store.get(to).await? {
            if target.id != source.id {
                // Renamed over another tracked file: the target's history
                // continues with the new content and the source is deleted.
                return Ok(Classification::Expand(vec![to.to_path_buf(), from.to_path_buf()]));
            }
        }
        self.store
            .rename(source.id, to, FileIdentity::from_metadata(&meta))
            .await?;
        tracing::debug!(
            file_id = %source.id,
            from = %from.display(),
            to = %to.display(),
            "File renamed"
        );
        self.write(to, at, force, Some(from.to_path_buf())).await
    }

    /// Move tracked descendants of `from` under `to`, then classify the
    /// directory's entries.
    async fn rename_dir(&self, from: &Path, to: &Path) -> Result<Classification, ClassifyError> {
        for file in self.store.all_files().await? {
            let Ok(rel) = file.path.strip_prefix(from) else {
                continue;
            };
            let moved = to.join(rel);
            if self.store.get(&moved).await?.is_some() {
                continue;
            }
            let identity = FileIdentity::of_path(&moved);
            self.store.rename(file.id, &moved, identity).await?;
        }
        Ok(Classification::Expand(list_dir(to).await?))
    }
}

async fn list_dir(path: &Path) -> Result<Vec<PathBuf>, ClassifyError> {
    let owned = path.to_path_buf();
    let entries = tokio::task::spawn_blocking(move || -> io::Result<Vec<PathBuf>> {
        let mut entries = std::fs::read_dir(&owned)?
            .map(|entry| entry.map(|e| e.path()))
            .collect::<io::Result<Vec<_>>>()?;
        entries.sort();
        Ok(entries)
    })
    .await?;
    entries.map_err(|e| ClassifyError::io(path, e))
}
