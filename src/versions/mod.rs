//! Version allocation, retention and abandonment.
//!
//! All mutations of a file's version chain go through [`VersionManager`],
//! which serializes them per file so numbering stays gap-free and ordered.

use std::sync::Arc;

use chrono::Utc;

use crate::classify::chunker::ContentScan;
use crate::locks::KeyedLocks;
use crate::state::{
    ChunkRef, FileId, FileVersion, Fingerprint, MetadataStore, StateError, VersionState,
};

/// Content a classifier observed for a file.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub fingerprint: Fingerprint,
    pub size: u64,
    pub manifest: Vec<ChunkRef>,
    pub tombstone: bool,
}

impl Candidate {
    pub fn tombstone() -> Self {
        Self {
            fingerprint: Fingerprint::of(&[]),
            size: 0,
            manifest: Vec::new(),
            tombstone: true,
        }
    }
}

impl From<ContentScan> for Candidate {
    fn from(scan: ContentScan) -> Self {
        Self {
            fingerprint: scan.fingerprint,
            size: scan.size,
            manifest: scan.manifest,
            tombstone: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Allocation {
    /// Same content as the latest version (or a tombstone for a file that
    /// never had one). Nothing was recorded.
    Unchanged(Option<FileVersion>),
    Allocated(FileVersion),
}

pub struct VersionManager {
    store: Arc<dyn MetadataStore>,
    retention: u32,
    file_locks: KeyedLocks<FileId>,
}

impl VersionManager {
    pub fn new(store: Arc<dyn MetadataStore>, retention: u32) -> Self {
        Self {
            store,
            retention: retention.max(1),
            file_locks: KeyedLocks::new(),
        }
    }

    pub fn retention(&self) -> u32 {
        self.retention
    }

    /// Record a pending version for `candidate` unless it matches the
    /// latest version, pending or committed.
    pub async fn allocate(
        &self,
        file_id: FileId,
        candidate: Candidate,
    ) -> Result<Allocation, StateError> {
        let _guard = self.file_locks.lock(&file_id).await;
        let latest = self.store.latest_version(file_id).await?;
        match &latest {
            Some(l) if l.same_content(&candidate.fingerprint, candidate.tombstone) => {
                return Ok(Allocation::Unchanged(latest));
            }
            None if candidate.tombstone => return Ok(Allocation::Unchanged(None)),
            _ => {}
        }
        let version = FileVersion {
            file_id,
            version: latest.map_or(1, |l| l.version + 1),
            fingerprint: candidate.fingerprint,
            size_bytes: candidate.size,
            created_at: Utc::now(),
            manifest: candidate.manifest,
            tombstone: candidate.tombstone,
            state: VersionState::Pending,
        };
        self.store.record_version(&version).await?;
        tracing::debug!(
            file_id = %file_id,
            version = version.version,
            tombstone = version.tombstone,
            chunks = version.manifest.len(),
            "Allocated version"
        );
        Ok(Allocation::Allocated(version))
    }

    /// Drop committed versions beyond the retention count, oldest first, and
    /// queue their unreferenced chunks for garbage collection. Returns the
    /// removed version numbers.
    pub async fn enforce_retention(&self, file_id: FileId) -> Result<Vec<u64>, StateError> {
        let _guard = self.file_locks.lock(&file_id).await;
        let committed: Vec<u64> = self
            .store
            .list_versions(file_id)
            .await?
            .into_iter()
            .filter(|v| v.state == VersionState::Committed)
            .map(|v| v.version)
            .collect();
        let keep = self.retention as usize;
        if committed.len() <= keep {
            return Ok(Vec::new());
        }
        let expired = committed[..committed.len() - keep].to_vec();
        let orphans = self.store.remove_versions(file_id, &expired).await?;
        self.store.schedule_gc(&orphans).await?;
        tracing::debug!(
            file_id = %file_id,
            removed = ?expired,
            gc = orphans.len(),
            "Retention pruned versions"
        );
        Ok(expired)
    }

    /// Abandon pending version `from` and every later pending version of
    /// the file. Returns the abandoned numbers, newest first.
    pub async fn abandon_from(&self, file_id: FileId, from: u64) -> Result<Vec<u64>, StateError> {
        let _guard = self.file_locks.lock(&file_id).await;
        self.abandon_pending(file_id, from).await
    }

    async fn abandon_pending(&self, file_id: FileId, from: u64) -> Result<Vec<u64>, StateError> {
        let mut doomed: Vec<u64> = self
            .store
            .list_versions(file_id)
            .await?
            .into_iter()
            .filter(|v| v.state == VersionState::Pending && v.version >= from)
            .map(|v| v.version)
            .collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        let mut orphans = Vec::new();
        for &version in &doomed {
            orphans.extend(self.store.abandon_version(file_id, version).await?);
        }
        orphans.sort();
        orphans.dedup();
        self.store.schedule_gc(&orphans).await?;
        if !doomed.is_empty() {
            tracing::info!(file_id = %file_id, abandoned = ?doomed, "Abandoned pending versions");
        }
        Ok(doomed)
    }

    /// Replace the local chain above the last committed version with the
    /// backend's history: local pending versions are abandoned and remote
    /// versions newer than the local head are recorded as committed.
    /// Returns the adopted head, if any.
    pub async fn adopt_remote(
        &self,
        file_id: FileId,
        mut remote: Vec<FileVersion>,
    ) -> Result<Option<FileVersion>, StateError> {
        {
            let _guard = self.file_locks.lock(&file_id).await;
            self.abandon_pending(file_id, 0).await?;
            let local_head = self
                .store
                .latest_version(file_id)
                .await?
                .map_or(0, |v| v.version);
            remote.sort_by_key(|v| v.version);
            for version in remote.iter().filter(|v| v.version > local_head) {
                let mut pending = version.clone();
                pending.file_id = file_id;
                pending.state = VersionState::Pending;
                self.store.record_version(&pending).await?;
                self.store.commit_version(file_id, pending.version).await?;
            }
        }
        self.enforce_retention(file_id).await?;
        Ok(remote.into_iter().last())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{SqliteMetadataStore, SyncStatus, TrackedFile};

    async fn setup(retention: u32) -> (Arc<dyn MetadataStore>, VersionManager, FileId) {
        let store: Arc<dyn MetadataStore> = Arc::new(SqliteMetadataStore::open_in_memory().unwrap());
        let file = TrackedFile::new("/data/report.doc".into(), None);
        store.upsert(&file).await.unwrap();
        let manager = VersionManager::new(store.clone(), retention);
        (store, manager, file.id)
    }

    fn content(bytes: &[u8]) -> Candidate {
        let fp = Fingerprint::of(bytes);
        Candidate {
            fingerprint: fp,
            size: bytes.len() as u64,
            manifest: vec![ChunkRef {
                fingerprint: fp,
                offset: 0,
                length: bytes.len() as u32,
            }],
            tombstone: false,
        }
    }

    async fn allocated(manager: &VersionManager, id: FileId, c: Candidate) -> FileVersion {
        match manager.allocate(id, c).await.unwrap() {
            Allocation::Allocated(v) => v,
            other => panic!("expected allocation, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_numbers_start_at_one_and_increase() {
        let (_, manager, id) = setup(10).await;
        assert_eq!(allocated(&manager, id, content(b"a")).await.version, 1);
        assert_eq!(allocated(&manager, id, content(b"b")).await.version, 2);
        assert_eq!(allocated(&manager, id, content(b"a")).await.version, 3);
    }

    #[tokio::test]
    async fn test_identical_content_is_unchanged() {
        let (store, manager, id) = setup(10).await;
        allocated(&manager, id, content(b"a")).await;
        let again = manager.allocate(id, content(b"a")).await.unwrap();
        assert!(matches!(again, Allocation::Unchanged(Some(ref v)) if v.version == 1));
        assert_eq!(store.list_versions(id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_rules() {
        let (_, manager, id) = setup(10).await;
        // Never versioned: nothing to delete
        assert_eq!(
            manager.allocate(id, Candidate::tombstone()).await.unwrap(),
            Allocation::Unchanged(None)
        );
        allocated(&manager, id, content(b"a")).await;
        let tomb = allocated(&manager, id, Candidate::tombstone()).await;
        assert!(tomb.tombstone);
        assert!(tomb.manifest.is_empty());
        assert!(matches!(
            manager.allocate(id, Candidate::tombstone()).await.unwrap(),
            Allocation::Unchanged(Some(_))
        ));
    }

    #[tokio::test]
    async fn test_concurrent_allocation_is_gap_free() {
        let (store, manager, id) = setup(100).await;
        let manager = Arc::new(manager);
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.allocate(id, content(&[i; 8])).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let numbers: Vec<u64> = store
            .list_versions(id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(numbers, (1..=16).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_retention_keeps_newest_and_schedules_gc() {
        let (store, manager, id) = setup(2).await;
        for bytes in [b"v1", b"v2", b"v3"] {
            let v = allocated(&manager, id, content(bytes)).await;
            store.commit_version(id, v.version).await.unwrap();
            manager.enforce_retention(id).await.unwrap();
        }
        let remaining: Vec<u64> = store
            .list_versions(id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(remaining, vec![2, 3]);
        let gc = store.take_gc_batch(10).await.unwrap();
        assert_eq!(gc, vec![Fingerprint::of(b"v1")]);
    }

    #[tokio::test]
    async fn test_retention_ignores_pending() {
        let (store, manager, id) = setup(1).await;
        let v1 = allocated(&manager, id, content(b"v1")).await;
        store.commit_version(id, v1.version).await.unwrap();
        allocated(&manager, id, content(b"v2")).await;
        assert!(manager.enforce_retention(id).await.unwrap().is_empty());
        assert_eq!(store.list_versions(id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_abandon_from_drops_later_pending() {
        let (store, manager, id) = setup(10).await;
        let v1 = allocated(&manager, id, content(b"v1")).await;
        store.commit_version(id, v1.version).await.unwrap();
        allocated(&manager, id, content(b"v2")).await;
        allocated(&manager, id, content(b"v3")).await;

        let abandoned = manager.abandon_from(id, 2).await.unwrap();
        assert_eq!(abandoned, vec![3, 2]);
        let latest = store.latest_version(id).await.unwrap().unwrap();
        assert_eq!(latest.version, 1);
        // Next allocation continues the committed chain
        assert_eq!(allocated(&manager, id, content(b"v4")).await.version, 2);
    }

    #[tokio::test]
    async fn test_adopt_remote_replaces_pending_chain() {
        let (store, manager, id) = setup(10).await;
        let v1 = allocated(&manager, id, content(b"v1")).await;
        store.commit_version(id, v1.version).await.unwrap();
        allocated(&manager, id, content(b"local")).await;

        let remote2 = FileVersion {
            version: 2,
            state: VersionState::Committed,
            ..allocated_like(id, b"remote")
        };
        let head = manager
            .adopt_remote(id, vec![v1.clone(), remote2.clone()])
            .await
            .unwrap()
            .unwrap();
        assert_eq!(head.version, 2);

        let stored = store.get_version(id, 2).await.unwrap().unwrap();
        assert_eq!(stored.fingerprint, Fingerprint::of(b"remote"));
        assert_eq!(stored.state, VersionState::Committed);
        let file = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(file.current_version, Some(2));
        assert_eq!(file.status, SyncStatus::Clean);
    }

    fn allocated_like(id: FileId, bytes: &[u8]) -> FileVersion {
        let c = content(bytes);
        FileVersion {
            file_id: id,
            version: 0,
            fingerprint: c.fingerprint,
            size_bytes: c.size,
            created_at: Utc::now(),
            manifest: c.manifest,
            tombstone: false,
            state: VersionState::Pending,
        }
    }
}
