//! Metadata store trait and SQLite implementation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fs4::fs_std::FileExt;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use super::error::StateError;
use super::schema;
use super::types::{
    ChunkRef, FileId, FileIdentity, FileVersion, Fingerprint, RunSource, SyncRunRecord,
    SyncRunStats, SyncStatus, SyncSummary, TrackedFile, VersionState,
};

/// Trait for metadata store operations.
///
/// This trait is object-safe and can be used with `Arc<dyn MetadataStore>`
/// for shared access across async tasks.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Look up a tracked file by its current path.
    async fn get(&self, path: &Path) -> Result<Option<TrackedFile>, StateError>;

    async fn get_by_id(&self, id: FileId) -> Result<Option<TrackedFile>, StateError>;

    /// Tracked files whose recorded device/inode matches. Used for rename
    /// detection; inode reuse means more than one record can match.
    async fn get_by_identity(
        &self,
        identity: FileIdentity,
    ) -> Result<Vec<TrackedFile>, StateError>;

    /// Insert or update a tracked file.
    ///
    /// The version pointer (`current_version`, `current_fingerprint`,
    /// `deleted`) is owned by [`commit_version`](Self::commit_version) and is
    /// only written here when the record is first inserted.
    async fn upsert(&self, file: &TrackedFile) -> Result<(), StateError>;

    /// Move a tracked file to a new path. A stale record already at
    /// `new_path` with no versions is dropped.
    async fn rename(
        &self,
        id: FileId,
        new_path: &Path,
        identity: Option<FileIdentity>,
    ) -> Result<(), StateError>;

    /// Drop a tracked file and all its versions. Returns chunks that no
    /// remaining version references.
    async fn forget(&self, id: FileId) -> Result<Vec<Fingerprint>, StateError>;

    /// Insert a pending version together with its manifest.
    async fn record_version(&self, version: &FileVersion) -> Result<(), StateError>;

    /// Mark a pending version committed and move the file's current-version
    /// pointer to it, in one transaction.
    async fn commit_version(&self, id: FileId, version: u64) -> Result<(), StateError>;

    /// Remove a pending version. Returns chunks that no remaining version
    /// references.
    async fn abandon_version(
        &self,
        id: FileId,
        version: u64,
    ) -> Result<Vec<Fingerprint>, StateError>;

    async fn get_version(
        &self,
        id: FileId,
        version: u64,
    ) -> Result<Option<FileVersion>, StateError>;

    /// Highest-numbered version, pending or committed.
    async fn latest_version(&self, id: FileId) -> Result<Option<FileVersion>, StateError>;

    /// All versions of a file in ascending order.
    async fn list_versions(&self, id: FileId) -> Result<Vec<FileVersion>, StateError>;

    /// Every uncommitted version, ordered by file then version number.
    async fn pending_versions(&self) -> Result<Vec<FileVersion>, StateError>;

    /// Files with uncommitted versions or a non-clean status.
    async fn list_pending(&self) -> Result<Vec<TrackedFile>, StateError>;

    async fn all_files(&self) -> Result<Vec<TrackedFile>, StateError>;

    /// Remove versions of a file. Returns the chunks of the removed versions
    /// that no remaining version of any file references.
    async fn remove_versions(
        &self,
        id: FileId,
        versions: &[u64],
    ) -> Result<Vec<Fingerprint>, StateError>;

    async fn set_status(
        &self,
        id: FileId,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<(), StateError>;

    /// Record a check that found no change.
    async fn touch_checked(
        &self,
        id: FileId,
        event_at: Option<DateTime<Utc>>,
    ) -> Result<(), StateError>;

    // ── Chunk acknowledgement and garbage collection ──

    /// Record chunks the backend has acknowledged.
    async fn mark_chunks_present(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError>;

    /// The subset of `fingerprints` already acknowledged by the backend.
    async fn known_chunks(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, StateError>;

    /// Stop treating chunks as present on the backend.
    async fn forget_chunks(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError>;

    async fn schedule_gc(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError>;

    /// Peek at up to `limit` queued garbage candidates.
    async fn take_gc_batch(&self, limit: usize) -> Result<Vec<Fingerprint>, StateError>;

    /// Claim queued candidates for deletion.
    ///
    /// Candidates that became referenced again are dropped from the queue;
    /// the rest are forgotten as acknowledged chunks and returned. Callers
    /// keep uploads out while claiming and deleting.
    async fn claim_gc(&self, fingerprints: &[Fingerprint]) -> Result<Vec<Fingerprint>, StateError>;

    /// Remove chunks from the GC queue after the backend deleted them.
    async fn complete_gc(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError>;

    // ── Maintenance and reporting ──

    /// Reset all failed files to pending. Returns their paths.
    async fn reset_failed(&self) -> Result<Vec<PathBuf>, StateError>;

    async fn summary(&self) -> Result<SyncSummary, StateError>;

    /// Start a new sync run and return its ID.
    async fn start_sync_run(&self, source: RunSource) -> Result<i64, StateError>;

    /// Complete a sync run with statistics.
    async fn complete_sync_run(&self, run_id: i64, stats: &SyncRunStats)
        -> Result<(), StateError>;

    /// Most recent sync runs, newest first.
    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StateError>;
}

/// SQLite implementation of the metadata store.
pub struct SqliteMetadataStore {
    /// Wrapped in Mutex because rusqlite::Connection is not Sync.
    conn: Mutex<Connection>,
    /// Path to the database file (for error messages).
    path: PathBuf,
    /// Exclusive advisory lock held for the lifetime of the store.
    _lock: Option<std::fs::File>,
}

impl std::fmt::Debug for SqliteMetadataStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteMetadataStore")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

const FILE_COLUMNS: &str = "id, path, device, inode, current_version, current_fingerprint, size_bytes, status, last_error, last_checked_at, last_event_at, deleted";

const VERSION_COLUMNS: &str =
    "file_id, version, fingerprint, size_bytes, created_at, tombstone, state";

impl SqliteMetadataStore {
    /// Open or create the store at `path`, taking an exclusive lock on
    /// `<path>.lock` so two engines never share one store.
    pub async fn open(path: &Path) -> Result<Self, StateError> {
        Self::open_inner(path, true).await
    }

    /// Open without taking the instance lock, for read-mostly inspection
    /// (status, version listings) while an engine may be running.
    pub async fn open_unlocked(path: &Path) -> Result<Self, StateError> {
        Self::open_inner(path, false).await
    }

    async fn open_inner(path: &Path, lock: bool) -> Result<Self, StateError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let (conn, lock_file) = tokio::task::spawn_blocking(move || {
            let lock_file = if lock {
                let lock_path = path_clone.with_extension("lock");
                let file = std::fs::File::create(&lock_path)
                    .map_err(|_| StateError::Locked(lock_path.clone()))?;
                file.try_lock_exclusive()
                    .map_err(|_| StateError::Locked(lock_path.clone()))?;
                Some(file)
            } else {
                None
            };

            let conn = Connection::open(&path_clone).map_err(|e| StateError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            // WAL gives readers a consistent snapshot while the engine writes
            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(StateError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(StateError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, StateError>((conn, lock_file))
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
            _lock: lock_file,
        })
    }

    /// Open an in-memory database (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory().map_err(|e| StateError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
            _lock: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StateError> {
        self.conn
            .lock()
            .map_err(|e| StateError::Query(e.to_string()))
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get(&self, path: &Path) -> Result<Option<TrackedFile>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE path = ?1"),
            [path_str(path)],
            row_to_tracked_file,
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn get_by_id(&self, id: FileId) -> Result<Option<TrackedFile>, StateError> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {FILE_COLUMNS} FROM files WHERE id = ?1"),
            [id.to_string()],
            row_to_tracked_file,
        )
        .optional()
        .map_err(StateError::query)
    }

    async fn get_by_identity(
        &self,
        identity: FileIdentity,
    ) -> Result<Vec<TrackedFile>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE device = ?1 AND inode = ?2"
            ))
            .map_err(StateError::query)?;
        let files = stmt
            .query_map(
                params![identity.device as i64, identity.inode as i64],
                row_to_tracked_file,
            )
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(files)
    }

    async fn upsert(&self, file: &TrackedFile) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            INSERT INTO files (id, path, device, inode, current_version, current_fingerprint, size_bytes, status, last_error, last_checked_at, last_event_at, deleted)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(id) DO UPDATE SET
                path = excluded.path,
                device = excluded.device,
                inode = excluded.inode,
                size_bytes = excluded.size_bytes,
                status = excluded.status,
                last_error = excluded.last_error,
                last_checked_at = excluded.last_checked_at,
                last_event_at = excluded.last_event_at
            "#,
            params![
                file.id.to_string(),
                path_str(&file.path),
                file.identity.map(|i| i.device as i64),
                file.identity.map(|i| i.inode as i64),
                file.current_version.map(|v| v as i64),
                file.current_fingerprint.map(|f| f.to_hex()),
                file.size_bytes as i64,
                file.status.as_str(),
                file.last_error,
                file.last_checked_at.map(|t| t.timestamp_millis()),
                file.last_event_at.map(|t| t.timestamp_millis()),
                file.deleted,
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn rename(
        &self,
        id: FileId,
        new_path: &Path,
        identity: Option<FileIdentity>,
    ) -> Result<(), StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let new_path = path_str(new_path);
        // A placeholder record at the target that never got a version is
        // superseded by the renamed file.
        tx.execute(
            "DELETE FROM files WHERE path = ?1 AND id != ?2 AND NOT EXISTS (SELECT 1 FROM versions v WHERE v.file_id = files.id)",
            params![new_path, id.to_string()],
        )
        .map_err(StateError::query)?;
        tx.execute(
            "UPDATE files SET path = ?1, device = ?2, inode = ?3 WHERE id = ?4",
            params![
                new_path,
                identity.map(|i| i.device as i64),
                identity.map(|i| i.inode as i64),
                id.to_string(),
            ],
        )
        .map_err(StateError::query)?;
        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn forget(&self, id: FileId) -> Result<Vec<Fingerprint>, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let candidates = chunks_of(&tx, id, None)?;
        tx.execute("DELETE FROM files WHERE id = ?1", [id.to_string()])
            .map_err(StateError::query)?;
        let orphans = unreferenced(&tx, candidates)?;
        tx.commit().map_err(StateError::query)?;
        Ok(orphans)
    }

    async fn record_version(&self, version: &FileVersion) -> Result<(), StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        tx.execute(
            "INSERT INTO versions (file_id, version, fingerprint, size_bytes, created_at, tombstone, state) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                version.file_id.to_string(),
                version.version as i64,
                version.fingerprint.to_hex(),
                version.size_bytes as i64,
                version.created_at.timestamp_millis(),
                version.tombstone,
                version.state.as_str(),
            ],
        )
        .map_err(StateError::query)?;
        {
            let mut insert = tx
                .prepare_cached(
                    "INSERT INTO version_chunks (file_id, version, seq, fingerprint, chunk_offset, chunk_length) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                )
                .map_err(StateError::query)?;
            // A chunk referenced again is no longer garbage.
            let mut ungc = tx
                .prepare_cached("DELETE FROM gc_queue WHERE fingerprint = ?1")
                .map_err(StateError::query)?;
            for (seq, chunk) in version.manifest.iter().enumerate() {
                let fp = chunk.fingerprint.to_hex();
                insert
                    .execute(params![
                        version.file_id.to_string(),
                        version.version as i64,
                        seq as i64,
                        fp,
                        chunk.offset as i64,
                        chunk.length as i64,
                    ])
                    .map_err(StateError::query)?;
                ungc.execute([&fp]).map_err(StateError::query)?;
            }
        }
        if version.state == VersionState::Pending {
            tx.execute(
                "UPDATE files SET status = 'pending', last_error = NULL WHERE id = ?1",
                [version.file_id.to_string()],
            )
            .map_err(StateError::query)?;
        }
        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn commit_version(&self, id: FileId, version: u64) -> Result<(), StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;

        let row: Option<(String, i64, bool, String)> = tx
            .query_row(
                "SELECT fingerprint, size_bytes, tombstone, state FROM versions WHERE file_id = ?1 AND version = ?2",
                params![id.to_string(), version as i64],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .map_err(StateError::query)?;
        let Some((fingerprint, size, tombstone, state)) = row else {
            return Err(StateError::NotPending {
                file_id: id.to_string(),
                version,
            });
        };
        if VersionState::from_str(&state) != Some(VersionState::Pending) {
            return Err(StateError::NotPending {
                file_id: id.to_string(),
                version,
            });
        }

        tx.execute(
            "UPDATE versions SET state = 'committed' WHERE file_id = ?1 AND version = ?2",
            params![id.to_string(), version as i64],
        )
        .map_err(StateError::query)?;

        let later_pending: bool = tx
            .query_row(
                "SELECT EXISTS (SELECT 1 FROM versions WHERE file_id = ?1 AND state = 'pending')",
                [id.to_string()],
                |row| row.get(0),
            )
            .map_err(StateError::query)?;
        let status = if later_pending {
            SyncStatus::Pending
        } else {
            SyncStatus::Clean
        };

        tx.execute(
            r#"
            UPDATE files SET
                current_version = ?1,
                current_fingerprint = ?2,
                size_bytes = ?3,
                deleted = ?4,
                status = ?5,
                last_error = NULL
            WHERE id = ?6 AND (current_version IS NULL OR current_version < ?1)
            "#,
            params![
                version as i64,
                if tombstone { None } else { Some(fingerprint) },
                size,
                tombstone,
                status.as_str(),
                id.to_string(),
            ],
        )
        .map_err(StateError::query)?;

        // Committed manifests are present on the backend by construction.
        let now = Utc::now().timestamp_millis();
        tx.execute(
            "INSERT OR IGNORE INTO chunks (fingerprint, acknowledged_at) SELECT fingerprint, ?3 FROM version_chunks WHERE file_id = ?1 AND version = ?2",
            params![id.to_string(), version as i64, now],
        )
        .map_err(StateError::query)?;

        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn abandon_version(
        &self,
        id: FileId,
        version: u64,
    ) -> Result<Vec<Fingerprint>, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let candidates = chunks_of(&tx, id, Some(version))?;
        let removed = tx
            .execute(
                "DELETE FROM versions WHERE file_id = ?1 AND version = ?2 AND state = 'pending'",
                params![id.to_string(), version as i64],
            )
            .map_err(StateError::query)?;
        if removed == 0 {
            return Ok(Vec::new());
        }
        let orphans = unreferenced(&tx, candidates)?;
        tx.commit().map_err(StateError::query)?;
        Ok(orphans)
    }

    async fn get_version(
        &self,
        id: FileId,
        version: u64,
    ) -> Result<Option<FileVersion>, StateError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions WHERE file_id = ?1 AND version = ?2"
                ),
                params![id.to_string(), version as i64],
                row_to_version,
            )
            .optional()
            .map_err(StateError::query)?;
        match found {
            Some(mut v) => {
                v.manifest = load_manifest(&conn, id, v.version)?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn latest_version(&self, id: FileId) -> Result<Option<FileVersion>, StateError> {
        let conn = self.lock()?;
        let found = conn
            .query_row(
                &format!(
                    "SELECT {VERSION_COLUMNS} FROM versions WHERE file_id = ?1 ORDER BY version DESC LIMIT 1"
                ),
                [id.to_string()],
                row_to_version,
            )
            .optional()
            .map_err(StateError::query)?;
        match found {
            Some(mut v) => {
                v.manifest = load_manifest(&conn, id, v.version)?;
                Ok(Some(v))
            }
            None => Ok(None),
        }
    }

    async fn list_versions(&self, id: FileId) -> Result<Vec<FileVersion>, StateError> {
        let conn = self.lock()?;
        let mut versions = {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {VERSION_COLUMNS} FROM versions WHERE file_id = ?1 ORDER BY version"
                ))
                .map_err(StateError::query)?;
            let rows = stmt
                .query_map([id.to_string()], row_to_version)
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            rows
        };
        for v in &mut versions {
            v.manifest = load_manifest(&conn, id, v.version)?;
        }
        Ok(versions)
    }

    async fn pending_versions(&self) -> Result<Vec<FileVersion>, StateError> {
        let conn = self.lock()?;
        let mut versions = {
            let mut stmt = conn
                .prepare_cached(&format!(
                    "SELECT {VERSION_COLUMNS} FROM versions WHERE state = 'pending' ORDER BY file_id, version"
                ))
                .map_err(StateError::query)?;
            let rows = stmt
                .query_map([], row_to_version)
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            rows
        };
        for v in &mut versions {
            v.manifest = load_manifest(&conn, v.file_id, v.version)?;
        }
        Ok(versions)
    }

    async fn list_pending(&self) -> Result<Vec<TrackedFile>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!(
                "SELECT {FILE_COLUMNS} FROM files WHERE status IN ('pending', 'uploading', 'failed') OR EXISTS (SELECT 1 FROM versions v WHERE v.file_id = files.id AND v.state = 'pending') ORDER BY path"
            ))
            .map_err(StateError::query)?;
        let files = stmt
            .query_map([], row_to_tracked_file)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(files)
    }

    async fn all_files(&self) -> Result<Vec<TrackedFile>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(&format!("SELECT {FILE_COLUMNS} FROM files ORDER BY path"))
            .map_err(StateError::query)?;
        let files = stmt
            .query_map([], row_to_tracked_file)
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(files)
    }

    async fn remove_versions(
        &self,
        id: FileId,
        versions: &[u64],
    ) -> Result<Vec<Fingerprint>, StateError> {
        if versions.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let mut candidates = Vec::new();
        for &version in versions {
            candidates.extend(chunks_of(&tx, id, Some(version))?);
            tx.execute(
                "DELETE FROM versions WHERE file_id = ?1 AND version = ?2",
                params![id.to_string(), version as i64],
            )
            .map_err(StateError::query)?;
        }
        let orphans = unreferenced(&tx, candidates)?;
        tx.commit().map_err(StateError::query)?;
        Ok(orphans)
    }

    async fn set_status(
        &self,
        id: FileId,
        status: SyncStatus,
        error: Option<&str>,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET status = ?1, last_error = ?2 WHERE id = ?3",
            params![status.as_str(), error, id.to_string()],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn touch_checked(
        &self,
        id: FileId,
        event_at: Option<DateTime<Utc>>,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE files SET last_checked_at = ?1, last_event_at = MAX(COALESCE(last_event_at, 0), COALESCE(?2, 0)) WHERE id = ?3",
            params![
                Utc::now().timestamp_millis(),
                event_at.map(|t| t.timestamp_millis()),
                id.to_string(),
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn mark_chunks_present(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO chunks (fingerprint, acknowledged_at) VALUES (?1, ?2)",
                )
                .map_err(StateError::query)?;
            let now = Utc::now().timestamp_millis();
            for fp in fingerprints {
                stmt.execute(params![fp.to_hex(), now])
                    .map_err(StateError::query)?;
            }
        }
        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn known_chunks(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<HashSet<Fingerprint>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached("SELECT 1 FROM chunks WHERE fingerprint = ?1")
            .map_err(StateError::query)?;
        let mut known = HashSet::new();
        for fp in fingerprints {
            if stmt.exists([fp.to_hex()]).map_err(StateError::query)? {
                known.insert(*fp);
            }
        }
        Ok(known)
    }

    async fn forget_chunks(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM chunks WHERE fingerprint = ?1")
                .map_err(StateError::query)?;
            for fp in fingerprints {
                stmt.execute([fp.to_hex()]).map_err(StateError::query)?;
            }
        }
        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn schedule_gc(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError> {
        if fingerprints.is_empty() {
            return Ok(());
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        {
            let mut stmt = tx
                .prepare_cached(
                    "INSERT OR IGNORE INTO gc_queue (fingerprint, scheduled_at) VALUES (?1, ?2)",
                )
                .map_err(StateError::query)?;
            let now = Utc::now().timestamp_millis();
            for fp in fingerprints {
                stmt.execute(params![fp.to_hex(), now])
                    .map_err(StateError::query)?;
            }
        }
        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn take_gc_batch(&self, limit: usize) -> Result<Vec<Fingerprint>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT fingerprint FROM gc_queue ORDER BY scheduled_at, fingerprint LIMIT ?1",
            )
            .map_err(StateError::query)?;
        let hexes = stmt
            .query_map([limit as i64], |row| row.get::<_, String>(0))
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(hexes.iter().filter_map(|h| Fingerprint::from_hex(h)).collect())
    }

    async fn claim_gc(&self, fingerprints: &[Fingerprint]) -> Result<Vec<Fingerprint>, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let mut claimed = Vec::new();
        {
            let mut referenced = tx
                .prepare_cached("SELECT 1 FROM version_chunks WHERE fingerprint = ?1 LIMIT 1")
                .map_err(StateError::query)?;
            let mut queued = tx
                .prepare_cached("SELECT 1 FROM gc_queue WHERE fingerprint = ?1")
                .map_err(StateError::query)?;
            let mut dequeue = tx
                .prepare_cached("DELETE FROM gc_queue WHERE fingerprint = ?1")
                .map_err(StateError::query)?;
            let mut forget = tx
                .prepare_cached("DELETE FROM chunks WHERE fingerprint = ?1")
                .map_err(StateError::query)?;
            for fp in fingerprints {
                let hex = fp.to_hex();
                if !queued.exists([&hex]).map_err(StateError::query)? {
                    continue;
                }
                if referenced.exists([&hex]).map_err(StateError::query)? {
                    dequeue.execute([&hex]).map_err(StateError::query)?;
                    continue;
                }
                forget.execute([&hex]).map_err(StateError::query)?;
                claimed.push(*fp);
            }
        }
        tx.commit().map_err(StateError::query)?;
        Ok(claimed)
    }

    async fn complete_gc(&self, fingerprints: &[Fingerprint]) -> Result<(), StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        {
            let mut stmt = tx
                .prepare_cached("DELETE FROM gc_queue WHERE fingerprint = ?1")
                .map_err(StateError::query)?;
            for fp in fingerprints {
                stmt.execute([fp.to_hex()]).map_err(StateError::query)?;
            }
        }
        tx.commit().map_err(StateError::query)?;
        Ok(())
    }

    async fn reset_failed(&self) -> Result<Vec<PathBuf>, StateError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(StateError::query)?;
        let paths = {
            let mut stmt = tx
                .prepare_cached("SELECT path FROM files WHERE status = 'failed' ORDER BY path")
                .map_err(StateError::query)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(StateError::query)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(StateError::query)?;
            rows
        };
        tx.execute(
            "UPDATE files SET status = 'pending', last_error = NULL WHERE status = 'failed'",
            [],
        )
        .map_err(StateError::query)?;
        tx.commit().map_err(StateError::query)?;
        Ok(paths.into_iter().map(PathBuf::from).collect())
    }

    async fn summary(&self) -> Result<SyncSummary, StateError> {
        let conn = self.lock()?;
        let count = |sql: &str| -> Result<u64, StateError> {
            conn.query_row(sql, [], |row| row.get::<_, i64>(0))
                .map(|n| n as u64)
                .map_err(StateError::query)
        };

        let total_files = count("SELECT COUNT(*) FROM files")?;
        let clean = count("SELECT COUNT(*) FROM files WHERE status = 'clean'")?;
        let pending =
            count("SELECT COUNT(*) FROM files WHERE status IN ('pending', 'uploading')")?;
        let failed = count("SELECT COUNT(*) FROM files WHERE status = 'failed'")?;
        let conflicts = count("SELECT COUNT(*) FROM files WHERE status = 'conflict'")?;
        let deleted = count("SELECT COUNT(*) FROM files WHERE deleted = 1")?;
        let committed_versions =
            count("SELECT COUNT(*) FROM versions WHERE state = 'committed'")?;
        let pending_versions = count("SELECT COUNT(*) FROM versions WHERE state = 'pending'")?;
        let known_chunks = count("SELECT COUNT(*) FROM chunks")?;
        let gc_queued = count("SELECT COUNT(*) FROM gc_queue")?;

        let last_sync: Option<(Option<i64>, Option<i64>)> = conn
            .query_row(
                "SELECT started_at, completed_at FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .map_err(StateError::query)?;
        let (last_sync_started, last_sync_completed) = match last_sync {
            Some((started, completed)) => (started.and_then(from_millis), completed.and_then(from_millis)),
            None => (None, None),
        };

        Ok(SyncSummary {
            total_files,
            clean,
            pending,
            failed,
            conflicts,
            deleted,
            committed_versions,
            pending_versions,
            known_chunks,
            gc_queued,
            last_sync_started,
            last_sync_completed,
        })
    }

    async fn start_sync_run(&self, source: RunSource) -> Result<i64, StateError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (source, started_at) VALUES (?1, ?2)",
            params![source.as_str(), Utc::now().timestamp_millis()],
        )
        .map_err(StateError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_sync_run(
        &self,
        run_id: i64,
        stats: &SyncRunStats,
    ) -> Result<(), StateError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE sync_runs SET completed_at = ?1, files_seen = ?2, versions_committed = ?3, files_failed = ?4, interrupted = ?5 WHERE id = ?6",
            params![
                Utc::now().timestamp_millis(),
                stats.files_seen as i64,
                stats.versions_committed as i64,
                stats.files_failed as i64,
                stats.interrupted,
                run_id,
            ],
        )
        .map_err(StateError::query)?;
        Ok(())
    }

    async fn recent_runs(&self, limit: usize) -> Result<Vec<SyncRunRecord>, StateError> {
        let conn = self.lock()?;
        let mut stmt = conn
            .prepare_cached(
                "SELECT id, source, started_at, completed_at, files_seen, versions_committed, files_failed, interrupted FROM sync_runs ORDER BY id DESC LIMIT ?1",
            )
            .map_err(StateError::query)?;
        let runs = stmt
            .query_map([limit as i64], |row| {
                let source: String = row.get(1)?;
                Ok(SyncRunRecord {
                    id: row.get(0)?,
                    source: RunSource::from_str(&source).unwrap_or(RunSource::Realtime),
                    started_at: from_millis(row.get(2)?).unwrap_or(DateTime::UNIX_EPOCH),
                    completed_at: row.get::<_, Option<i64>>(3)?.and_then(from_millis),
                    stats: SyncRunStats {
                        files_seen: row.get::<_, i64>(4)? as u64,
                        versions_committed: row.get::<_, i64>(5)? as u64,
                        files_failed: row.get::<_, i64>(6)? as u64,
                        interrupted: row.get(7)?,
                    },
                })
            })
            .map_err(StateError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(StateError::query)?;
        Ok(runs)
    }
}

fn path_str(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

fn from_millis(ms: i64) -> Option<DateTime<Utc>> {
    Utc.timestamp_millis_opt(ms).single()
}

/// Chunk fingerprints referenced by one version of a file, or by all of them.
fn chunks_of(
    tx: &Transaction<'_>,
    id: FileId,
    version: Option<u64>,
) -> Result<Vec<Fingerprint>, StateError> {
    let mut stmt = tx
        .prepare_cached(
            "SELECT DISTINCT fingerprint FROM version_chunks WHERE file_id = ?1 AND (?2 IS NULL OR version = ?2)",
        )
        .map_err(StateError::query)?;
    let hexes = stmt
        .query_map(params![id.to_string(), version.map(|v| v as i64)], |row| {
            row.get::<_, String>(0)
        })
        .map_err(StateError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::query)?;
    Ok(hexes.iter().filter_map(|h| Fingerprint::from_hex(h)).collect())
}

/// Filter `candidates` down to fingerprints no version references.
fn unreferenced(
    tx: &Transaction<'_>,
    candidates: Vec<Fingerprint>,
) -> Result<Vec<Fingerprint>, StateError> {
    let mut stmt = tx
        .prepare_cached("SELECT 1 FROM version_chunks WHERE fingerprint = ?1 LIMIT 1")
        .map_err(StateError::query)?;
    let mut seen = HashSet::new();
    let mut orphans = Vec::new();
    for fp in candidates {
        if !seen.insert(fp) {
            continue;
        }
        if !stmt.exists([fp.to_hex()]).map_err(StateError::query)? {
            orphans.push(fp);
        }
    }
    Ok(orphans)
}

fn load_manifest(conn: &Connection, id: FileId, version: u64) -> Result<Vec<ChunkRef>, StateError> {
    let mut stmt = conn
        .prepare_cached(
            "SELECT fingerprint, chunk_offset, chunk_length FROM version_chunks WHERE file_id = ?1 AND version = ?2 ORDER BY seq",
        )
        .map_err(StateError::query)?;
    let rows = stmt
        .query_map(params![id.to_string(), version as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
            ))
        })
        .map_err(StateError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(StateError::query)?;
    rows.into_iter()
        .map(|(hex, offset, length)| {
            let fingerprint = Fingerprint::from_hex(&hex)
                .ok_or_else(|| StateError::Query(format!("corrupt chunk fingerprint {hex}")))?;
            Ok(ChunkRef {
                fingerprint,
                offset: offset as u64,
                length: length as u32,
            })
        })
        .collect()
}

fn conversion_error(column: usize, what: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        column,
        rusqlite::types::Type::Text,
        format!("invalid {what}").into(),
    )
}

/// Convert a database row to a TrackedFile.
fn row_to_tracked_file(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackedFile> {
    let id: String = row.get(0)?;
    let path: String = row.get(1)?;
    let device: Option<i64> = row.get(2)?;
    let inode: Option<i64> = row.get(3)?;
    let current_version: Option<i64> = row.get(4)?;
    let current_fingerprint: Option<String> = row.get(5)?;
    let size_bytes: i64 = row.get(6)?;
    let status: String = row.get(7)?;
    let last_error: Option<String> = row.get(8)?;
    let last_checked_at: Option<i64> = row.get(9)?;
    let last_event_at: Option<i64> = row.get(10)?;
    let deleted: bool = row.get(11)?;

    Ok(TrackedFile {
        id: FileId::parse(&id).ok_or_else(|| conversion_error(0, "file id"))?,
        path: PathBuf::from(path),
        identity: match (device, inode) {
            (Some(device), Some(inode)) => Some(FileIdentity {
                device: device as u64,
                inode: inode as u64,
            }),
            _ => None,
        },
        current_version: current_version.map(|v| v as u64),
        current_fingerprint: current_fingerprint.as_deref().and_then(Fingerprint::from_hex),
        size_bytes: size_bytes as u64,
        status: SyncStatus::from_str(&status).unwrap_or(SyncStatus::Pending),
        last_error,
        last_checked_at: last_checked_at.and_then(from_millis),
        last_event_at: last_event_at.and_then(from_millis),
        deleted,
    })
}

/// Convert a database row to a FileVersion without its manifest.
fn row_to_version(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileVersion> {
    let file_id: String = row.get(0)?;
    let fingerprint: String = row.get(2)?;
    let state: String = row.get(6)?;
    Ok(FileVersion {
        file_id: FileId::parse(&file_id).ok_or_else(|| conversion_error(0, "file id"))?,
        version: row.get::<_, i64>(1)? as u64,
        fingerprint: Fingerprint::from_hex(&fingerprint)
            .ok_or_else(|| conversion_error(2, "fingerprint"))?,
        size_bytes: row.get::<_, i64>(3)? as u64,
        created_at: from_millis(row.get(4)?).unwrap_or(DateTime::UNIX_EPOCH),
        manifest: Vec::new(),
        tombstone: row.get(5)?,
        state: VersionState::from_str(&state).unwrap_or(VersionState::Pending),
    })
}
