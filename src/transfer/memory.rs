//! In-process backend used by tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use tokio::sync::Semaphore;

use super::backend::{Backend, CommitRequest, RemoteVersion, UploadRequest, UploadSession};
use super::error::TransferError;
use crate::state::{FileId, Fingerprint};

#[derive(Default)]
struct Inner {
    chunks: HashMap<Fingerprint, Vec<u8>>,
    puts: HashMap<Fingerprint, usize>,
    versions: HashMap<FileId, Vec<RemoteVersion>>,
    commits: Vec<CommitRequest>,
    deleted: Vec<Fingerprint>,
}

pub struct MemoryBackend {
    inner: Mutex<Inner>,
    uploads: AtomicUsize,
    transient_failures: AtomicU32,
    reject_auth: AtomicBool,
    corrupt_gets: AtomicU32,
    put_gate: Semaphore,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            uploads: AtomicUsize::new(0),
            transient_failures: AtomicU32::new(0),
            reject_auth: AtomicBool::new(false),
            corrupt_gets: AtomicU32::new(0),
            put_gate: Semaphore::new(Semaphore::MAX_PERMITS),
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `n` chunk uploads with a 503.
    pub fn fail_next_puts(&self, n: u32) {
        self.transient_failures.store(n, Ordering::SeqCst);
    }

    pub fn set_reject_auth(&self, reject: bool) {
        self.reject_auth.store(reject, Ordering::SeqCst);
    }

    /// Flip a byte in the next `n` chunk downloads.
    pub fn corrupt_next_gets(&self, n: u32) {
        self.corrupt_gets.store(n, Ordering::SeqCst);
    }

    /// Let `n` more chunk uploads through, then block until released.
    pub fn hold_puts_after(&self, n: usize) {
        let available = self.put_gate.available_permits();
        if available > n {
            self.put_gate.forget_permits(available - n);
        } else {
            self.put_gate.add_permits(n - available);
        }
    }

    pub fn release_puts(&self) {
        self.put_gate
            .add_permits(Semaphore::MAX_PERMITS - self.put_gate.available_permits());
    }

    /// Total chunk uploads accepted.
    pub fn put_count(&self) -> usize {
        self.inner().puts.values().sum()
    }

    pub fn puts_of(&self, fingerprint: &Fingerprint) -> usize {
        self.inner().puts.get(fingerprint).copied().unwrap_or(0)
    }

    pub fn chunk_count(&self) -> usize {
        self.inner().chunks.len()
    }

    pub fn has_chunk(&self, fingerprint: &Fingerprint) -> bool {
        self.inner().chunks.contains_key(fingerprint)
    }

    pub fn commits(&self) -> Vec<CommitRequest> {
        self.inner().commits.clone()
    }

    pub fn deleted(&self) -> Vec<Fingerprint> {
        self.inner().deleted.clone()
    }

    pub fn versions_of(&self, file_id: FileId) -> Vec<RemoteVersion> {
        self.inner().versions.get(&file_id).cloned().unwrap_or_default()
    }

    /// Commit a version as another agent would.
    pub fn inject_version(&self, file_id: FileId, version: RemoteVersion, chunks: Vec<(Fingerprint, Vec<u8>)>) {
        let mut inner = self.inner();
        inner.chunks.extend(chunks);
        let versions = inner.versions.entry(file_id).or_default();
        versions.push(version);
        versions.sort_by_key(|v| v.version);
    }

    fn check_auth(&self) -> Result<(), TransferError> {
        if self.reject_auth.load(Ordering::SeqCst) {
            return Err(TransferError::Auth("credentials revoked".into()));
        }
        Ok(())
    }
}

fn take_one(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait::async_trait]
impl Backend for MemoryBackend {
    async fn initiate_upload(
        &self,
        request: &UploadRequest,
    ) -> Result<UploadSession, TransferError> {
        self.check_auth()?;
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(UploadSession {
            id: format!("{}-{}-{n}", request.file_id, request.version),
        })
    }

    async fn put_chunk(
        &self,
        _session: &UploadSession,
        fingerprint: &Fingerprint,
        sealed: Vec<u8>,
    ) -> Result<(), TransferError> {
        self.check_auth()?;
        let permit = self
            .put_gate
            .acquire()
            .await
            .map_err(|e| TransferError::Unavailable(e.to_string()))?;
        permit.forget();
        if take_one(&self.transient_failures) {
            return Err(TransferError::HttpStatus {
                status: 503,
                endpoint: "put_chunk".into(),
            });
        }
        let mut inner = self.inner();
        inner.chunks.insert(*fingerprint, sealed);
        *inner.puts.entry(*fingerprint).or_default() += 1;
        Ok(())
    }

    async fn missing_chunks(
        &self,
        fingerprints: &[Fingerprint],
    ) -> Result<Vec<Fingerprint>, TransferError> {
        self.check_auth()?;
        let inner = self.inner();
        Ok(fingerprints
            .iter()
            .filter(|fp| !inner.chunks.contains_key(fp))
            .copied()
            .collect())
    }

    async fn commit_version(&self, request: &CommitRequest) -> Result<(), TransferError> {
        self.check_auth()?;
        let mut inner = self.inner();
        if let Some(missing) = request
            .manifest
            .iter()
            .find(|c| !inner.chunks.contains_key(&c.fingerprint))
        {
            return Err(TransferError::HttpStatus {
                status: 400,
                endpoint: format!("commit missing chunk {}", missing.fingerprint.short()),
            });
        }
        let last = inner.versions.get(&request.file_id).and_then(|v| v.last());
        let head = last.map(|v| v.version);
        if let Some(last) = last.filter(|v| v.version == request.version) {
            // A replay after a lost response carries the same content;
            // anything else is another agent's version.
            if last.fingerprint == request.fingerprint && last.tombstone == request.tombstone {
                return Ok(());
            }
            return Err(TransferError::Conflict {
                server_head: head,
                expected: request.parent_version,
            });
        }
        if head.unwrap_or(0) + 1 != request.version {
            return Err(TransferError::Conflict {
                server_head: head,
                expected: request.parent_version,
            });
        }
        inner.commits.push(request.clone());
        inner
            .versions
            .entry(request.file_id)
            .or_default()
            .push(RemoteVersion {
                version: request.version,
                fingerprint: request.fingerprint,
                size: request.size,
                created_at: request.created_at,
                manifest: request.manifest.clone(),
                tombstone: request.tombstone,
            });
        Ok(())
    }

    async fn list_versions(&self, file_id: FileId) -> Result<Vec<RemoteVersion>, TransferError> {
        self.check_auth()?;
        Ok(self.versions_of(file_id))
    }

    async fn get_chunk(&self, fingerprint: &Fingerprint) -> Result<Vec<u8>, TransferError> {
        self.check_auth()?;
        let mut sealed = self
            .inner()
            .chunks
            .get(fingerprint)
            .cloned()
            .ok_or_else(|| TransferError::NotFound(fingerprint.to_hex()))?;
        if take_one(&self.corrupt_gets) {
            if let Some(last) = sealed.last_mut() {
                *last ^= 0xff;
            }
        }
        Ok(sealed)
    }

    async fn delete_chunks(&self, fingerprints: &[Fingerprint]) -> Result<(), TransferError> {
        self.check_auth()?;
        let mut inner = self.inner();
        for fp in fingerprints {
            inner.chunks.remove(fp);
            inner.deleted.push(*fp);
        }
        Ok(())
    }

    async fn keepalive(&self) -> Result<(), TransferError> {
        self.check_auth()
    }
}
