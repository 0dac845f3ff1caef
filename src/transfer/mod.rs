//! Transfer pipeline: encrypted, resumable chunk upload and version commit.
//!
//! A fixed pool of workers pulls [`UploadJob`]s from a per-file FIFO
//! scheduler. For each job a worker:
//! 1. negotiates which manifest chunks the backend is missing,
//! 2. re-reads each missing chunk from the source file and verifies its
//!    fingerprint (a mismatch means the file changed: the job is stale),
//! 3. seals it with the account key and uploads it, recording the
//!    acknowledgement so a restarted job skips it,
//! 4. commits the version on the backend, then in the store.
//!
//! Workers stop at chunk boundaries when paused, halted by an auth failure,
//! or cancelled. Paused and halted jobs go back to the front of their
//! file's queue.

pub mod backend;
pub mod crypto;
pub mod error;
pub mod http;
pub mod job;
#[cfg(test)]
pub mod memory;
mod scheduler;
pub mod throttle;

use std::collections::HashSet;
use std::future::Future;
use std::num::NonZeroU32;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Notify, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub use backend::{Backend, CommitRequest, RemoteVersion, UploadRequest, UploadSession};
pub use crypto::ChunkCipher;
pub use error::TransferError;
pub use http::HttpBackend;
pub use job::{JobKind, JobOutcome, JobReport, UploadJob};

use crate::classify::chunker::read_chunk;
use crate::config::EngineConfig;
use crate::locks::KeyedLocks;
use crate::retry::{retry_with_backoff, RetryAction, RetryConfig};
use crate::state::{ChunkRef, Fingerprint, MetadataStore, SyncStatus};
use crate::versions::VersionManager;
use scheduler::{Scheduler, Ticket};
use throttle::Bandwidth;

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    pub retry: RetryConfig,
    pub bandwidth_limit_kbps: Option<NonZeroU32>,
}

impl PipelineSettings {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            workers: config.max_parallel_uploads,
            queue_capacity: config.upload_queue_capacity,
            retry: config.retry,
            bandwidth_limit_kbps: config.bandwidth_limit_kbps,
        }
    }
}

/// Queue depths reported in the status feed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepth {
    pub queued: usize,
    pub in_flight: usize,
}

struct Shared {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn Backend>,
    versions: Arc<VersionManager>,
    cipher: Arc<ChunkCipher>,
    bandwidth: Option<Bandwidth>,
    retry: RetryConfig,
    chunk_locks: KeyedLocks<Fingerprint>,
    /// Held shared by running jobs and exclusively by garbage collection.
    gc_gate: RwLock<()>,
    scheduler: Mutex<Scheduler>,
    slots: Arc<Semaphore>,
    wake: Notify,
    paused: AtomicBool,
    halted: AtomicBool,
    reports: mpsc::UnboundedSender<JobReport>,
    cancel: CancellationToken,
}

pub struct TransferPipeline {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    worker_count: usize,
}

impl TransferPipeline {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn Backend>,
        versions: Arc<VersionManager>,
        cipher: Arc<ChunkCipher>,
        settings: PipelineSettings,
        reports: mpsc::UnboundedSender<JobReport>,
        cancel: CancellationToken,
    ) -> Self {
        let shared = Arc::new(Shared {
            store,
            backend,
            versions,
            cipher,
            bandwidth: settings.bandwidth_limit_kbps.map(Bandwidth::new),
            retry: settings.retry,
            chunk_locks: KeyedLocks::new(),
            gc_gate: RwLock::new(()),
            scheduler: Mutex::new(Scheduler::default()),
            slots: Arc::new(Semaphore::new(settings.queue_capacity.max(1))),
            wake: Notify::new(),
            paused: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            reports,
            cancel,
        });
        Self {
            shared,
            workers: Mutex::new(Vec::new()),
            worker_count: settings.workers.max(1),
        }
    }

    /// Spawn the worker pool.
    pub fn start(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        if !workers.is_empty() {
            return;
        }
        for index in 0..self.worker_count {
            workers.push(tokio::spawn(worker_loop(self.shared.clone(), index)));
        }
        tracing::debug!(workers = self.worker_count, "Upload workers started");
    }

    /// Queue a job, waiting for room when the queue is full. Returns
    /// `false` if the pipeline shut down first.
    pub async fn enqueue(&self, job: UploadJob) -> bool {
        let slot = tokio::select! {
            slot = self.shared.slots.clone().acquire_owned() => match slot {
                Ok(slot) => slot,
                Err(_) => return false,
            },
            () = self.shared.cancel.cancelled() => return false,
        };
        {
            let mut scheduler = self.shared.scheduler();
            if scheduler.contains(job.file_id(), job.version.version) {
                return true;
            }
            tracing::debug!(
                file_id = %job.file_id(),
                version = job.version.version,
                kind = ?job.kind,
                "Queued upload"
            );
            scheduler.push(Ticket { job, _slot: slot });
        }
        self.shared.wake.notify_waiters();
        true
    }

    /// Stop dispatching. Running jobs stop at the next chunk boundary.
    pub fn pause(&self) {
        self.shared.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.shared.paused.store(false, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    pub fn is_paused(&self) -> bool {
        self.shared.paused.load(Ordering::SeqCst)
    }

    /// Stop dispatching until [`clear_halt`](Self::clear_halt), as after an
    /// auth rejection seen outside the workers (keepalive).
    pub fn halt(&self) {
        self.shared.halted.store(true, Ordering::SeqCst);
    }

    /// Clear the halt caused by an auth rejection.
    pub fn clear_halt(&self) {
        self.shared.halted.store(false, Ordering::SeqCst);
        self.shared.wake.notify_waiters();
    }

    pub fn is_halted(&self) -> bool {
        self.shared.halted.load(Ordering::SeqCst)
    }

    pub fn depth(&self) -> QueueDepth {
        let scheduler = self.shared.scheduler();
        QueueDepth {
            queued: scheduler.queued(),
            in_flight: scheduler.in_flight(),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.depth() == QueueDepth::default()
    }

    /// Delete up to `limit` queued garbage chunks from the backend and
    /// return the ones deleted.
    ///
    /// Skipped (returns nothing) while any job is running, so a chunk can
    /// never be deleted between an upload's negotiation and its commit.
    pub async fn collect_garbage(&self, limit: usize) -> Result<Vec<Fingerprint>, TransferError> {
        let Ok(_gate) = self.shared.gc_gate.try_write() else {
            return Ok(Vec::new());
        };
        let store = &self.shared.store;
        let batch = store.take_gc_batch(limit).await?;
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let claimed = store.claim_gc(&batch).await?;
        if !claimed.is_empty() {
            let backend = &self.shared.backend;
            self.shared
                .retrying(|| backend.delete_chunks(&claimed))
                .await?;
        }
        store.complete_gc(&claimed).await?;
        tracing::info!(
            candidates = batch.len(),
            deleted = claimed.len(),
            "Garbage collected chunks"
        );
        Ok(claimed)
    }

    /// Cancel and wait for the workers to stop at a chunk boundary.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        let workers: Vec<_> = self
            .workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for worker in workers {
            if let Err(e) = worker.await {
                tracing::warn!(error = %e, "Upload worker panicked");
            }
        }
    }
}

async fn worker_loop(shared: Arc<Shared>, index: usize) {
    loop {
        // Register before checking the queue so a push between the check
        // and the wait is not missed.
        let notified = shared.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if shared.cancel.is_cancelled() {
            break;
        }
        let ticket = if shared.dispatching() {
            shared.scheduler().next()
        } else {
            None
        };
        let Some(ticket) = ticket else {
            tokio::select! {
                () = &mut notified => continue,
                () = shared.cancel.cancelled() => break,
            }
        };

        let report = shared.process(ticket).await;
        if shared.reports.send(report).is_err() {
            tracing::debug!(worker = index, "Report receiver closed");
        }
        shared.wake.notify_waiters();
    }
    tracing::debug!(worker = index, "Upload worker stopped");
}

/// Manifest entries for each distinct fingerprint, first occurrence.
fn distinct_chunks(manifest: &[ChunkRef]) -> Vec<ChunkRef> {
    let mut seen = HashSet::new();
    manifest
        .iter()
        .filter(|c| seen.insert(c.fingerprint))
        .copied()
        .collect()
}

/// Read a chunk back from the source file and check it still matches.
async fn read_verified(path: &Path, chunk: ChunkRef) -> Result<Vec<u8>, TransferError> {
    let owned = path.to_path_buf();
    let data = tokio::task::spawn_blocking(move || read_chunk(&owned, &chunk))
        .await
        .map_err(|e| TransferError::Other(e.into()))?;
    let data = match data {
        Ok(data) => data,
        Err(e)
            if matches!(
                e.kind(),
                std::io::ErrorKind::NotFound | std::io::ErrorKind::UnexpectedEof
            ) =>
        {
            return Err(TransferError::Stale(path.display().to_string()));
        }
        Err(e) => return Err(TransferError::Disk(e)),
    };
    if Fingerprint::of(&data) != chunk.fingerprint {
        return Err(TransferError::Stale(path.display().to_string()));
    }
    Ok(data)
}

impl Shared {
    fn scheduler(&self) -> MutexGuard<'_, Scheduler> {
        self.scheduler.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn dispatching(&self) -> bool {
        !self.paused.load(Ordering::SeqCst) && !self.halted.load(Ordering::SeqCst)
    }

    /// Outcome to stop with at a chunk boundary, if any.
    fn checkpoint(&self) -> Option<JobOutcome> {
        if self.cancel.is_cancelled() {
            Some(JobOutcome::Cancelled)
        } else if !self.dispatching() {
            Some(JobOutcome::Paused)
        } else {
            None
        }
    }

    async fn retrying<T, F, Fut>(&self, operation: F) -> Result<T, TransferError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, TransferError>>,
    {
        retry_with_backoff(
            &self.retry,
            &self.cancel,
            |e: &TransferError| {
                if e.is_retryable() {
                    RetryAction::Retry
                } else {
                    RetryAction::Abort
                }
            },
            operation,
        )
        .await
    }

    async fn process(&self, ticket: Ticket) -> JobReport {
        let Ticket { mut job, _slot: slot } = ticket;
        let file_id = job.file_id();
        let version = job.version.version;
        let mut uploaded = 0;

        let outcome = {
            let _gate = self.gc_gate.read().await;
            match self.run_job(&job, &mut uploaded).await {
                Ok(outcome) => outcome,
                Err(_) if self.cancel.is_cancelled() => JobOutcome::Cancelled,
                Err(TransferError::Auth(message)) => JobOutcome::AuthRejected { message },
                Err(TransferError::Conflict { server_head, .. }) => {
                    JobOutcome::Conflict { server_head }
                }
                Err(TransferError::Stale(_)) => JobOutcome::Stale,
                Err(e) => JobOutcome::Failed {
                    class: e.class(),
                    message: e.to_string(),
                },
            }
        };

        let report = JobReport {
            file_id,
            path: job.path.clone(),
            version,
            kind: job.kind,
            outcome: outcome.clone(),
            chunks_uploaded: uploaded,
        };

        match &outcome {
            JobOutcome::Committed | JobOutcome::Repaired => {
                tracing::info!(
                    file_id = %file_id,
                    path = %job.path.display(),
                    version,
                    chunks = uploaded,
                    "Upload complete"
                );
            }
            JobOutcome::Paused | JobOutcome::AuthRejected { .. } => {
                if let JobOutcome::AuthRejected { message } = &outcome {
                    self.halted.store(true, Ordering::SeqCst);
                    tracing::error!(error = %message, "Backend rejected credentials, halting uploads");
                }
                self.reset_status(&job).await;
                job.attempts += 1;
                self.scheduler().push_front(Ticket { job, _slot: slot });
            }
            JobOutcome::Cancelled => {
                // The pending version stays in the store and is re-queued
                // on the next start.
                self.reset_status(&job).await;
            }
            JobOutcome::Stale | JobOutcome::Conflict { .. } | JobOutcome::Failed { .. } => {
                self.abandon(&job, &outcome).await;
            }
        }
        self.scheduler().finish(file_id);
        report
    }

    async fn reset_status(&self, job: &UploadJob) {
        if job.kind != JobKind::Commit {
            return;
        }
        if let Err(e) = self
            .store
            .set_status(job.file_id(), SyncStatus::Pending, None)
            .await
        {
            tracing::warn!(file_id = %job.file_id(), error = %e, "Failed to reset file status");
        }
    }

    /// Drop a failed version, every later version of the file, and
    /// surface the failure on the file record.
    async fn abandon(&self, job: &UploadJob, outcome: &JobOutcome) {
        let file_id = job.file_id();
        let (status, message) = match outcome {
            JobOutcome::Stale => (SyncStatus::Pending, None),
            JobOutcome::Conflict { .. } => (SyncStatus::Conflict, Some("version conflict".to_string())),
            JobOutcome::Failed { message, .. } => (SyncStatus::Failed, Some(message.clone())),
            _ => return,
        };
        tracing::warn!(
            file_id = %file_id,
            path = %job.path.display(),
            version = job.version.version,
            outcome = ?outcome,
            "Upload did not complete"
        );
        if job.kind == JobKind::Commit {
            let dropped = self.scheduler().drop_from(file_id, job.version.version);
            if !dropped.is_empty() {
                tracing::debug!(file_id = %file_id, dropped = dropped.len(), "Dropped later queued versions");
            }
            if let Err(e) = self.versions.abandon_from(file_id, job.version.version).await {
                tracing::warn!(file_id = %file_id, error = %e, "Failed to abandon versions");
            }
        }
        if let Err(e) = self
            .store
            .set_status(file_id, status, message.as_deref())
            .await
        {
            tracing::warn!(file_id = %file_id, error = %e, "Failed to record upload failure");
        }
    }

    async fn run_job(
        &self,
        job: &UploadJob,
        uploaded: &mut usize,
    ) -> Result<JobOutcome, TransferError> {
        if let Some(stop) = self.checkpoint() {
            return Ok(stop);
        }
        let file_id = job.file_id();
        let version = &job.version;
        if job.kind == JobKind::Commit {
            self.store
                .set_status(file_id, SyncStatus::Uploading, None)
                .await?;
        }

        let chunks = distinct_chunks(&version.manifest);
        let request = UploadRequest {
            file_id,
            path: job.path.clone(),
            version: version.version,
            size: version.size_bytes,
            chunk_count: chunks.len(),
        };
        let session = self
            .retrying(|| self.backend.initiate_upload(&request))
            .await?;

        // Repair ignores local acknowledgements and asks the backend.
        let fingerprints: Vec<Fingerprint> = chunks.iter().map(|c| c.fingerprint).collect();
        let candidates: Vec<Fingerprint> = match job.kind {
            JobKind::Repair => fingerprints,
            JobKind::Commit => {
                let known = self.store.known_chunks(&fingerprints).await?;
                fingerprints
                    .into_iter()
                    .filter(|fp| !known.contains(fp))
                    .collect()
            }
        };
        let missing: HashSet<Fingerprint> = self
            .retrying(|| self.backend.missing_chunks(&candidates))
            .await?
            .into_iter()
            .collect();
        let present: Vec<Fingerprint> = candidates
            .iter()
            .filter(|fp| !missing.contains(fp))
            .copied()
            .collect();
        self.store.mark_chunks_present(&present).await?;
        if job.kind == JobKind::Repair && !missing.is_empty() {
            let lost: Vec<Fingerprint> = missing.iter().copied().collect();
            tracing::warn!(file_id = %file_id, missing = lost.len(), "Backend lost chunks, re-uploading");
            self.store.forget_chunks(&lost).await?;
        }

        for chunk in chunks.iter().filter(|c| missing.contains(&c.fingerprint)) {
            if let Some(stop) = self.checkpoint() {
                return Ok(stop);
            }
            let fp = chunk.fingerprint;
            let _chunk_guard = self.chunk_locks.lock(&fp).await;
            // Another job may have uploaded it while we waited.
            if !self.store.known_chunks(&[fp]).await?.is_empty() {
                continue;
            }
            let data = read_verified(&job.path, *chunk).await?;
            if let Some(bandwidth) = &self.bandwidth {
                tokio::select! {
                    () = bandwidth.acquire(data.len()) => {}
                    () = self.cancel.cancelled() => return Ok(JobOutcome::Cancelled),
                }
            }
            let sealed = self.cipher.seal(&data)?;
            let put = self.retrying(|| self.backend.put_chunk(&session, &fp, sealed.clone()));
            tokio::select! {
                result = put => result?,
                () = self.cancel.cancelled() => return Ok(JobOutcome::Cancelled),
            }
            self.store.mark_chunks_present(&[fp]).await?;
            *uploaded += 1;
            tracing::debug!(
                file_id = %file_id,
                version = version.version,
                chunk = %fp.short(),
                bytes = data.len(),
                "Chunk acknowledged"
            );
        }

        if job.kind == JobKind::Repair {
            return Ok(JobOutcome::Repaired);
        }
        if let Some(stop) = self.checkpoint() {
            return Ok(stop);
        }

        let commit = CommitRequest::for_version(&session, job.path.clone(), version);
        self.retrying(|| self.backend.commit_version(&commit))
            .await?;
        self.store.commit_version(file_id, version.version).await?;
        self.versions.enforce_retention(file_id).await?;
        Ok(JobOutcome::Committed)
    }
}
