//! Sync orchestrator.
//!
//! Owns every component of a running engine and drives them from a single
//! `tokio::select!` loop: watcher events and dirty paths feed a backlog
//! that coalesces them per path, the backlog is classified on a bounded set of tasks, classification
//! enqueues upload jobs, and job reports, commands and timers update the
//! published [`SyncState`].
//!
//! Startup re-enqueues pending versions left by a previous run before any
//! new version is allocated, then reconciles the roots against the store
//! (see [`scan`]). The watcher starts before that scan; its events wait in
//! the backlog until the pending versions are queued.

mod backlog;
mod conflict;
mod scan;
mod status;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::sync::{mpsc, oneshot, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use status::{EngineState, SyncState};

use crate::classify::{Classification, ClassifyError, Classifier};
use crate::config::EngineConfig;
use crate::error::ErrorClass;
use crate::locks::{KeyGuard, KeyedLocks};
use crate::restore::{FileRef, RestoreCoordinator, RestoreError, RestoreOutcome};
use crate::state::{
    FileId, MetadataStore, RunSource, StateError, SyncRunStats, SyncStatus,
};
use crate::transfer::{
    Backend, ChunkCipher, JobOutcome, JobReport, PipelineSettings, TransferError,
    TransferPipeline, UploadJob,
};
use crate::versions::VersionManager;
use crate::watcher::{ChangeEvent, ChangeKind, DirtySet, FsWatcher, PathFilter, WatchSettings};
use backlog::Backlog;
use status::Activity;

/// Garbage chunks deleted per collection pass.
const GC_BATCH: usize = 256;

const COMMAND_CAPACITY: usize = 32;

/// Requests accepted by a running engine.
#[derive(Debug)]
pub enum Command {
    /// Stop dispatching uploads. Running uploads stop at a chunk boundary.
    Pause,
    Resume,
    Restore {
        file: FileRef,
        version: u64,
        /// The tracked path when `None`.
        destination: Option<PathBuf>,
        reply: oneshot::Sender<Result<RestoreOutcome, RestoreError>>,
    },
    /// Reconcile every root. With `force`, unchanged committed files are
    /// re-verified against the backend.
    Rescan { force: bool },
    /// Reset failed files and classify them again.
    RetryFailed,
    /// Resume transfers after an auth rejection.
    ClearError,
}

/// A configured engine, not yet running.
pub struct Engine {
    config: EngineConfig,
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn Backend>,
    cipher: Arc<ChunkCipher>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn MetadataStore>,
        backend: Arc<dyn Backend>,
        cipher: ChunkCipher,
    ) -> Self {
        Self {
            config,
            store,
            backend,
            cipher: Arc::new(cipher),
        }
    }

    /// Start the engine: workers, watcher, timers and the orchestrator loop.
    pub async fn start(self) -> anyhow::Result<EngineHandle> {
        let Self {
            config,
            store,
            backend,
            cipher,
        } = self;
        let cancel = CancellationToken::new();

        let filter = Arc::new(
            PathFilter::new(
                config.roots.clone(),
                &config.exclude,
                vec![config.state_dir.clone()],
            )
            .context("invalid `exclude` pattern")?,
        );
        let versions = Arc::new(VersionManager::new(store.clone(), config.retention));
        let (reports_tx, reports_rx) = mpsc::unbounded_channel();
        let pipeline = Arc::new(TransferPipeline::new(
            store.clone(),
            backend.clone(),
            versions.clone(),
            cipher.clone(),
            PipelineSettings::from_config(&config),
            reports_tx,
            cancel.child_token(),
        ));
        let restorer = Arc::new(RestoreCoordinator::new(
            store.clone(),
            backend.clone(),
            cipher,
            config.chunk_cache_dir(),
            config.retry,
            cancel.child_token(),
        ));
        let classifier = Classifier::new(store.clone(), versions.clone(), config.chunk_policy);

        let run_id = store
            .start_sync_run(RunSource::Realtime)
            .await
            .context("Failed to record sync run")?;

        let (events_tx, events_rx) = mpsc::channel(config.event_queue_capacity.max(1));
        let dirty = DirtySet::new();
        let watcher = if config.watch {
            let settings = WatchSettings {
                debounce: config.debounce,
                capacity: config.event_queue_capacity,
            };
            Some(
                FsWatcher::spawn(
                    filter.clone(),
                    settings,
                    events_tx,
                    dirty.clone(),
                    cancel.child_token(),
                )
                .context("Failed to start filesystem watcher")?,
            )
        } else {
            None
        };

        pipeline.start();

        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        if let Some(period) = config.keepalive_interval {
            tokio::spawn(keepalive_loop(
                backend.clone(),
                period,
                internal_tx.clone(),
                cancel.child_token(),
            ));
        }

        let (status_tx, status_rx) = watch::channel(SyncState::default());
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_CAPACITY);

        tracing::info!(
            roots = config.roots.len(),
            retention = config.retention,
            workers = config.max_parallel_uploads,
            watch = config.watch,
            "Engine starting"
        );

        let rescan_timer = config.rescan_interval.map(|period| {
            let mut timer = interval_at(Instant::now() + period, period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer
        });
        let classify = Arc::new(ClassifyContext {
            classifier,
            pipeline: pipeline.clone(),
            store: store.clone(),
            admission: KeyedLocks::new(),
        });
        let runner = Runner {
            permits: Arc::new(Semaphore::new(config.classify_concurrency.max(1))),
            store,
            backend,
            filter,
            versions,
            pipeline,
            restorer,
            classify,
            backlog: Backlog::default(),
            ready: false,
            classifying: 0,
            scan: None,
            next_scan_id: 0,
            queued_scan: None,
            conflicts_running: 0,
            gc_due: true,
            gc_running: false,
            run_id,
            session: SyncRunStats::default(),
            versions_committed: 0,
            failures: 0,
            last_error: None,
            scans_completed: 0,
            internal_tx,
            internal_rx,
            reports_rx,
            commands_rx,
            events_rx,
            dirty,
            watcher,
            rescan_timer,
            status_tx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(runner.run());

        Ok(EngineHandle {
            commands: commands_tx,
            status: status_rx,
            cancel,
            task,
        })
    }
}

/// Control surface of a running engine.
pub struct EngineHandle {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<SyncState>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// A sender for commands, for presentation layers that outlive `&self`.
    pub fn commands(&self) -> mpsc::Sender<Command> {
        self.commands.clone()
    }

    /// Send a command. Returns `false` if the engine has stopped.
    pub async fn send(&self, command: Command) -> bool {
        self.commands.send(command).await.is_ok()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.status.clone()
    }

    /// The latest published snapshot.
    pub fn status(&self) -> SyncState {
        self.status.borrow().clone()
    }

    /// Restore `version` of `file` through the engine.
    pub async fn restore(
        &self,
        file: FileRef,
        version: u64,
        destination: Option<PathBuf>,
    ) -> Result<RestoreOutcome, RestoreError> {
        let (reply, response) = oneshot::channel();
        let command = Command::Restore {
            file,
            version,
            destination,
            reply,
        };
        if !self.send(command).await {
            return Err(RestoreError::Stopped);
        }
        response.await.unwrap_or(Err(RestoreError::Stopped))
    }

    /// Stop the engine and wait for in-flight uploads to reach a chunk
    /// boundary.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            tracing::error!(error = %e, "Engine task panicked");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Live,
    Scan(u64),
}

#[derive(Debug, Clone)]
struct WorkItem {
    event: ChangeEvent,
    force: bool,
    origin: Origin,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ScanPhase {
    Walking,
    Present,
    Listing,
    Missing,
}

#[derive(Debug)]
struct ScanRun {
    id: u64,
    /// Own run record; the startup scan belongs to the session's run.
    run_id: Option<i64>,
    source: RunSource,
    force: bool,
    phase: ScanPhase,
    outstanding: usize,
    seen: Arc<HashSet<PathBuf>>,
    stats: SyncRunStats,
    started: Instant,
}

enum Internal {
    Requeued(Result<usize, StateError>),
    Walked {
        scan: u64,
        paths: Vec<PathBuf>,
    },
    Listed {
        scan: u64,
        paths: Result<Vec<PathBuf>, StateError>,
    },
    Classified {
        item: WorkItem,
        result: Result<Classification, ClassifyError>,
    },
    ConflictResolved {
        path: PathBuf,
        result: Result<Option<PathBuf>, RestoreError>,
    },
    RestoreFailed {
        file: FileRef,
        version: u64,
        failure: (String, ErrorClass),
    },
    Keepalive(Result<(), TransferError>),
    GarbageCollected(Result<usize, TransferError>),
}

/// What a classification task needs.
struct ClassifyContext {
    classifier: Classifier,
    pipeline: Arc<TransferPipeline>,
    store: Arc<dyn MetadataStore>,
    /// Held per path from classification until the resulting job is
    /// queued, so versions of one file enter the queue in allocation order.
    admission: KeyedLocks<PathBuf>,
}

impl ClassifyContext {
    async fn admit(&self, event: &ChangeEvent) -> Vec<KeyGuard> {
        let mut keys = vec![event.path.clone()];
        if let ChangeKind::Rename { from } = &event.kind {
            keys.push(from.clone());
        }
        keys.sort();
        keys.dedup();
        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            guards.push(self.admission.lock(key).await);
        }
        guards
    }

    async fn classify(&self, item: &WorkItem) -> Result<Classification, ClassifyError> {
        let _guards = self.admit(&item.event).await;
        let result = self.classifier.classify(&item.event, item.force).await;
        match &result {
            Ok(
                Classification::NewVersion(job)
                | Classification::Tombstone(job)
                | Classification::Verify(job),
            ) => {
                if !self.pipeline.enqueue(job.clone()).await {
                    tracing::debug!(path = %job.path.display(), "Pipeline stopped before enqueue");
                }
            }
            Err(e) => self.mark_failed(&item.event.path, e).await,
            Ok(_) => {}
        }
        result
    }

    async fn mark_failed(&self, path: &Path, error: &ClassifyError) {
        tracing::warn!(path = %path.display(), error = %error, "Failed to classify change");
        let tracked = match self.store.get(path).await {
            Ok(Some(tracked)) => tracked,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "Failed to look up file");
                return;
            }
        };
        let message = error.to_string();
        if let Err(e) = self
            .store
            .set_status(tracked.id, SyncStatus::Failed, Some(&message))
            .await
        {
            tracing::warn!(file_id = %tracked.id, error = %e, "Failed to record classification failure");
        }
    }
}

struct Runner {
    store: Arc<dyn MetadataStore>,
    backend: Arc<dyn Backend>,
    filter: Arc<PathFilter>,
    versions: Arc<VersionManager>,
    pipeline: Arc<TransferPipeline>,
    restorer: Arc<RestoreCoordinator>,
    classify: Arc<ClassifyContext>,
    permits: Arc<Semaphore>,

    backlog: Backlog,
    /// Pending versions from the previous run are queued.
    ready: bool,
    classifying: usize,
    scan: Option<ScanRun>,
    next_scan_id: u64,
    queued_scan: Option<(RunSource, bool)>,
    conflicts_running: usize,
    /// Versions were committed or dropped since the last collection.
    gc_due: bool,
    gc_running: bool,

    run_id: i64,
    session: SyncRunStats,
    versions_committed: u64,
    failures: u64,
    last_error: Option<(String, ErrorClass)>,
    scans_completed: u64,

    internal_tx: mpsc::UnboundedSender<Internal>,
    internal_rx: mpsc::UnboundedReceiver<Internal>,
    reports_rx: mpsc::UnboundedReceiver<JobReport>,
    commands_rx: mpsc::Receiver<Command>,
    events_rx: mpsc::Receiver<ChangeEvent>,
    dirty: DirtySet,
    watcher: Option<FsWatcher>,
    rescan_timer: Option<Interval>,
    status_tx: watch::Sender<SyncState>,
    cancel: CancellationToken,
}

impl Runner {
    async fn run(mut self) {
        self.spawn_requeue();

        loop {
            self.dispatch();
            self.maybe_collect_garbage();
            self.publish();

            tokio::select! {
                () = self.cancel.cancelled() => break,
                Some(message) = self.internal_rx.recv() => self.on_internal(message).await,
                Some(report) = self.reports_rx.recv() => self.on_report(report),
                Some(command) = self.commands_rx.recv() => self.on_command(command).await,
                Some(event) = self.events_rx.recv() => self.push_live(event),
                () = self.dirty.changed() => {
                    for path in self.dirty.drain() {
                        self.push_live(ChangeEvent::new(path, ChangeKind::Modify));
                    }
                }
                _ = tick(&mut self.rescan_timer) => self.begin_scan(RunSource::Scheduled, false).await,
            }
        }

        self.shutdown().await;
    }

    async fn shutdown(mut self) {
        tracing::info!("Engine stopping");
        self.pipeline.shutdown().await;
        while let Ok(report) = self.reports_rx.try_recv() {
            self.on_report(report);
        }
        if let Some(watcher) = self.watcher.take() {
            watcher.stop().await;
        }
        if let Some(scan) = self.scan.take() {
            if let Some(run_id) = scan.run_id {
                let mut stats = scan.stats;
                stats.interrupted = true;
                self.complete_run(run_id, &stats).await;
            }
        }
        let mut stats = std::mem::take(&mut self.session);
        stats.interrupted = true;
        self.complete_run(self.run_id, &stats).await;
        self.publish();
        tracing::info!(
            versions_committed = stats.versions_committed,
            failed = stats.files_failed,
            "Engine stopped"
        );
    }

    async fn complete_run(&self, run_id: i64, stats: &SyncRunStats) {
        if let Err(e) = self.store.complete_sync_run(run_id, stats).await {
            tracing::warn!(run_id, error = %e, "Failed to complete sync run");
        }
    }

    // ── Backlog and classification ──

    fn push_live(&mut self, event: ChangeEvent) {
        self.backlog.push_live(event);
    }

    fn dispatch(&mut self) {
        if !self.ready {
            return;
        }
        while !self.backlog.is_empty() {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                break;
            };
            let Some(item) = self.backlog.pop_front() else {
                break;
            };
            self.classifying += 1;
            tokio::spawn(classify_task(
                self.classify.clone(),
                item,
                permit,
                self.internal_tx.clone(),
            ));
        }
    }

    fn on_classified(&mut self, item: WorkItem, result: Result<Classification, ClassifyError>) {
        self.classifying = self.classifying.saturating_sub(1);
        match result {
            Ok(Classification::Expand(paths)) => {
                if let Some(scan) = self.current_scan(item.origin) {
                    scan.outstanding += paths.len();
                }
                for path in paths {
                    self.backlog.push(WorkItem {
                        event: ChangeEvent::new(path, ChangeKind::Modify),
                        force: item.force,
                        origin: item.origin,
                    });
                }
            }
            Ok(Classification::Renamed { file_id, from, to }) => {
                tracing::info!(
                    file_id = %file_id,
                    from = %from.display(),
                    to = %to.display(),
                    "Tracked file moved"
                );
            }
            Ok(Classification::NewVersion(job) | Classification::Tombstone(job)) => {
                tracing::debug!(
                    file_id = %job.file_id(),
                    path = %job.path.display(),
                    version = job.version.version,
                    tombstone = job.version.tombstone,
                    "New version allocated"
                );
            }
            Ok(_) => {}
            Err(e) => {
                self.record_failure(e.to_string(), e.class());
                if let Some(scan) = self.current_scan(item.origin) {
                    scan.stats.files_failed += 1;
                }
            }
        }
        if let Some(scan) = self.current_scan(item.origin) {
            scan.outstanding = scan.outstanding.saturating_sub(1);
        }
        if matches!(item.origin, Origin::Scan(_)) {
            self.advance_scan();
        }
    }

    fn record_failure(&mut self, message: String, class: ErrorClass) {
        self.failures += 1;
        self.session.files_failed += 1;
        self.last_error = Some((message, class));
    }

    // ── Startup and reconciliation scans ──

    fn spawn_requeue(&self) {
        let store = self.store.clone();
        let pipeline = self.pipeline.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = requeue_pending(store.as_ref(), &pipeline).await;
            let _ = tx.send(Internal::Requeued(result));
        });
    }

    fn current_scan(&mut self, origin: Origin) -> Option<&mut ScanRun> {
        match (origin, self.scan.as_mut()) {
            (Origin::Scan(id), Some(scan)) if scan.id == id => Some(scan),
            _ => None,
        }
    }

    async fn begin_scan(&mut self, source: RunSource, force: bool) {
        if self.scan.is_some() || !self.ready {
            let force = force || self.queued_scan.is_some_and(|(_, f)| f);
            self.queued_scan = Some((source, force));
            return;
        }
        let run_id = if source == RunSource::Realtime {
            None
        } else {
            match self.store.start_sync_run(source).await {
                Ok(id) => Some(id),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to record sync run");
                    None
                }
            }
        };
        self.next_scan_id += 1;
        let id = self.next_scan_id;
        tracing::info!(scan = id, source = source.as_str(), force, "Reconciliation scan started");
        self.scan = Some(ScanRun {
            id,
            run_id,
            source,
            force,
            phase: ScanPhase::Walking,
            outstanding: 0,
            seen: Arc::new(HashSet::new()),
            stats: SyncRunStats::default(),
            started: Instant::now(),
        });

        let filter = self.filter.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let paths = tokio::task::spawn_blocking(move || scan::walk_roots(&filter))
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(error = %e, "Scan walk panicked");
                    Vec::new()
                });
            let _ = tx.send(Internal::Walked { scan: id, paths });
        });
    }

    fn on_walked(&mut self, id: u64, paths: Vec<PathBuf>) {
        let Some(scan) = self.current_scan(Origin::Scan(id)) else {
            return;
        };
        let force = scan.force;
        scan.phase = ScanPhase::Present;
        scan.outstanding = paths.len();
        scan.stats.files_seen = paths.len() as u64;
        scan.seen = Arc::new(paths.iter().cloned().collect());
        self.session.files_seen += paths.len() as u64;
        tracing::debug!(scan = id, files = paths.len(), "Roots walked");
        for path in paths {
            self.backlog.push(WorkItem {
                event: ChangeEvent::new(path, ChangeKind::Modify),
                force,
                origin: Origin::Scan(id),
            });
        }
        self.advance_scan();
    }

    fn on_listed(&mut self, id: u64, paths: Result<Vec<PathBuf>, StateError>) {
        let paths = match paths {
            Ok(paths) => paths,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to list tracked files");
                self.record_failure(e.to_string(), ErrorClass::Io);
                Vec::new()
            }
        };
        let Some(scan) = self.current_scan(Origin::Scan(id)) else {
            return;
        };
        scan.phase = ScanPhase::Missing;
        scan.outstanding = paths.len();
        if !paths.is_empty() {
            tracing::debug!(scan = id, missing = paths.len(), "Tracked paths not found on disk");
        }
        for path in paths {
            self.backlog.push(WorkItem {
                event: ChangeEvent::new(path, ChangeKind::Delete),
                force: false,
                origin: Origin::Scan(id),
            });
        }
        self.advance_scan();
    }

    /// Move the current scan on once its phase has no outstanding items.
    fn advance_scan(&mut self) {
        let Some(scan) = self.scan.as_mut() else {
            return;
        };
        if scan.outstanding > 0 {
            return;
        }
        match scan.phase {
            ScanPhase::Walking | ScanPhase::Listing => {}
            ScanPhase::Present => {
                scan.phase = ScanPhase::Listing;
                let id = scan.id;
                let seen = scan.seen.clone();
                let store = self.store.clone();
                let filter = self.filter.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let paths = scan::unseen_tracked(store.as_ref(), &filter, &seen).await;
                    let _ = tx.send(Internal::Listed { scan: id, paths });
                });
            }
            ScanPhase::Missing => {
                let Some(scan) = self.scan.take() else {
                    return;
                };
                self.scans_completed += 1;
                tracing::info!(
                    scan = scan.id,
                    source = scan.source.as_str(),
                    files = scan.stats.files_seen,
                    failed = scan.stats.files_failed,
                    elapsed_ms = scan.started.elapsed().as_millis() as u64,
                    "Reconciliation scan finished"
                );
                if let Some(run_id) = scan.run_id {
                    let store = self.store.clone();
                    let stats = scan.stats;
                    tokio::spawn(async move {
                        if let Err(e) = store.complete_sync_run(run_id, &stats).await {
                            tracing::warn!(run_id, error = %e, "Failed to complete sync run");
                        }
                    });
                }
            }
        }
    }

    async fn start_queued_scan(&mut self) {
        if self.scan.is_none() {
            if let Some((source, force)) = self.queued_scan.take() {
                self.begin_scan(source, force).await;
            }
        }
    }

    // ── Messages ──

    async fn on_internal(&mut self, message: Internal) {
        match message {
            Internal::Requeued(result) => {
                match result {
                    Ok(count) if count > 0 => {
                        tracing::info!(count, "Re-queued pending versions from previous run");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to load pending versions");
                        self.record_failure(e.to_string(), ErrorClass::Io);
                    }
                }
                self.ready = true;
                self.begin_scan(RunSource::Realtime, false).await;
            }
            Internal::Walked { scan, paths } => self.on_walked(scan, paths),
            Internal::Listed { scan, paths } => self.on_listed(scan, paths),
            Internal::Classified { item, result } => self.on_classified(item, result),
            Internal::ConflictResolved { path, result } => {
                self.conflicts_running = self.conflicts_running.saturating_sub(1);
                match result {
                    Ok(copy) => {
                        self.last_error = Some((
                            format!("version conflict on {}", path.display()),
                            ErrorClass::Conflict,
                        ));
                        self.push_live(ChangeEvent::new(path, ChangeKind::Modify));
                        if let Some(copy) = copy {
                            self.push_live(ChangeEvent::new(copy, ChangeKind::Create));
                        }
                    }
                    Err(e) => {
                        tracing::error!(path = %path.display(), error = %e, "Failed to resolve conflict");
                        self.record_failure(e.to_string(), e.class());
                    }
                }
            }
            Internal::RestoreFailed {
                file,
                version,
                failure: (message, class),
            } => {
                // Caller errors (unknown file, tombstone) only go back on
                // the reply.
                if class.requires_attention() {
                    self.record_failure(
                        format!("restore of {file} v{version} failed: {message}"),
                        class,
                    );
                }
            }
            Internal::Keepalive(result) => match result {
                Ok(()) => tracing::trace!("Keepalive acknowledged"),
                Err(e) if e.class() == ErrorClass::Auth => {
                    if !self.pipeline.is_halted() {
                        tracing::error!(error = %e, "Backend rejected credentials, halting uploads");
                    }
                    self.pipeline.halt();
                    self.last_error = Some((e.to_string(), ErrorClass::Auth));
                }
                Err(e) => tracing::warn!(error = %e, "Keepalive failed"),
            },
            Internal::GarbageCollected(result) => {
                self.gc_running = false;
                if let Err(e) = result {
                    tracing::warn!(error = %e, "Garbage collection failed");
                }
            }
        }
        self.start_queued_scan().await;
    }

    fn on_report(&mut self, report: JobReport) {
        self.gc_due = true;
        match report.outcome {
            JobOutcome::Committed => {
                self.versions_committed += 1;
                self.session.versions_committed += 1;
                if let Some(scan) = self.scan.as_mut() {
                    scan.stats.versions_committed += 1;
                }
            }
            JobOutcome::Repaired => {
                tracing::info!(
                    file_id = %report.file_id,
                    version = report.version,
                    chunks = report.chunks_uploaded,
                    "Re-uploaded missing chunks"
                );
            }
            JobOutcome::Stale => {
                self.push_live(ChangeEvent::new(report.path, ChangeKind::Modify));
            }
            JobOutcome::Conflict { server_head } => {
                tracing::warn!(
                    file_id = %report.file_id,
                    path = %report.path.display(),
                    version = report.version,
                    ?server_head,
                    "Version conflict"
                );
                if !self.cancel.is_cancelled() {
                    self.spawn_conflict(report.file_id, report.path);
                }
            }
            JobOutcome::Failed { class, message } => {
                self.record_failure(message, class);
            }
            JobOutcome::AuthRejected { message } => {
                self.last_error = Some((message, ErrorClass::Auth));
            }
            JobOutcome::Paused | JobOutcome::Cancelled => {}
        }
    }

    fn spawn_conflict(&mut self, file_id: FileId, path: PathBuf) {
        self.conflicts_running += 1;
        let store = self.store.clone();
        let backend = self.backend.clone();
        let versions = self.versions.clone();
        let restorer = self.restorer.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let result = conflict::resolve(
                store.as_ref(),
                backend.as_ref(),
                &versions,
                &restorer,
                file_id,
                &path,
            )
            .await;
            let _ = tx.send(Internal::ConflictResolved { path, result });
        });
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Pause => {
                tracing::info!("Uploads paused");
                self.pipeline.pause();
            }
            Command::Resume => {
                tracing::info!("Uploads resumed");
                self.pipeline.resume();
            }
            Command::Restore {
                file,
                version,
                destination,
                reply,
            } => {
                let restorer = self.restorer.clone();
                let tx = self.internal_tx.clone();
                tokio::spawn(async move {
                    let result = restorer.restore(&file, version, destination).await;
                    if let Err(e) = &result {
                        tracing::warn!(file = %file, version, error = %e, "Restore failed");
                        let failure = (e.to_string(), e.class());
                        let _ = tx.send(Internal::RestoreFailed {
                            file,
                            version,
                            failure,
                        });
                    }
                    let _ = reply.send(result);
                });
            }
            Command::Rescan { force } => self.begin_scan(RunSource::User, force).await,
            Command::RetryFailed => match self.store.reset_failed().await {
                Ok(paths) => {
                    tracing::info!(count = paths.len(), "Retrying failed files");
                    for path in paths {
                        self.push_live(ChangeEvent::new(path, ChangeKind::Modify));
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Failed to reset failed files");
                    self.record_failure(e.to_string(), ErrorClass::Io);
                }
            },
            Command::ClearError => {
                tracing::info!("Error cleared, resuming transfers");
                self.pipeline.clear_halt();
                self.last_error = None;
            }
        }
    }

    // ── Garbage collection and status ──

    fn busy(&self) -> bool {
        !self.backlog.is_empty()
            || self.classifying > 0
            || self.conflicts_running > 0
            || !self.dirty.is_empty()
            || !self.pipeline.is_idle()
    }

    fn maybe_collect_garbage(&mut self) {
        if !self.gc_due || self.gc_running || !self.ready || self.scan.is_some() || self.busy() {
            return;
        }
        if self.pipeline.is_halted() || self.cancel.is_cancelled() {
            return;
        }
        self.gc_due = false;
        self.gc_running = true;
        let pipeline = self.pipeline.clone();
        let restorer = self.restorer.clone();
        let tx = self.internal_tx.clone();
        tokio::spawn(async move {
            let mut total = 0;
            let result = loop {
                match pipeline.collect_garbage(GC_BATCH).await {
                    Ok(deleted) if deleted.is_empty() => break Ok(total),
                    Ok(deleted) => {
                        total += deleted.len();
                        restorer.evict_cached(&deleted).await;
                    }
                    Err(e) => break Err(e),
                }
            };
            let _ = tx.send(Internal::GarbageCollected(result));
        });
    }

    fn publish(&self) {
        let depth = self.pipeline.depth();
        let activity = Activity {
            halted: self.pipeline.is_halted(),
            paused: self.pipeline.is_paused(),
            scanning: self.scan.is_some() || !self.ready,
            busy: self.busy() || self.gc_running,
        };
        let next = SyncState {
            state: activity.state(),
            pending_events: self.backlog.len() + self.dirty.len(),
            classifying: self.classifying,
            uploads_queued: depth.queued,
            uploads_in_flight: depth.in_flight,
            versions_committed: self.versions_committed,
            failures: self.failures,
            last_error: self.last_error.as_ref().map(|(m, _)| m.clone()),
            last_error_class: self.last_error.as_ref().map(|(_, c)| *c),
            rescan_pending: self.queued_scan.is_some(),
            scans_completed: self.scans_completed,
            collecting_garbage: self.gc_running,
        };
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn classify_task(
    ctx: Arc<ClassifyContext>,
    item: WorkItem,
    _permit: OwnedSemaphorePermit,
    tx: mpsc::UnboundedSender<Internal>,
) {
    let result = ctx.classify(&item).await;
    let _ = tx.send(Internal::Classified { item, result });
}

/// Queue the pending versions a previous run left behind, oldest first.
async fn requeue_pending(
    store: &dyn MetadataStore,
    pipeline: &TransferPipeline,
) -> Result<usize, StateError> {
    let mut queued = 0;
    for version in store.pending_versions().await? {
        let Some(file) = store.get_by_id(version.file_id).await? else {
            continue;
        };
        if !pipeline.enqueue(UploadJob::commit(file.path, version)).await {
            break;
        }
        queued += 1;
    }
    Ok(queued)
}

async fn keepalive_loop(
    backend: Arc<dyn Backend>,
    period: Duration,
    tx: mpsc::UnboundedSender<Internal>,
    cancel: CancellationToken,
) {
    let mut timer = interval_at(Instant::now() + period, period);
    timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            _ = timer.tick() => {
                let result = tokio::select! {
                    () = cancel.cancelled() => break,
                    result = backend.keepalive() => result,
                };
                if tx.send(Internal::Keepalive(result)).is_err() {
                    break;
                }
            }
        }
    }
}

async fn tick(timer: &mut Option<Interval>) -> Instant {
    match timer {
        Some(timer) => timer.tick().await,
        None => std::future::pending().await,
    }
}
