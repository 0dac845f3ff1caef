//! Filesystem watcher.
//!
//! Turns raw `notify` events into debounced [`ChangeEvent`]s. The `notify`
//! callback never blocks: it hands events to a bounded channel and, when
//! that channel is full, records the path in the shared [`DirtySet`] so a
//! later rescan picks it up.

pub mod debounce;
pub mod event;
pub mod filter;

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use notify::event::{ModifyKind, RenameMode};
use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

pub use debounce::{Admit, Debouncer};
pub use event::{ChangeEvent, ChangeKind};
pub use filter::PathFilter;

const TICK: Duration = Duration::from_millis(100);

/// Paths that need a rescan because their events could not be delivered.
/// Shared between the watcher and the orchestrator.
#[derive(Debug, Clone, Default)]
pub struct DirtySet {
    inner: Arc<DirtyInner>,
}

#[derive(Debug, Default)]
struct DirtyInner {
    paths: Mutex<HashSet<PathBuf>>,
    wake: Notify,
}

impl DirtySet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, path: PathBuf) {
        self.inner
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path);
        self.inner.wake.notify_one();
    }

    pub fn extend(&self, paths: impl IntoIterator<Item = PathBuf>) {
        let mut guard = self
            .inner
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = guard.len();
        guard.extend(paths);
        if guard.len() != before {
            self.inner.wake.notify_one();
        }
    }

    /// Take every recorded path, sorted.
    pub fn drain(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self
            .inner
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        paths.sort();
        paths
    }

    pub fn len(&self) -> usize {
        self.inner
            .paths
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once a path has been recorded since the last wake.
    pub async fn changed(&self) {
        self.inner.wake.notified().await;
    }
}

/// Translate one `notify` event into change events.
///
/// Directory events pass through; the consumer expands them.
pub fn translate(event: &Event) -> Vec<ChangeEvent> {
    let now = chrono::Utc::now();
    let make = |path: &Path, kind: ChangeKind| ChangeEvent {
        path: path.to_path_buf(),
        kind,
        timestamp: now,
    };
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| make(p, ChangeKind::Create))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| make(p, ChangeKind::Delete))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
            vec![make(
                &event.paths[1],
                ChangeKind::Rename {
                    from: event.paths[0].clone(),
                },
            )]
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => event
            .paths
            .iter()
            .map(|p| make(p, ChangeKind::Delete))
            .collect(),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => event
            .paths
            .iter()
            .map(|p| make(p, ChangeKind::Create))
            .collect(),
        EventKind::Modify(ModifyKind::Name(_)) => event
            .paths
            .iter()
            .map(|p| {
                let kind = if p.exists() {
                    ChangeKind::Modify
                } else {
                    ChangeKind::Delete
                };
                make(p, kind)
            })
            .collect(),
        // Permission and timestamp changes leave content alone
        EventKind::Modify(ModifyKind::Metadata(_)) => Vec::new(),
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| make(p, ChangeKind::Modify))
            .collect(),
        EventKind::Access(_) | EventKind::Any | EventKind::Other => Vec::new(),
    }
}

/// Settings for a running watcher.
#[derive(Debug, Clone)]
pub struct WatchSettings {
    pub debounce: Duration,
    /// Bound of the raw event channel and the debounce map.
    pub capacity: usize,
}

/// A running filesystem watcher. Dropping it stops `notify`; the debounce
/// task exits when the cancel token fires.
pub struct FsWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl std::fmt::Debug for FsWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FsWatcher").finish_non_exhaustive()
    }
}

impl FsWatcher {
    /// Start watching the filter's roots, delivering debounced events to `out`.
    pub fn spawn(
        filter: Arc<PathFilter>,
        settings: WatchSettings,
        out: mpsc::Sender<ChangeEvent>,
        dirty: DirtySet,
        cancel: CancellationToken,
    ) -> Result<Self, notify::Error> {
        let (raw_tx, raw_rx) = mpsc::channel::<ChangeEvent>(settings.capacity.max(1));

        let callback_filter = Arc::clone(&filter);
        let callback_dirty = dirty.clone();
        let mut watcher = RecommendedWatcher::new(
            move |result: notify::Result<Event>| match result {
                Ok(event) => {
                    for change in translate(&event) {
                        if !accepts_event(&callback_filter, &change) {
                            continue;
                        }
                        if let Err(err) = raw_tx.try_send(change) {
                            let change = match err {
                                mpsc::error::TrySendError::Full(c)
                                | mpsc::error::TrySendError::Closed(c) => c,
                            };
                            callback_dirty.insert(change.path);
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Filesystem watcher error");
                    // Events may have been lost; a rescan of every root
                    // recovers them.
                    callback_dirty.extend(e.paths);
                }
            },
            Config::default(),
        )?;

        for root in filter.roots() {
            let mode = if root.recursive {
                RecursiveMode::Recursive
            } else {
                RecursiveMode::NonRecursive
            };
            match watcher.watch(&root.path, mode) {
                Ok(()) => tracing::debug!(root = %root.path.display(), ?mode, "Watching root"),
                Err(e) => {
                    tracing::warn!(root = %root.path.display(), error = %e, "Cannot watch root");
                }
            }
        }

        let task = tokio::spawn(debounce_loop(raw_rx, settings, out, dirty, cancel));

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }

    /// Stop the watcher and wait for the debounce task to exit.
    pub async fn stop(self) {
        let Self { _watcher, task } = self;
        drop(_watcher);
        task.abort();
        let _ = task.await;
    }
}

fn accepts_event(filter: &PathFilter, change: &ChangeEvent) -> bool {
    if filter.accepts(&change.path) {
        return true;
    }
    // Moving a tracked file out of the backup set reads as its deletion.
    matches!(&change.kind, ChangeKind::Rename { from } if filter.accepts(from))
}

async fn debounce_loop(
    mut raw_rx: mpsc::Receiver<ChangeEvent>,
    settings: WatchSettings,
    out: mpsc::Sender<ChangeEvent>,
    dirty: DirtySet,
    cancel: CancellationToken,
) {
    let mut debouncer = Debouncer::new(settings.debounce, settings.capacity);
    let mut tick = interval_at(Instant::now() + TICK, TICK);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = raw_rx.recv() => {
                let Some(change) = received else { break };
                if let Admit::Overflow(path) = debouncer.push(change, Instant::now().into_std()) {
                    tracing::debug!(path = %path.display(), "Debounce map full, deferring to rescan");
                    dirty.insert(path);
                }
            }
            _ = tick.tick() => {
                let now = Instant::now().into_std();
                for change in debouncer.drain_ready(now) {
                    match out.try_send(change) {
                        Ok(()) => {}
                        // Consumer is behind; hold the event for the next tick
                        Err(mpsc::error::TrySendError::Full(change)) => {
                            debouncer.requeue(change, now);
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    fn event(kind: EventKind, paths: &[&str]) -> Event {
        let mut event = Event::new(kind);
        for p in paths {
            event = event.add_path(PathBuf::from(p));
        }
        event
    }

    #[test]
    fn test_translate_basic_kinds() {
        let created = translate(&event(EventKind::Create(CreateKind::File), &["/a"]));
        assert_eq!(created[0].kind, ChangeKind::Create);

        let modified = translate(&event(
            EventKind::Modify(ModifyKind::Data(DataChange::Content)),
            &["/a"],
        ));
        assert_eq!(modified[0].kind, ChangeKind::Modify);

        let removed = translate(&event(EventKind::Remove(RemoveKind::File), &["/a"]));
        assert_eq!(removed[0].kind, ChangeKind::Delete);
    }

    #[test]
    fn test_translate_rename_pair() {
        let renamed = translate(&event(
            EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            &["/old", "/new"],
        ));
        assert_eq!(renamed.len(), 1);
        assert_eq!(renamed[0].path, PathBuf::from("/new"));
        assert_eq!(
            renamed[0].kind,
            ChangeKind::Rename {
                from: PathBuf::from("/old")
            }
        );
    }

    #[test]
    fn test_translate_ignores_metadata_and_access() {
        assert!(translate(&event(
            EventKind::Modify(ModifyKind::Metadata(MetadataKind::Permissions)),
            &["/a"],
        ))
        .is_empty());
        assert!(translate(&event(EventKind::Any, &["/a"])).is_empty());
    }

    #[test]
    fn test_dirty_set_drains_sorted() {
        let dirty = DirtySet::new();
        dirty.insert(PathBuf::from("/b"));
        dirty.extend([PathBuf::from("/a"), PathBuf::from("/b")]);
        assert_eq!(dirty.len(), 2);
        assert_eq!(dirty.drain(), vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(dirty.is_empty());
    }

    #[tokio::test]
    async fn test_watcher_delivers_debounced_event() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().canonicalize().unwrap();
        let filter = Arc::new(
            PathFilter::new(
                vec![crate::config::WatchRoot {
                    path: root.clone(),
                    recursive: true,
                }],
                &[],
                Vec::new(),
            )
            .unwrap(),
        );
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let watcher = FsWatcher::spawn(
            filter,
            WatchSettings {
                debounce: Duration::from_millis(200),
                capacity: 64,
            },
            tx,
            DirtySet::new(),
            cancel.clone(),
        )
        .unwrap();

        let file = root.join("note.txt");
        for i in 0..5 {
            std::fs::write(&file, format!("draft {i}")).unwrap();
        }

        let change = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(change.path, file);

        // The burst collapses: nothing else arrives for the same path soon after
        let extra = tokio::time::timeout(Duration::from_millis(500), rx.recv()).await;
        assert!(extra.is_err() || extra.unwrap().map(|c| c.path) != Some(file.clone()));

        cancel.cancel();
        watcher.stop().await;
    }
}
