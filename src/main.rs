//! stormcloud — continuous, versioned backup of local folders.
//!
//! `run` starts the engine and keeps it running until a signal arrives (or,
//! with `--once`, until the first scan has been uploaded). The other
//! subcommands inspect or repair the state database.

#![warn(clippy::all)]

mod cli;
mod shutdown;
mod systemd;
mod types;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use stormcloud::config::{default_settings_path, EngineConfig, Settings, WatchRoot};
use stormcloud::restore::{FileRef, RestoreCoordinator};
use stormcloud::state::{
    FileVersion, MetadataStore, SqliteMetadataStore, SyncStatus, TrackedFile, VersionState,
};
use stormcloud::transfer::{ChunkCipher, HttpBackend};
use stormcloud::{Command as EngineCommand, Engine, EngineHandle, EngineState, SyncState};

use cli::Command;
use types::OutputFormat;

/// Everything a subcommand needs from the command line and settings file.
struct App {
    settings: Settings,
}

impl App {
    fn load(cli: &cli::Cli) -> anyhow::Result<Self> {
        let path = cli.config.clone().unwrap_or_else(default_settings_path);
        let mut settings = Settings::load(&path)?;
        if let Some(dir) = &cli.state_dir {
            settings.state_dir = Some(dir.clone());
        }
        Ok(Self { settings })
    }

    fn state_dir(&self) -> PathBuf {
        self.settings.resolved_state_dir()
    }

    fn database_path(&self) -> PathBuf {
        EngineConfig::new(Vec::new(), self.state_dir()).database_path()
    }

    /// Open the store read-only-ish, or explain that nothing has run yet.
    async fn inspect_store(&self) -> anyhow::Result<Option<SqliteMetadataStore>> {
        let path = self.database_path();
        if !path.exists() {
            println!("No state database found at {}", path.display());
            println!("Run `stormcloud run` first to create it.");
            return Ok(None);
        }
        Ok(Some(SqliteMetadataStore::open_unlocked(&path).await?))
    }

    /// Store, backend and cipher for commands that talk to the backend.
    async fn open_backend(
        &self,
        config: &EngineConfig,
    ) -> anyhow::Result<(Arc<SqliteMetadataStore>, Arc<HttpBackend>, ChunkCipher)> {
        std::fs::create_dir_all(&config.state_dir).with_context(|| {
            format!(
                "Failed to create state directory {}",
                config.state_dir.display()
            )
        })?;
        let backend_config = self.settings.backend_config()?;
        let store = SqliteMetadataStore::open(&config.database_path())
            .await
            .context("Failed to open the state database (is another engine running?)")?;
        let backend = HttpBackend::new(&backend_config)?;
        let cipher = ChunkCipher::from_secret(&backend_config.account_secret)?;
        Ok((Arc::new(store), Arc::new(backend), cipher))
    }

    /// Start an engine that only scans (no watcher), for maintenance runs.
    async fn start_engine(&self, watch: bool) -> anyhow::Result<EngineHandle> {
        let mut config = self.settings.engine_config()?;
        config.watch = watch;
        if config.roots.is_empty() {
            anyhow::bail!("No roots configured; add `[[roots]]` to the settings file or pass --root");
        }
        let (store, backend, cipher) = self.open_backend(&config).await?;
        Engine::new(config, store, backend, cipher).start().await
    }
}

fn apply_run_overrides(settings: &mut Settings, args: &cli::RunArgs) -> anyhow::Result<()> {
    for root in &args.roots {
        let path = std::path::absolute(root)
            .with_context(|| format!("Invalid root {}", root.display()))?;
        settings.roots.push(WatchRoot {
            path,
            recursive: true,
        });
    }
    if let Some(n) = args.max_parallel_uploads {
        settings.max_parallel_uploads = n;
    }
    if let Some(kbps) = args.bandwidth_limit_kbps {
        settings.bandwidth_limit_kbps = kbps;
    }
    if let Some(retention) = args.retention {
        settings.retention = retention;
    }
    Ok(())
}

/// Wait until `done` holds for a snapshot, or until shutdown. Returns the
/// last snapshot seen.
async fn wait_until(
    status: &mut watch::Receiver<SyncState>,
    shutdown: &CancellationToken,
    notifier: systemd::SystemdNotifier,
    done: impl Fn(&SyncState) -> bool,
) -> SyncState {
    let mut last_state = None;
    loop {
        let snapshot = status.borrow_and_update().clone();
        notifier.notify_sync_state(&snapshot);
        if last_state != Some(snapshot.state) {
            tracing::debug!(
                state = %snapshot.state,
                queued = snapshot.uploads_queued,
                committed = snapshot.versions_committed,
                "Engine state changed"
            );
            last_state = Some(snapshot.state);
        }
        if done(&snapshot) {
            return snapshot;
        }
        tokio::select! {
            _ = shutdown.cancelled() => return snapshot,
            changed = status.changed() => {
                if changed.is_err() {
                    return snapshot;
                }
            }
        }
    }
}

/// Settled after `scans` completed scans: nothing left to do, or stuck on
/// an error that needs attention.
fn settled(snapshot: &SyncState, scans: u64) -> bool {
    snapshot.scans_completed >= scans
        && matches!(snapshot.state, EngineState::Idle | EngineState::Error)
}

fn report_outcome(snapshot: &SyncState) -> anyhow::Result<()> {
    tracing::info!(
        committed = snapshot.versions_committed,
        failed = snapshot.failures,
        "Stopped"
    );
    if let Some(error) = &snapshot.last_error {
        anyhow::bail!("Backup stopped on error: {error}");
    }
    if snapshot.failures > 0 {
        anyhow::bail!(
            "{} file(s) failed to upload; see `stormcloud status --failed`",
            snapshot.failures
        );
    }
    Ok(())
}

async fn run_engine(mut ctx: App, args: cli::RunArgs) -> anyhow::Result<()> {
    apply_run_overrides(&mut ctx.settings, &args)?;
    let shutdown = shutdown::install_signal_handler()?;
    let notifier = systemd::SystemdNotifier::new(args.notify_systemd);

    let handle = ctx.start_engine(!args.once).await?;
    tracing::info!(
        roots = ctx.settings.roots.len(),
        once = args.once,
        "Engine started"
    );
    notifier.notify_ready();

    let mut status = handle.subscribe();
    let once = args.once;
    let last = wait_until(&mut status, &shutdown, notifier, |s| once && settled(s, 1)).await;

    notifier.notify_stopping();
    handle.stop().await;
    if once {
        report_outcome(&last)
    } else {
        Ok(())
    }
}

/// Start a scanning engine, send `command` once the startup scan settles and
/// wait for the follow-up scan to finish.
async fn run_maintenance(ctx: App, command: EngineCommand) -> anyhow::Result<()> {
    let shutdown = shutdown::install_signal_handler()?;
    let notifier = systemd::SystemdNotifier::new(false);
    let handle = ctx.start_engine(false).await?;
    let mut status = handle.subscribe();

    let first = wait_until(&mut status, &shutdown, notifier, |s| settled(s, 1)).await;
    let mut last = first.clone();
    if !shutdown.is_cancelled() && first.state != EngineState::Error {
        let follow_up = !matches!(command, EngineCommand::Rescan { .. });
        if handle.send(command).await
            && (!follow_up || handle.send(EngineCommand::Rescan { force: false }).await)
        {
            let target = first.scans_completed + 1;
            last = wait_until(&mut status, &shutdown, notifier, |s| settled(s, target)).await;
        }
    }

    handle.stop().await;
    report_outcome(&last)
}

async fn resolve_file(store: &dyn MetadataStore, arg: &str) -> anyhow::Result<TrackedFile> {
    let found = match FileRef::parse(arg) {
        FileRef::Id(id) => store.get_by_id(id).await?,
        FileRef::Path(path) => {
            let path = std::path::absolute(&path).unwrap_or(path);
            store.get(&path).await?
        }
    };
    found.ok_or_else(|| anyhow::anyhow!("Not a tracked file: {arg}"))
}

fn version_json(v: &FileVersion) -> serde_json::Value {
    serde_json::json!({
        "version": v.version,
        "state": v.state,
        "tombstone": v.tombstone,
        "size_bytes": v.size_bytes,
        "fingerprint": v.fingerprint,
        "chunks": v.manifest.len(),
        "created_at": v.created_at,
    })
}

async fn run_status(ctx: App, args: cli::StatusArgs) -> anyhow::Result<()> {
    let Some(store) = ctx.inspect_store().await? else {
        return Ok(());
    };
    let summary = store.summary().await?;
    let runs = store.recent_runs(5).await?;
    let failed: Vec<TrackedFile> = if args.failed {
        store
            .all_files()
            .await?
            .into_iter()
            .filter(|f| f.status == SyncStatus::Failed)
            .collect()
    } else {
        Vec::new()
    };

    if args.format == OutputFormat::Json {
        let recent_runs: Vec<serde_json::Value> = runs
            .iter()
            .map(|r| {
                serde_json::json!({
                    "id": r.id,
                    "source": r.source,
                    "started_at": r.started_at,
                    "completed_at": r.completed_at,
                    "files_seen": r.stats.files_seen,
                    "versions_committed": r.stats.versions_committed,
                    "files_failed": r.stats.files_failed,
                    "interrupted": r.stats.interrupted,
                })
            })
            .collect();
        let failed_files: Vec<serde_json::Value> = failed
            .iter()
            .map(|f| {
                serde_json::json!({
                    "file_id": f.id,
                    "path": f.path,
                    "error": f.last_error,
                })
            })
            .collect();
        let value = serde_json::json!({
            "database": ctx.database_path(),
            "files": {
                "total": summary.total_files,
                "clean": summary.clean,
                "pending": summary.pending,
                "failed": summary.failed,
                "conflicts": summary.conflicts,
                "deleted": summary.deleted,
            },
            "versions": {
                "committed": summary.committed_versions,
                "pending": summary.pending_versions,
            },
            "chunks": {
                "known": summary.known_chunks,
                "gc_queued": summary.gc_queued,
            },
            "last_sync_started": summary.last_sync_started,
            "last_sync_completed": summary.last_sync_completed,
            "recent_runs": recent_runs,
            "failed_files": failed_files,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("State database: {}", ctx.database_path().display());
    println!();
    println!("Files:");
    println!("  Total:     {}", summary.total_files);
    println!("  Clean:     {}", summary.clean);
    println!("  Pending:   {}", summary.pending);
    println!("  Failed:    {}", summary.failed);
    println!("  Conflicts: {}", summary.conflicts);
    println!("  Deleted:   {}", summary.deleted);
    println!();
    println!(
        "Versions: {} committed, {} pending",
        summary.committed_versions, summary.pending_versions
    );
    println!(
        "Chunks:   {} known, {} queued for deletion",
        summary.known_chunks, summary.gc_queued
    );

    if !runs.is_empty() {
        println!();
        println!("Recent runs:");
        for run in &runs {
            let end = match (&run.completed_at, run.stats.interrupted) {
                (Some(at), false) => at.format("%Y-%m-%d %H:%M:%S UTC").to_string(),
                (Some(at), true) => format!("{} (interrupted)", at.format("%Y-%m-%d %H:%M:%S UTC")),
                (None, _) => "running".to_string(),
            };
            println!(
                "  #{} {:<9} {} -> {}: {} seen, {} committed, {} failed",
                run.id,
                run.source.as_str(),
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
                end,
                run.stats.files_seen,
                run.stats.versions_committed,
                run.stats.files_failed
            );
        }
    }

    if args.failed {
        println!();
        if failed.is_empty() {
            println!("No failed files.");
        } else {
            println!("Failed files:");
            for file in &failed {
                println!(
                    "  {} ({}) - {}",
                    file.path.display(),
                    file.id,
                    file.last_error.as_deref().unwrap_or("unknown error")
                );
            }
        }
    }
    Ok(())
}

async fn run_versions(ctx: App, args: cli::VersionsArgs) -> anyhow::Result<()> {
    let Some(store) = ctx.inspect_store().await? else {
        return Ok(());
    };
    let file = resolve_file(&store, &args.file).await?;
    let versions = store.list_versions(file.id).await?;

    if args.format == OutputFormat::Json {
        let version_list: Vec<serde_json::Value> = versions.iter().map(version_json).collect();
        let value = serde_json::json!({
            "file_id": file.id,
            "path": file.path,
            "status": file.status,
            "versions": version_list,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
        return Ok(());
    }

    println!("{} ({})", file.path.display(), file.id);
    if versions.is_empty() {
        println!("  No versions recorded.");
    }
    for v in &versions {
        let what = if v.tombstone {
            "deleted".to_string()
        } else {
            format!("{} bytes, {} chunk(s)", v.size_bytes, v.manifest.len())
        };
        println!(
            "  v{:<4} {:<9} {}  {}  {}",
            v.version,
            v.state.as_str(),
            v.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
            v.fingerprint.short(),
            what
        );
    }
    Ok(())
}

/// Newest committed version that has content to restore.
fn latest_restorable(versions: &[FileVersion]) -> Option<u64> {
    versions
        .iter()
        .filter(|v| v.state == VersionState::Committed && !v.tombstone)
        .map(|v| v.version)
        .max()
}

async fn run_restore(ctx: App, args: cli::RestoreArgs) -> anyhow::Result<()> {
    let config = ctx.settings.engine_config()?;
    let (store, backend, cipher) = ctx.open_backend(&config).await?;
    let file = resolve_file(store.as_ref(), &args.file).await?;
    let version = match args.version {
        Some(v) => v,
        None => latest_restorable(&store.list_versions(file.id).await?).ok_or_else(|| {
            anyhow::anyhow!("{} has no committed content to restore", file.path.display())
        })?,
    };

    let shutdown = shutdown::install_signal_handler()?;
    let restorer = RestoreCoordinator::new(
        store,
        backend,
        Arc::new(cipher),
        config.chunk_cache_dir(),
        config.retry,
        shutdown,
    );
    let outcome = restorer
        .restore(&FileRef::Id(file.id), version, args.output)
        .await?;
    println!(
        "Restored version {} of {} to {} ({} bytes, {} chunk(s) downloaded)",
        outcome.version,
        file.path.display(),
        outcome.path.display(),
        outcome.bytes,
        outcome.chunks_downloaded
    );
    Ok(())
}

fn confirm(prompt: &str) -> anyhow::Result<bool> {
    use std::io::Write;
    print!("{prompt} [y/N] ");
    std::io::stdout().flush()?;
    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

fn remove_if_present(path: &Path) -> anyhow::Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
    }
}

async fn run_reset_state(ctx: App, args: cli::ResetStateArgs) -> anyhow::Result<()> {
    let db_path = ctx.database_path();
    if !db_path.exists() {
        println!("No state database found at {}", db_path.display());
        return Ok(());
    }

    if !args.yes {
        println!("This will delete the state database and chunk cache at:");
        println!("  {}", ctx.state_dir().display());
        println!("Every file will be re-uploaded as a new history on the next run.");
        println!();
        if !confirm("Are you sure?")? {
            println!("Cancelled.");
            return Ok(());
        }
    }

    // Taking the instance lock proves no engine is using the store.
    let store = SqliteMetadataStore::open(&db_path)
        .await
        .context("The state database is in use; stop the engine first")?;
    drop(store);

    remove_if_present(&db_path)?;
    remove_if_present(&db_path.with_extension("db-wal"))?;
    remove_if_present(&db_path.with_extension("db-shm"))?;
    remove_if_present(&db_path.with_extension("lock"))?;
    let cache = EngineConfig::new(Vec::new(), ctx.state_dir()).chunk_cache_dir();
    if cache.exists() {
        std::fs::remove_dir_all(&cache)
            .with_context(|| format!("Failed to delete {}", cache.display()))?;
    }
    println!("State deleted.");
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = cli::Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(cli.log_level.directive())),
        )
        .init();

    let ctx = App::load(&cli)?;
    match cli.command {
        Command::Run(args) => run_engine(ctx, args).await,
        Command::Status(args) => run_status(ctx, args).await,
        Command::Versions(args) => run_versions(ctx, args).await,
        Command::Restore(args) => run_restore(ctx, args).await,
        Command::RetryFailed => run_maintenance(ctx, EngineCommand::RetryFailed).await,
        Command::Verify => run_maintenance(ctx, EngineCommand::Rescan { force: true }).await,
        Command::ResetState(args) => run_reset_state(ctx, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use stormcloud::state::{FileId, Fingerprint};

    fn version(n: u64, state: VersionState, tombstone: bool) -> FileVersion {
        FileVersion {
            file_id: FileId::new(),
            version: n,
            fingerprint: Fingerprint::of(&n.to_le_bytes()),
            size_bytes: 1,
            created_at: Utc::now(),
            manifest: Vec::new(),
            tombstone,
            state,
        }
    }

    #[test]
    fn test_latest_restorable_skips_tombstones_and_pending() {
        let versions = vec![
            version(1, VersionState::Committed, false),
            version(2, VersionState::Committed, false),
            version(3, VersionState::Committed, true),
            version(4, VersionState::Pending, false),
        ];
        assert_eq!(latest_restorable(&versions), Some(2));
        assert_eq!(latest_restorable(&versions[2..]), None);
    }

    #[test]
    fn test_settled_needs_scan_and_quiet_engine() {
        let mut s = SyncState::default();
        assert!(!settled(&s, 1));
        s.scans_completed = 1;
        assert!(settled(&s, 1));
        s.state = EngineState::Syncing;
        assert!(!settled(&s, 1));
        s.state = EngineState::Error;
        assert!(settled(&s, 1));
        assert!(!settled(&s, 2));
    }

    #[test]
    fn test_run_overrides() {
        let mut settings = Settings::default();
        let args = cli::RunArgs {
            roots: vec![PathBuf::from("/data/docs")],
            max_parallel_uploads: Some(2),
            retention: Some(5),
            ..cli::RunArgs::default()
        };
        apply_run_overrides(&mut settings, &args).unwrap();
        assert_eq!(
            settings.roots,
            vec![WatchRoot {
                path: PathBuf::from("/data/docs"),
                recursive: true
            }]
        );
        assert_eq!(settings.max_parallel_uploads, 2);
        assert_eq!(settings.retention, 5);
    }

    #[test]
    fn test_report_outcome() {
        assert!(report_outcome(&SyncState::default()).is_ok());
        let failed = SyncState {
            failures: 1,
            ..SyncState::default()
        };
        assert!(report_outcome(&failed).is_err());
    }
}
