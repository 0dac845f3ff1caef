use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

use crate::types::*;

#[derive(Parser, Debug)]
#[command(
    name = "stormcloud",
    version,
    about = "Continuous, versioned backup of local folders"
)]
pub struct Cli {
    /// Settings file (default: ~/.config/stormcloud/config.toml)
    #[arg(short = 'c', long, env = "STORMCLOUD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Directory for the state database and chunk cache
    #[arg(long, env = "STORMCLOUD_STATE_DIR", global = true)]
    pub state_dir: Option<String>,

    /// Log level (RUST_LOG takes precedence)
    #[arg(long, value_enum, default_value = "info", global = true)]
    pub log_level: LogLevel,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Watch the configured roots and back up every change until stopped
    Run(RunArgs),

    /// Show the state database summary and recent runs
    Status(StatusArgs),

    /// List the versions of a tracked file
    Versions(VersionsArgs),

    /// Restore a version of a tracked file
    Restore(RestoreArgs),

    /// Reset failed files to pending and back them up again
    RetryFailed,

    /// Re-verify every committed file against the backend and re-upload
    /// missing chunks
    Verify,

    /// Delete the state database and chunk cache
    ResetState(ResetStateArgs),
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Directory to back up, in addition to the configured roots
    /// (repeatable)
    #[arg(long = "root")]
    pub roots: Vec<PathBuf>,

    /// Maximum concurrent uploads
    #[arg(long)]
    pub max_parallel_uploads: Option<usize>,

    /// Upload bandwidth limit in KiB/s (0 disables the limit)
    #[arg(long)]
    pub bandwidth_limit_kbps: Option<u32>,

    /// Versions kept per file
    #[arg(long)]
    pub retention: Option<u32>,

    /// Scan once, upload, and exit instead of watching
    #[arg(long)]
    pub once: bool,

    /// Send readiness and status notifications to systemd
    #[arg(long)]
    pub notify_systemd: bool,
}

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// List files whose last upload failed
    #[arg(long)]
    pub failed: bool,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct VersionsArgs {
    /// File id or tracked path
    pub file: String,

    /// Output format
    #[arg(long, value_enum, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct RestoreArgs {
    /// File id or tracked path
    pub file: String,

    /// Version to restore (default: latest committed content)
    pub version: Option<u64>,

    /// Write here instead of over the tracked path
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct ResetStateArgs {
    /// Skip the confirmation prompt
    #[arg(long)]
    pub yes: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_restore() {
        let cli = Cli::try_parse_from([
            "stormcloud",
            "--log-level",
            "debug",
            "restore",
            "/data/report.doc",
            "2",
            "-o",
            "/tmp/report.doc",
        ])
        .unwrap();
        assert_eq!(cli.log_level, LogLevel::Debug);
        match cli.command {
            Command::Restore(args) => {
                assert_eq!(args.file, "/data/report.doc");
                assert_eq!(args.version, Some(2));
                assert_eq!(args.output, Some(PathBuf::from("/tmp/report.doc")));
            }
            other => panic!("expected restore, got {other:?}"),
        }
    }

    #[test]
    fn test_global_options_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stormcloud",
            "run",
            "--root",
            "/data",
            "--once",
            "--state-dir",
            "/var/lib/stormcloud",
        ])
        .unwrap();
        assert_eq!(cli.state_dir.as_deref(), Some("/var/lib/stormcloud"));
        match cli.command {
            Command::Run(args) => {
                assert_eq!(args.roots, vec![PathBuf::from("/data")]);
                assert!(args.once);
            }
            other => panic!("expected run, got {other:?}"),
        }
    }

    #[test]
    fn test_maintenance_subcommands() {
        let cli = Cli::try_parse_from(["stormcloud", "retry-failed"]).unwrap();
        assert!(matches!(cli.command, Command::RetryFailed));
        let cli = Cli::try_parse_from(["stormcloud", "reset-state", "--yes"]).unwrap();
        assert!(matches!(cli.command, Command::ResetState(ResetStateArgs { yes: true })));
    }
}
