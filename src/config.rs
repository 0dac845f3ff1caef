//! Configuration: a TOML settings file validated into [`EngineConfig`] and
//! [`BackendConfig`].
//!
//! Every field has a default, so an empty file is valid apart from the
//! backend credentials needed to run.

use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use base64::Engine as _;
use serde::Deserialize;

use crate::classify::ChunkPolicy;
use crate::retry::RetryConfig;

/// A directory to back up.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct WatchRoot {
    pub path: PathBuf,
    /// Include subdirectories. Non-recursive roots only back up their
    /// direct children.
    #[serde(default = "default_true")]
    pub recursive: bool,
}

/// Raw settings as read from disk.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub state_dir: Option<String>,
    pub roots: Vec<WatchRoot>,
    pub exclude: Vec<String>,
    pub retention: u32,
    pub max_parallel_uploads: usize,
    pub classify_concurrency: usize,
    pub chunk_threshold_bytes: u64,
    pub chunk_size_bytes: u32,
    pub debounce_ms: u64,
    /// Zero disables the limit.
    pub bandwidth_limit_kbps: u32,
    pub event_queue_capacity: usize,
    pub upload_queue_capacity: usize,
    /// Zero disables the heartbeat.
    pub keepalive_secs: u64,
    /// Zero disables scheduled rescans.
    pub rescan_interval_secs: u64,
    pub retry: RetrySettings,
    pub backend: BackendSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_dir: None,
            roots: Vec::new(),
            exclude: vec![
                "*.swp".to_string(),
                "*~".to_string(),
                ".DS_Store".to_string(),
            ],
            retention: 10,
            max_parallel_uploads: 4,
            classify_concurrency: 4,
            chunk_threshold_bytes: 8 * 1024 * 1024,
            chunk_size_bytes: 4 * 1024 * 1024,
            debounce_ms: 2000,
            bandwidth_limit_kbps: 0,
            event_queue_capacity: 1024,
            upload_queue_capacity: 256,
            keepalive_secs: 60,
            rescan_interval_secs: 0,
            retry: RetrySettings::default(),
            backend: BackendSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 4,
            base_delay_ms: 2000,
            max_delay_ms: 60_000,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSettings {
    pub url: String,
    pub api_key: Option<String>,
    pub agent_id: Option<String>,
    /// Base64 account secret the chunk encryption key is derived from.
    pub account_secret: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            url: "https://api.stormcloud.example".to_string(),
            api_key: None,
            agent_id: None,
            account_secret: None,
            request_timeout_secs: 30,
        }
    }
}

impl std::fmt::Debug for BackendSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendSettings")
            .field("url", &self.url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("agent_id", &self.agent_id)
            .field("account_secret", &self.account_secret.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

fn default_true() -> bool {
    true
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

/// Default settings file location (`~/.config/stormcloud/stormcloud.toml`).
pub fn default_settings_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stormcloud")
        .join("stormcloud.toml")
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("stormcloud")
}

impl Settings {
    /// Load settings from a TOML file. A missing file yields the defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text)
                .with_context(|| format!("Invalid settings file {}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => {
                Err(e).with_context(|| format!("Failed to read settings file {}", path.display()))
            }
        }
    }

    pub fn parse(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// The state directory these settings resolve to.
    pub fn resolved_state_dir(&self) -> PathBuf {
        self.state_dir
            .as_deref()
            .map(expand_tilde)
            .unwrap_or_else(default_state_dir)
    }

    /// Validate into the engine's configuration.
    pub fn engine_config(&self) -> anyhow::Result<EngineConfig> {
        if self.retention < 1 {
            bail!("invalid `retention`: must keep at least 1 version");
        }
        if self.max_parallel_uploads == 0 {
            bail!("invalid `max_parallel_uploads`: must be at least 1");
        }
        if self.classify_concurrency == 0 {
            bail!("invalid `classify_concurrency`: must be at least 1");
        }
        if self.chunk_size_bytes == 0 {
            bail!("invalid `chunk_size_bytes`: must be positive");
        }
        if self.chunk_threshold_bytes > u64::from(u32::MAX) {
            bail!("invalid `chunk_threshold_bytes`: a single chunk must fit in 4 GiB");
        }
        if self.event_queue_capacity == 0 || self.upload_queue_capacity == 0 {
            bail!("invalid queue capacity: `event_queue_capacity` and `upload_queue_capacity` must be positive");
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            bail!("invalid `retry.base_delay_ms`: larger than `retry.max_delay_ms`");
        }
        for pattern in &self.exclude {
            globset::Glob::new(pattern)
                .with_context(|| format!("invalid `exclude` pattern {pattern:?}"))?;
        }

        let mut roots = Vec::with_capacity(self.roots.len());
        for root in &self.roots {
            let path = expand_tilde(&root.path.to_string_lossy());
            if !path.is_absolute() {
                bail!("invalid `roots`: {} is not an absolute path", path.display());
            }
            roots.push(WatchRoot {
                path,
                recursive: root.recursive,
            });
        }

        Ok(EngineConfig {
            roots,
            state_dir: self.resolved_state_dir(),
            exclude: self.exclude.clone(),
            retention: self.retention,
            max_parallel_uploads: self.max_parallel_uploads,
            classify_concurrency: self.classify_concurrency,
            chunk_policy: ChunkPolicy {
                threshold: self.chunk_threshold_bytes,
                chunk_size: self.chunk_size_bytes,
            },
            debounce: Duration::from_millis(self.debounce_ms),
            bandwidth_limit_kbps: NonZeroU32::new(self.bandwidth_limit_kbps),
            retry: RetryConfig {
                max_retries: self.retry.max_retries,
                base_delay: Duration::from_millis(self.retry.base_delay_ms),
                max_delay: Duration::from_millis(self.retry.max_delay_ms),
            },
            event_queue_capacity: self.event_queue_capacity,
            upload_queue_capacity: self.upload_queue_capacity,
            keepalive_interval: (self.keepalive_secs > 0)
                .then(|| Duration::from_secs(self.keepalive_secs)),
            rescan_interval: (self.rescan_interval_secs > 0)
                .then(|| Duration::from_secs(self.rescan_interval_secs)),
            watch: true,
        })
    }

    /// Validate the backend section. `agent_id` falls back to the id
    /// persisted in the state directory.
    pub fn backend_config(&self) -> anyhow::Result<BackendConfig> {
        let backend = &self.backend;
        let url = reqwest::Url::parse(&backend.url)
            .with_context(|| format!("invalid `backend.url` {:?}", backend.url))?;
        if !matches!(url.scheme(), "https" | "http") {
            bail!("invalid `backend.url`: scheme must be https");
        }
        let secret = match backend.account_secret.as_deref() {
            Some(s) => base64::engine::general_purpose::STANDARD
                .decode(s.trim())
                .context("invalid `backend.account_secret`: not base64")?,
            None => bail!("missing `backend.account_secret`"),
        };
        if secret.len() < 16 {
            bail!("invalid `backend.account_secret`: must decode to at least 16 bytes");
        }
        let agent_id = match &backend.agent_id {
            Some(id) => id.clone(),
            None => load_or_create_agent_id(&self.resolved_state_dir())?,
        };
        if backend.request_timeout_secs == 0 {
            bail!("invalid `backend.request_timeout_secs`: must be positive");
        }

        Ok(BackendConfig {
            url: backend.url.trim_end_matches('/').to_string(),
            api_key: backend.api_key.clone().filter(|k| !k.is_empty()),
            agent_id,
            account_secret: secret,
            request_timeout: Duration::from_secs(backend.request_timeout_secs),
        })
    }
}

/// Read the agent id stored in the state directory, creating one on first use.
fn load_or_create_agent_id(state_dir: &Path) -> anyhow::Result<String> {
    let path = state_dir.join("agent-id");
    match std::fs::read_to_string(&path) {
        Ok(id) if !id.trim().is_empty() => return Ok(id.trim().to_string()),
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
    std::fs::create_dir_all(state_dir)
        .with_context(|| format!("Failed to create state directory {}", state_dir.display()))?;
    let id = uuid::Uuid::new_v4().to_string();
    std::fs::write(&path, &id).with_context(|| format!("Failed to write {}", path.display()))?;
    tracing::info!(agent_id = %id, "Generated new agent id");
    Ok(id)
}

/// Validated engine configuration.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub roots: Vec<WatchRoot>,
    pub state_dir: PathBuf,
    pub exclude: Vec<String>,
    /// Committed versions kept per file (at least 1).
    pub retention: u32,
    pub max_parallel_uploads: usize,
    pub classify_concurrency: usize,
    pub chunk_policy: ChunkPolicy,
    pub debounce: Duration,
    pub bandwidth_limit_kbps: Option<NonZeroU32>,
    pub retry: RetryConfig,
    pub event_queue_capacity: usize,
    pub upload_queue_capacity: usize,
    pub keepalive_interval: Option<Duration>,
    pub rescan_interval: Option<Duration>,
    /// Start the filesystem watcher. When off, changes are only picked up
    /// by scans.
    pub watch: bool,
}

impl EngineConfig {
    /// Defaults for the given roots and state directory.
    pub fn new(roots: Vec<WatchRoot>, state_dir: PathBuf) -> Self {
        let defaults = Settings::default();
        Self {
            roots,
            state_dir,
            exclude: defaults.exclude,
            retention: defaults.retention,
            max_parallel_uploads: defaults.max_parallel_uploads,
            classify_concurrency: defaults.classify_concurrency,
            chunk_policy: ChunkPolicy::default(),
            debounce: Duration::from_millis(defaults.debounce_ms),
            bandwidth_limit_kbps: None,
            retry: RetryConfig::default(),
            event_queue_capacity: defaults.event_queue_capacity,
            upload_queue_capacity: defaults.upload_queue_capacity,
            keepalive_interval: Some(Duration::from_secs(defaults.keepalive_secs)),
            rescan_interval: None,
            watch: true,
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.state_dir.join("stormcloud.db")
    }

    pub fn chunk_cache_dir(&self) -> PathBuf {
        self.state_dir.join("chunk-cache")
    }
}

/// Validated backend connection settings.
#[derive(Clone)]
pub struct BackendConfig {
    pub url: String,
    /// `None` means no credential: every request is rejected as unauthenticated.
    pub api_key: Option<String>,
    pub agent_id: String,
    pub account_secret: Vec<u8>,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for BackendConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendConfig")
            .field("url", &self.url)
            .field("api_key", &"<redacted>")
            .field("agent_id", &self.agent_id)
            .field("account_secret", &"<redacted>")
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}
