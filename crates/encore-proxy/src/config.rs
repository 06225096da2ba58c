use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default = "default_admin_addr")]
    pub admin_addr: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_upstream_url")]
    pub url: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StoreConfig {
    /// Store generation name; bumping it rolls out a new generation.
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_manifest")]
    pub manifest: Vec<String>,
    #[serde(default)]
    pub quota_bytes: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_network_timeout_ms")]
    pub network_timeout_ms: u64,
    #[serde(default = "default_max_cached_songs")]
    pub max_cached_songs: usize,
    #[serde(default = "default_shell_entry")]
    pub shell_entry: String,
    #[serde(default = "default_media_extensions")]
    pub media_extensions: Vec<String>,
    #[serde(default = "default_excluded_extensions")]
    pub excluded_extensions: Vec<String>,
    #[serde(default = "default_critical_extensions")]
    pub critical_extensions: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub update_flow: UpdateFlow,
    #[serde(default = "default_install_retry_ms")]
    pub install_retry_ms: u64,
}

/// How a freshly installed worker generation takes over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateFlow {
    /// Activate as soon as install succeeds.
    #[default]
    Immediate,
    /// Wait for a `SKIP_WAITING` control message once a worker is active.
    UserGated,
}

/// Immutable settings of one worker generation. Built once per install and
/// never mutated; a config change produces a new `WorkerConfig`.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    pub version: String,
    pub manifest: Vec<String>,
    pub network_timeout: Duration,
    pub max_cached_songs: usize,
    pub shell_entry: String,
    pub media_extensions: Vec<String>,
    pub excluded_extensions: Vec<String>,
    pub critical_extensions: Vec<String>,
    pub update_flow: UpdateFlow,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn default_config() -> Self {
        Config {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            store: StoreConfig::default(),
            router: RouterConfig::default(),
            lifecycle: LifecycleConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.store.version.trim().is_empty() {
            return Err(ConfigError::Invalid("store.version must not be empty".into()));
        }
        if self.router.max_cached_songs == 0 {
            return Err(ConfigError::Invalid(
                "router.max_cached_songs must be >= 1".into(),
            ));
        }
        if self.router.network_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "router.network_timeout_ms must be > 0".into(),
            ));
        }
        Ok(())
    }

    /// Freeze the worker-facing part of the config.
    pub fn worker_config(&self) -> Result<Arc<WorkerConfig>, ConfigError> {
        self.validate()?;
        Ok(Arc::new(WorkerConfig {
            version: self.store.version.clone(),
            manifest: self.store.manifest.clone(),
            network_timeout: Duration::from_millis(self.router.network_timeout_ms),
            max_cached_songs: self.router.max_cached_songs,
            shell_entry: self.router.shell_entry.clone(),
            media_extensions: normalise_extensions(&self.router.media_extensions),
            excluded_extensions: normalise_extensions(&self.router.excluded_extensions),
            critical_extensions: normalise_extensions(&self.router.critical_extensions),
            update_flow: self.lifecycle.update_flow,
        }))
    }
}

fn normalise_extensions(exts: &[String]) -> Vec<String> {
    exts.iter()
        .map(|e| e.trim().trim_start_matches('.').to_ascii_lowercase())
        .filter(|e| !e.is_empty())
        .collect()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            admin_addr: default_admin_addr(),
        }
    }
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            url: default_upstream_url(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            manifest: default_manifest(),
            quota_bytes: None,
        }
    }
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            network_timeout_ms: default_network_timeout_ms(),
            max_cached_songs: default_max_cached_songs(),
            shell_entry: default_shell_entry(),
            media_extensions: default_media_extensions(),
            excluded_extensions: default_excluded_extensions(),
            critical_extensions: default_critical_extensions(),
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            update_flow: UpdateFlow::default(),
            install_retry_ms: default_install_retry_ms(),
        }
    }
}

/// Compare old and new config and decide what a reload means.
///
/// - `store.version` changed → a new worker generation to install
/// - any other worker setting changed without a version bump → WARN, ignore
/// - server/upstream/quota changed → WARN, restart required
pub fn diff_for_update(
    old: &Config,
    new: &Config,
) -> Result<Option<Arc<WorkerConfig>>, ConfigError> {
    if old.server != new.server
        || old.upstream != new.upstream
        || old.store.quota_bytes != new.store.quota_bytes
    {
        tracing::warn!("server/upstream/quota change detected, ignoring. Restart to apply");
    }

    if old.store.version != new.store.version {
        let worker = new.worker_config()?;
        tracing::info!(
            old = %old.store.version,
            new = %new.store.version,
            "config reloaded: new store version staged for install"
        );
        return Ok(Some(worker));
    }

    if old.store.manifest != new.store.manifest
        || old.router != new.router
        || old.lifecycle.update_flow != new.lifecycle.update_flow
    {
        tracing::warn!(
            version = %new.store.version,
            "worker settings changed without a store.version bump, ignoring"
        );
    }

    Ok(None)
}

fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_admin_addr() -> String {
    "0.0.0.0:9090".to_string()
}
fn default_upstream_url() -> String {
    "http://127.0.0.1:3000".to_string()
}
fn default_timeout_ms() -> u64 {
    30_000
}
fn default_version() -> String {
    "encore-cache-v1".to_string()
}
fn default_manifest() -> Vec<String> {
    [
        "./",
        "./index.html",
        "./style.css",
        "./script.js",
        "./manifest.json",
        "./icons/icon-192.png",
        "./icons/icon-512.png",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}
fn default_network_timeout_ms() -> u64 {
    3000
}
fn default_max_cached_songs() -> usize {
    10
}
fn default_shell_entry() -> String {
    "./index.html".to_string()
}
fn default_media_extensions() -> Vec<String> {
    ["mp3", "m4a", "ogg", "oga", "opus", "flac", "wav", "aac"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_excluded_extensions() -> Vec<String> {
    vec!["lrc".to_string()]
}
fn default_critical_extensions() -> Vec<String> {
    ["html", "htm", "css", "js", "mjs", "json", "webmanifest"]
        .into_iter()
        .map(String::from)
        .collect()
}
fn default_install_retry_ms() -> u64 {
    5000
}
