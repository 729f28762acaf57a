//! imgstash configuration.
//!
//! Stored as TOML at `$XDG_CONFIG_HOME/imgstash/config.toml`, falling back
//! to `~/.config/imgstash/config.toml`. A default file is written on first
//! run.

use std::path::{Path, PathBuf};
use std::time::Duration;

use imgstash_protocol::constants::{
    DEFAULT_CHUNK_SIZE, DEFAULT_MAX_CHUNKS, DEFAULT_MAX_CONCURRENT, DEFAULT_MAX_FILE_SIZE,
    DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, DEFAULT_SESSION_TTL, DEFAULT_SMALL_OBJECT_THRESHOLD,
    DEFAULT_TERMINAL_GRACE,
};
use imgstash_session::SessionConfig;
use imgstash_uploader::{TransportConfig, UploaderConfig};
use serde::{Deserialize, Serialize};

/// Top-level configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

/// Where chunks are staged until assembly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StagingMode {
    Memory,
    Disk,
}

/// Upload server settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Public prefix under which published images are served.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Directory published images are written to. `~` is expanded.
    #[serde(default = "default_content_dir")]
    pub content_dir: String,

    #[serde(default = "default_staging")]
    pub staging: StagingMode,

    /// Used when `staging = "disk"`.
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    #[serde(default = "default_true")]
    pub allow_guests: bool,

    /// Inactivity window before a session expires, in seconds.
    #[serde(default = "default_session_ttl")]
    pub session_ttl_secs: u64,

    #[serde(default = "default_terminal_grace")]
    pub terminal_grace_secs: u64,

    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    #[serde(default = "default_max_chunks")]
    pub max_chunks: u32,
}

/// Uploader settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,

    /// Objects smaller than this are sent in one request.
    #[serde(default = "default_small_object_threshold")]
    pub small_object_threshold: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,
}

fn default_base_url() -> String {
    "http://localhost:8080/images".into()
}

fn default_content_dir() -> String {
    "~/.local/share/imgstash/images".into()
}

fn default_staging() -> StagingMode {
    StagingMode::Disk
}

fn default_staging_dir() -> String {
    "~/.cache/imgstash/staging".into()
}

fn default_true() -> bool {
    true
}

fn default_session_ttl() -> u64 {
    DEFAULT_SESSION_TTL.as_secs()
}

fn default_terminal_grace() -> u64 {
    DEFAULT_TERMINAL_GRACE.as_secs()
}

fn default_max_file_size() -> u64 {
    DEFAULT_MAX_FILE_SIZE
}

fn default_max_chunks() -> u32 {
    DEFAULT_MAX_CHUNKS
}

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_small_object_threshold() -> u64 {
    DEFAULT_SMALL_OBJECT_THRESHOLD
}

fn default_max_concurrent() -> usize {
    DEFAULT_MAX_CONCURRENT
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

fn default_retry_delay() -> u64 {
    DEFAULT_RETRY_DELAY.as_millis() as u64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            content_dir: default_content_dir(),
            staging: default_staging(),
            staging_dir: default_staging_dir(),
            allow_guests: default_true(),
            session_ttl_secs: default_session_ttl(),
            terminal_grace_secs: default_terminal_grace(),
            max_file_size: default_max_file_size(),
            max_chunks: default_max_chunks(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            small_object_threshold: default_small_object_threshold(),
            max_concurrent: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
        }
    }
}

impl Config {
    /// Loads configuration from `path`, or writes and returns the default
    /// if the file does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            tracing::debug!(path = %path.display(), "configuration loaded");
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            tracing::info!(path = %path.display(), "wrote default configuration");
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml::to_string_pretty(self)?)?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }

    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            ttl: Duration::from_secs(self.server.session_ttl_secs),
            terminal_grace: Duration::from_secs(self.server.terminal_grace_secs),
            max_file_size: self.server.max_file_size,
            max_chunks: self.server.max_chunks,
        }
    }

    pub fn uploader_config(&self) -> UploaderConfig {
        UploaderConfig {
            chunk_size: self.client.chunk_size,
            small_object_threshold: self.client.small_object_threshold,
            transport: TransportConfig {
                max_concurrent: self.client.max_concurrent,
                max_retries: self.client.max_retries,
                retry_delay: Duration::from_millis(self.client.retry_delay_ms),
            },
        }
    }
}

/// Default configuration file location.
pub fn default_path() -> PathBuf {
    if let Ok(dir) = std::env::var("XDG_CONFIG_HOME")
        && !dir.is_empty()
    {
        return PathBuf::from(dir).join("imgstash").join("config.toml");
    }
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".into());
    PathBuf::from(home)
        .join(".config")
        .join("imgstash")
        .join("config.toml")
}

/// Expands a leading `~/` to `$HOME`.
pub fn expand_path(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Ok(home) = std::env::var("HOME")
    {
        return PathBuf::from(home).join(rest);
    }
    PathBuf::from(path)
}
