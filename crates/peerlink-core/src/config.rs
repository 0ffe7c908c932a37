//! Configuration system for peerlink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/peerlink/config.toml
//! - Linux: ~/.config/peerlink/config.toml
//! - Windows: %APPDATA%/peerlink/config.toml
//!
//! The binary layers command-line flags and environment variables on top.

use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{DEFAULT_ID_PREFIX, DEFAULT_KEY, DEFAULT_PORT};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Listener settings
    pub server: ServerConfig,
    /// Registry and routing settings
    pub relay: RelayConfig,
    /// Liveness sweep settings
    pub liveness: LivenessConfig,
    /// Shutdown settings
    pub shutdown: ShutdownConfig,
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address
    pub bind: IpAddr,
    /// Listen port
    pub port: u16,
    /// Mount path; the WebSocket endpoint is `{path}/peerjs`
    pub path: String,
    /// Origins allowed to open a connection (empty = any)
    pub allowed_origins: Vec<String>,
    /// Trust `X-Forwarded-For` from a fronting proxy
    pub proxied: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            path: "/myapp".into(),
            allowed_origins: Vec::new(),
            proxied: false,
        }
    }
}

/// What to do when a destination's send buffer is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the message being routed
    #[default]
    DropNewest,
    /// Wait for the destination to drain
    Block,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drop_newest" | "drop-newest" => Ok(OverflowPolicy::DropNewest),
            "block" => Ok(OverflowPolicy::Block),
            other => Err(ConfigError::Invalid(format!("unknown overflow policy {:?}", other))),
        }
    }
}

/// Registry and routing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Namespace key clients must present
    pub key: String,
    /// Maximum concurrent peers
    pub max_peers: usize,
    /// Outbound buffer per peer, in messages
    pub send_buffer: usize,
    /// Behavior when a peer's outbound buffer is full
    pub overflow: OverflowPolicy,
    /// Expose the peer list over HTTP
    pub allow_discovery: bool,
    /// Prefix for generated peer ids
    pub id_prefix: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            key: DEFAULT_KEY.into(),
            max_peers: 100,
            send_buffer: 64,
            overflow: OverflowPolicy::DropNewest,
            allow_discovery: true,
            id_prefix: DEFAULT_ID_PREFIX.into(),
        }
    }
}

/// Liveness sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessConfig {
    /// Idle time before a peer is flagged
    pub expire_timeout_ms: u64,
    /// Additional idle time before a flagged peer is removed
    pub cleanup_grace_ms: u64,
    /// Time between sweeps
    pub sweep_interval_ms: u64,
}

impl Default for LivenessConfig {
    fn default() -> Self {
        Self {
            expire_timeout_ms: 60_000,
            cleanup_grace_ms: 3_000,
            sweep_interval_ms: 5_000,
        }
    }
}

impl LivenessConfig {
    pub fn expire_timeout(&self) -> Duration {
        Duration::from_millis(self.expire_timeout_ms)
    }

    pub fn cleanup_grace(&self) -> Duration {
        Duration::from_millis(self.cleanup_grace_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }
}

/// Shutdown configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ShutdownConfig {
    /// Time allowed for transports to acknowledge close
    pub grace_ms: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self { grace_ms: 10_000 }
    }
}

impl ShutdownConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl Config {
    /// Load configuration from the default path
    pub fn load() -> Self {
        match Self::default_path() {
            Some(path) => Self::load_from(&path).unwrap_or_else(|e| {
                warn!("Failed to load config from {:?}: {}, using defaults", path, e);
                Self::default()
            }),
            None => {
                debug!("No config directory found, using defaults");
                Self::default()
            }
        }
    }

    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            debug!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "peerlink", "peerlink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Reject values the relay cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.server.path.starts_with('/') {
            return Err(ConfigError::Invalid(format!(
                "server.path must start with '/': {:?}",
                self.server.path
            )));
        }
        if self.relay.key.is_empty() {
            return Err(ConfigError::Invalid("relay.key must not be empty".into()));
        }
        if self.relay.max_peers == 0 {
            return Err(ConfigError::Invalid("relay.max_peers must be positive".into()));
        }
        if self.relay.send_buffer == 0 {
            return Err(ConfigError::Invalid("relay.send_buffer must be positive".into()));
        }
        if self.liveness.expire_timeout_ms == 0 || self.liveness.sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "liveness timeouts must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Mount path without a trailing slash ("/" becomes "")
    pub fn base_path(&self) -> &str {
        self.server.path.trim_end_matches('/')
    }

    /// Path of the WebSocket endpoint
    pub fn socket_path(&self) -> String {
        format!("{}/peerjs", self.base_path())
    }

    /// Whether a handshake from `origin` may proceed
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        let allowed = &self.server.allowed_origins;
        match origin {
            _ if allowed.is_empty() => true,
            None => true,
            Some(o) => allowed.iter().any(|a| a == "*" || a == o),
        }
    }

    /// Generate a sample configuration file content
    pub fn sample() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_else(|_| String::new())
    }
}

/// Configuration errors
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// I/O error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// A value is out of range
    Invalid(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::Invalid(e) => write!(f, "Invalid configuration: {}", e),
        }
    }
}

impl std::error::Error for ConfigError {}
