//! Configuration system for ChessLink
//!
//! Supports TOML configuration files with sensible defaults.
//! Configuration is loaded from:
//! - macOS: ~/Library/Application Support/chesslink/config.toml
//! - Linux: ~/.config/chesslink/config.toml
//! - Windows: %APPDATA%/chesslink/config.toml

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Default rendezvous server
pub const DEFAULT_RENDEZVOUS_URL: &str = "https://rendezvous.chesslink.dev";

/// Default public STUN servers, tried in order
pub const DEFAULT_STUN_SERVERS: &[&str] = &["stun.l.google.com:19302", "stun1.l.google.com:19302"];

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// External address discovery
    pub stun: StunConfig,
    /// Rendezvous server access
    pub rendezvous: RendezvousConfig,
    /// Hole punching
    pub probe: ProbeConfig,
    /// Established session behaviour
    pub session: SessionConfig,
    /// Local socket and overall deadline
    pub network: NetworkConfig,
}

/// STUN configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StunConfig {
    /// `host:port` entries, tried in order
    pub servers: Vec<String>,
    /// Time allowed per server
    pub timeout_ms: u64,
    /// Retransmit interval while waiting for a response
    pub retransmit_ms: u64,
}

impl Default for StunConfig {
    fn default() -> Self {
        Self {
            servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            timeout_ms: 3000,
            retransmit_ms: 500,
        }
    }
}

impl StunConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retransmit(&self) -> Duration {
        Duration::from_millis(self.retransmit_ms.max(1))
    }
}

/// Rendezvous client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendezvousConfig {
    /// Base URL of the matching server
    pub base_url: String,
    /// Per-request timeout
    pub request_timeout_ms: u64,
    /// Total attempts per request before giving up
    pub max_attempts: u32,
    /// First retry delay
    pub backoff_initial_ms: u64,
    /// Cap on the retry delay
    pub backoff_max_ms: u64,
    /// Host: time between polls for the joiner
    pub poll_interval_ms: u64,
    /// Host: total time to wait for the joiner
    pub max_wait_ms: u64,
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_RENDEZVOUS_URL.to_string(),
            request_timeout_ms: 5000,
            max_attempts: 4,
            backoff_initial_ms: 250,
            backoff_max_ms: 2000,
            poll_interval_ms: 1000,
            max_wait_ms: 120_000,
        }
    }
}

impl RendezvousConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// Hole punching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Time between probe datagrams
    pub interval_ms: u64,
    /// Probes sent before declaring the peer unreachable
    pub max_attempts: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_ms: 250,
            max_attempts: 40,
        }
    }
}

impl ProbeConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

/// Session configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Keepalive interval in milliseconds (0 disables keepalives)
    pub keepalive_ms: u64,
    /// Received datagrams buffered before the pump waits on the reader
    pub channel_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_ms: 5000,
            channel_capacity: 256,
        }
    }
}

impl SessionConfig {
    pub fn keepalive(&self) -> Option<Duration> {
        (self.keepalive_ms > 0).then(|| Duration::from_millis(self.keepalive_ms))
    }
}

/// Network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Local UDP bind address (port 0 lets the OS pick)
    pub bind_addr: SocketAddr,
    /// Overall deadline for one connection attempt
    pub connect_timeout_ms: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            connect_timeout_ms: 180_000,
        }
    }
}

impl NetworkConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
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

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Save configuration to the default path
    pub fn save(&self) -> Result<(), ConfigError> {
        match Self::default_path() {
            Some(path) => self.save_to(&path),
            None => Err(ConfigError::NoConfigDir),
        }
    }

    /// Save configuration to a specific path
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::Serialize(e.to_string()))?;

        std::fs::write(path, content)
            .map_err(|e| ConfigError::Io(e.to_string()))?;

        info!("Saved config to {:?}", path);
        Ok(())
    }

    /// Get the default config file path
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "chesslink", "chesslink")
            .map(|dirs| dirs.config_dir().join("config.toml"))
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
    /// No config directory available
    NoConfigDir,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "I/O error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Serialize(e) => write!(f, "Serialization error: {}", e),
            ConfigError::NoConfigDir => write!(f, "No configuration directory available"),
        }
    }
}

impl std::error::Error for ConfigError {}
