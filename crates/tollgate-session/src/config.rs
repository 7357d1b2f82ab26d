//! Session Configuration
//!
//! Host-level settings for the session orchestrator: where the engine
//! binary and private data live, how long to wait for a crash on start,
//! and the bounds applied to queries against the engine.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Engine controller address written into the default engine config
pub const DEFAULT_CONTROLLER_ADDR: &str = "127.0.0.1:9090";

/// Session name shown by the OS for the tunnel interface
pub const DEFAULT_SESSION_NAME: &str = "Tollgate";

/// Complete host configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Application-private data directory (engine working directory)
    pub data_dir: PathBuf,
    /// Cache directory exposed to the engine
    pub cache_dir: PathBuf,
    /// Path to the proxy engine executable
    pub engine_binary: PathBuf,
    /// Engine controller `host:port`
    #[serde(default = "default_controller_addr")]
    pub controller_addr: String,
    /// Session name for the tunnel interface
    #[serde(default = "default_session_name")]
    pub session_name: String,
    /// How long to watch a freshly spawned engine for an immediate exit
    #[serde(default = "default_crash_window_ms")]
    pub crash_window_ms: u64,
    /// Upper bound for tunnel settings queries
    #[serde(default = "default_settings_timeout_ms")]
    pub settings_timeout_ms: u64,
    /// Status notification refresh period while the tunnel is up
    #[serde(default = "default_status_refresh_ms")]
    pub status_refresh_ms: u64,
}

fn default_controller_addr() -> String {
    DEFAULT_CONTROLLER_ADDR.to_string()
}

fn default_session_name() -> String {
    DEFAULT_SESSION_NAME.to_string()
}

fn default_crash_window_ms() -> u64 {
    500
}

fn default_settings_timeout_ms() -> u64 {
    8_000
}

fn default_status_refresh_ms() -> u64 {
    2_000
}

impl SessionConfig {
    /// Create a configuration rooted at `data_dir`
    ///
    /// The cache directory defaults to `<data_dir>/cache` and the engine
    /// binary to `<data_dir>/bin/engine`.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            cache_dir: data_dir.join("cache"),
            engine_binary: data_dir.join("bin").join("engine"),
            data_dir,
            controller_addr: default_controller_addr(),
            session_name: default_session_name(),
            crash_window_ms: default_crash_window_ms(),
            settings_timeout_ms: default_settings_timeout_ms(),
            status_refresh_ms: default_status_refresh_ms(),
        }
    }

    /// Load from a TOML or JSON file, chosen by extension
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        let parse: fn(&str) -> Result<Self, ConfigError> = match ext {
            "toml" => Self::from_toml,
            "json" => Self::from_json,
            other => return Err(ConfigError::UnsupportedFormat(other.to_string())),
        };

        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config = parse(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Parse from a TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Parse from a JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Export as TOML
    pub fn to_toml(&self) -> String {
        toml::to_string_pretty(self).unwrap_or_default()
    }

    /// Engine controller URL
    pub fn controller_url(&self) -> String {
        format!("http://{}", self.controller_addr)
    }

    /// Crash detection window after spawning the engine
    pub fn crash_window(&self) -> Duration {
        Duration::from_millis(self.crash_window_ms)
    }

    /// Bound for tunnel settings queries
    pub fn settings_timeout(&self) -> Duration {
        Duration::from_millis(self.settings_timeout_ms)
    }

    /// Status refresh period
    pub fn status_refresh(&self) -> Duration {
        Duration::from_millis(self.status_refresh_ms)
    }

    /// Path of the persisted preference store
    pub fn prefs_path(&self) -> PathBuf {
        self.data_dir.join("prefs.json")
    }

    /// Path of the persisted credential records
    pub fn credentials_path(&self) -> PathBuf {
        self.data_dir.join("credentials.json")
    }

    /// Path of the persisted tunnel settings
    pub fn tun_settings_path(&self) -> PathBuf {
        self.data_dir.join("tun.toml")
    }

    /// Directory holding wrapping keys for file-backed key stores
    pub fn keystore_dir(&self) -> PathBuf {
        self.data_dir.join("keystore")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::MissingDataDir);
        }
        if self.controller_addr.trim().is_empty() || !self.controller_addr.contains(':') {
            return Err(ConfigError::InvalidControllerAddr(self.controller_addr.clone()));
        }
        if self.settings_timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.status_refresh_ms == 0 {
            return Err(ConfigError::ZeroRefresh);
        }
        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Data directory must be set")]
    MissingDataDir,

    #[error("Invalid controller address: {0}")]
    InvalidControllerAddr(String),

    #[error("Settings timeout must be greater than zero")]
    ZeroTimeout,

    #[error("Status refresh period must be greater than zero")]
    ZeroRefresh,

    #[error("Unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("Config I/O error: {0}")]
    Io(String),

    #[error("Config parse error: {0}")]
    Parse(String),
}
