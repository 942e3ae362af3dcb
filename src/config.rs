//! Configuration management for Ratewatch.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::ratelimit::{PersistenceOptions, WindowSettings, DEFAULT_RESOLUTION};

/// Main configuration for the Ratewatch service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatewatchConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Service-wide request counter
    #[serde(default)]
    pub counter: CounterConfig,

    /// Per-client admission control
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Snapshot persistence
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Service counter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CounterConfig {
    /// Trailing window in seconds
    #[serde(default = "default_counter_window")]
    pub window_secs: u64,

    /// Ticks per window
    #[serde(default = "default_resolution")]
    pub resolution: u64,
}

impl Default for CounterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_counter_window(),
            resolution: default_resolution(),
        }
    }
}

fn default_counter_window() -> u64 {
    60
}

fn default_resolution() -> u64 {
    DEFAULT_RESOLUTION
}

/// Limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Trailing window in seconds
    #[serde(default = "default_limiter_window")]
    pub window_secs: u64,

    /// Requests allowed per client and window; 0 disables admission control
    #[serde(default = "default_limit")]
    pub limit: i64,

    /// Ticks per window
    #[serde(default = "default_resolution")]
    pub resolution: u64,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_secs: default_limiter_window(),
            limit: default_limit(),
            resolution: default_resolution(),
        }
    }
}

fn default_limiter_window() -> u64 {
    20
}

fn default_limit() -> i64 {
    15
}

/// Persistence configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Directory holding the snapshot files; snapshots are disabled when unset
    #[serde(default)]
    pub dir: Option<PathBuf>,

    /// Interval between two snapshots in milliseconds
    #[serde(default = "default_save_period")]
    pub save_period_ms: u64,

    /// Service counter snapshot file name
    #[serde(default = "default_counter_file")]
    pub counter_file: String,

    /// Limiter registry snapshot file name
    #[serde(default = "default_limiter_file")]
    pub limiter_file: String,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            dir: None,
            save_period_ms: default_save_period(),
            counter_file: default_counter_file(),
            limiter_file: default_limiter_file(),
        }
    }
}

fn default_save_period() -> u64 {
    1000
}

fn default_counter_file() -> String {
    "windowCounterState.json".to_string()
}

fn default_limiter_file() -> String {
    "limiter.json".to_string()
}

impl RatewatchConfig {
    /// Load configuration from a file path.
    pub fn from_file(path: &str) -> crate::error::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RatewatchConfig = serde_yaml::from_str(&contents)
            .map_err(|e| crate::error::RatewatchError::Config(e.to_string()))?;
        Ok(config)
    }

    /// Validated window of the service counter.
    pub fn counter_settings(&self) -> crate::error::Result<WindowSettings> {
        WindowSettings::new(
            Duration::from_secs(self.counter.window_secs),
            self.counter.resolution,
        )
    }

    /// Validated window of every per-client limiter.
    pub fn limiter_settings(&self) -> crate::error::Result<WindowSettings> {
        WindowSettings::new(
            Duration::from_secs(self.limiter.window_secs),
            self.limiter.resolution,
        )
    }

    /// Whether per-client admission control is enabled.
    pub fn limiter_enabled(&self) -> bool {
        self.limiter.limit > 0
    }

    /// Validated snapshot options of the service counter, if persistence is on.
    pub fn counter_persistence(&self) -> crate::error::Result<Option<PersistenceOptions>> {
        self.persistence.options(&self.persistence.counter_file)
    }

    pub fn limiter_persistence(&self) -> crate::error::Result<Option<PersistenceOptions>> {
        self.persistence.options(&self.persistence.limiter_file)
    }
}

impl PersistenceConfig {
    fn options(&self, file: &str) -> crate::error::Result<Option<PersistenceOptions>> {
        let save_period = Duration::from_millis(self.save_period_ms);
        self.dir
            .as_ref()
            .map(|dir| PersistenceOptions::new(dir.join(file), save_period))
            .transpose()
    }
}
