//! Configuration file support for tepmgrd
//!
//! Loads and validates tepmgrd configuration from TOML files.
//! Default location: /etc/sonic/tepmgrd.conf

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sonic_types::MonitorProtocol;
use tracing::warn;

use crate::error::{TepMgrError, TepMgrResult};
use crate::types::MonitorSettings;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sonic/tepmgrd.conf";

/// Backing store selection
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store; state is lost on exit
    #[default]
    Memory,
    Redis,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis host
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    /// Redis port
    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    /// Redis database number holding the mesh tables
    #[serde(default = "default_db_number")]
    pub db_number: u32,

    /// Maximum change-feed entries popped per table and round
    #[serde(default = "default_poll_batch_size")]
    pub poll_batch_size: usize,

    /// Blocking pop timeout in seconds
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_secs: f64,
}

/// Tunnel interface configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Enable liveness monitoring on tunnel interfaces
    #[serde(default)]
    pub monitoring_enabled: bool,

    #[serde(default)]
    pub monitor_protocol: MonitorProtocol,

    /// Monitoring interval in milliseconds
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
}

/// Pass scheduling configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Passes running at the same time across zones
    #[serde(default = "default_max_concurrent_passes")]
    pub max_concurrent_passes: usize,
}

/// Tunnel name pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdPoolConfig {
    #[serde(default = "default_pool_name")]
    pub name: String,

    #[serde(default = "default_pool_low")]
    pub low: u32,

    #[serde(default = "default_pool_high")]
    pub high: u32,
}

/// Complete tepmgrd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TepMgrConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub tunnel: TunnelConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub id_pool: IdPoolConfig,
}

// Default functions
fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_db_number() -> u32 {
    0
}

fn default_poll_batch_size() -> usize {
    128
}

fn default_poll_timeout() -> f64 {
    1.0
}

fn default_monitor_interval() -> u64 {
    1000
}

fn default_max_concurrent_passes() -> usize {
    4
}

fn default_pool_name() -> String {
    "tunnel-name-pool".to_string()
}

fn default_pool_low() -> u32 {
    1
}

fn default_pool_high() -> u32 {
    65535
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            db_number: default_db_number(),
            poll_batch_size: default_poll_batch_size(),
            poll_timeout_secs: default_poll_timeout(),
        }
    }
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            monitoring_enabled: false,
            monitor_protocol: MonitorProtocol::default(),
            monitor_interval_ms: default_monitor_interval(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_passes: default_max_concurrent_passes(),
        }
    }
}

impl Default for IdPoolConfig {
    fn default() -> Self {
        Self {
            name: default_pool_name(),
            low: default_pool_low(),
            high: default_pool_high(),
        }
    }
}

impl TepMgrConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> TepMgrResult<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                TepMgrError::config(
                    "file",
                    format!("failed to parse {}: {}", path.display(), e),
                )
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(TepMgrError::Io(e)),
        }
    }

    /// Load from default location or defaults
    pub fn load() -> TepMgrResult<Self> {
        Self::load_or_default(DEFAULT_CONFIG_PATH)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> TepMgrResult<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| TepMgrError::config("file", format!("failed to serialize: {}", e)))?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.database.poll_timeout_secs)
    }

    /// Monitoring parameters stamped onto tunnel interfaces
    pub fn monitor_settings(&self) -> MonitorSettings {
        MonitorSettings {
            enabled: self.tunnel.monitoring_enabled,
            protocol: self.tunnel.monitor_protocol,
            interval_ms: self.tunnel.monitor_interval_ms,
        }
    }

    pub fn validate(&self) -> TepMgrResult<()> {
        if self.database.backend == StoreBackend::Redis && self.database.redis_port == 0 {
            return Err(TepMgrError::config("database.redis_port", "must be > 0"));
        }

        if self.database.poll_batch_size == 0 {
            return Err(TepMgrError::config("database.poll_batch_size", "must be > 0"));
        }

        if !self.database.poll_timeout_secs.is_finite() || self.database.poll_timeout_secs <= 0.0 {
            return Err(TepMgrError::config(
                "database.poll_timeout_secs",
                "must be a positive number of seconds",
            ));
        }

        if self.tunnel.monitoring_enabled && self.tunnel.monitor_interval_ms == 0 {
            return Err(TepMgrError::config(
                "tunnel.monitor_interval_ms",
                "must be > 0 when monitoring is enabled",
            ));
        }

        if self.worker.max_concurrent_passes == 0 {
            return Err(TepMgrError::config("worker.max_concurrent_passes", "must be > 0"));
        }

        if self.id_pool.name.trim().is_empty() {
            return Err(TepMgrError::config("id_pool.name", "must not be empty"));
        }

        if self.id_pool.low == 0 || self.id_pool.low > self.id_pool.high {
            return Err(TepMgrError::config(
                "id_pool",
                format!(
                    "invalid range {}..={} (low must be >= 1 and <= high)",
                    self.id_pool.low, self.id_pool.high
                ),
            ));
        }

        Ok(())
    }
}
