//! Configuration management for keeperd and keeperctl.
//!
//! Loads settings from /etc/keeper/config.toml (or an explicit path) or uses
//! defaults. Every field has a serde default, so partial files are fine.

use crate::error::{KeeperError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/keeper/config.toml";

/// Docker Compose project settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeConfig {
    /// Directory containing docker-compose.yml
    #[serde(default = "default_compose_dir")]
    pub dir: PathBuf,

    /// Service that runs the companion tool (rcon-cli); detected when unset
    #[serde(default)]
    pub service: Option<String>,
}

fn default_compose_dir() -> PathBuf {
    PathBuf::from("/srv/minecraft")
}

impl Default for ComposeConfig {
    fn default() -> Self {
        Self {
            dir: default_compose_dir(),
            service: None,
        }
    }
}

/// Lifecycle monitor timing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Seconds between status probes
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    /// Seconds an unhealthy reading is tolerated before the server is declared down
    #[serde(default = "default_grace")]
    pub grace_secs: u64,

    /// Seconds a start may take to become healthy before it is declared failed
    #[serde(default = "default_start_timeout")]
    pub start_timeout_secs: u64,

    /// Per-probe timeout; must be shorter than the poll interval
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,

    /// Bound on each persistence write
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    /// Attempts per persistence write before the cycle is skipped
    #[serde(default = "default_write_retries")]
    pub write_retries: u32,
}

fn default_poll_interval() -> u64 {
    60
}

fn default_grace() -> u64 {
    120
}

fn default_start_timeout() -> u64 {
    360
}

fn default_probe_timeout() -> u64 {
    10
}

fn default_write_timeout() -> u64 {
    5
}

fn default_write_retries() -> u32 {
    3
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            grace_secs: default_grace(),
            start_timeout_secs: default_start_timeout(),
            probe_timeout_secs: default_probe_timeout(),
            write_timeout_secs: default_write_timeout(),
            write_retries: default_write_retries(),
        }
    }
}

impl MonitorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    pub fn grace(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.grace_secs as i64)
    }

    pub fn start_timeout(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.start_timeout_secs as i64)
    }
}

/// On-disk history location
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Prior versions kept for each rewritten file
    #[serde(default = "default_backup_generations")]
    pub backup_generations: usize,
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/keeper")
}

fn default_backup_generations() -> usize {
    3
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backup_generations: default_backup_generations(),
        }
    }
}

/// Control socket for start/stop requests
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    #[serde(default = "default_socket_path")]
    pub socket_path: PathBuf,
}

fn default_socket_path() -> PathBuf {
    PathBuf::from("/run/keeper/keeperd.sock")
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

/// Notification delivery
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotifyConfig {
    /// POST each notice as JSON to this URL (e.g. a chat bot relay)
    #[serde(default)]
    pub webhook_url: Option<String>,

    #[serde(default = "default_webhook_timeout")]
    pub webhook_timeout_secs: u64,
}

fn default_webhook_timeout() -> u64 {
    5
}

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub compose: ComposeConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub control: ControlConfig,

    #[serde(default)]
    pub notify: NotifyConfig,
}

impl Config {
    /// Load from `path`, or from [`CONFIG_PATH`] when `None`. A missing
    /// default file yields defaults; a missing explicit file is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(CONFIG_PATH), false),
        };

        if !path.exists() {
            if explicit {
                return Err(KeeperError::Config(format!(
                    "config file not found: {}",
                    path.display()
                )));
            }
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path).map_err(|e| KeeperError::persistence(&path, e))?;
        let config = Self::from_toml(&content)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)
            .map_err(|e| KeeperError::Config(format!("invalid TOML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.monitor;
        if m.poll_interval_secs == 0 {
            return Err(KeeperError::Config("monitor.poll_interval_secs must be > 0".into()));
        }
        if m.probe_timeout_secs == 0 || m.probe_timeout_secs >= m.poll_interval_secs {
            return Err(KeeperError::Config(format!(
                "monitor.probe_timeout_secs ({}) must be > 0 and shorter than poll_interval_secs ({})",
                m.probe_timeout_secs, m.poll_interval_secs
            )));
        }
        if m.start_timeout_secs == 0 {
            return Err(KeeperError::Config("monitor.start_timeout_secs must be > 0".into()));
        }
        if m.write_timeout_secs == 0 {
            return Err(KeeperError::Config("monitor.write_timeout_secs must be > 0".into()));
        }
        if m.write_retries == 0 {
            return Err(KeeperError::Config("monitor.write_retries must be >= 1".into()));
        }
        if m.grace_secs < m.poll_interval_secs {
            warn!(
                "grace window ({}s) is shorter than the poll interval ({}s); any unhealthy reading followed by another will stop the session",
                m.grace_secs, m.poll_interval_secs
            );
        }
        Ok(())
    }
}
