//! loadgrid.toml configuration parser.
//!
//! Every knob has a default, so an empty file (or no file) yields a
//! working single-machine configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Fleet-level configuration shared by master and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Seconds between heartbeats (also the master's supervision tick).
    pub heartbeat_interval_secs: f64,
    /// Missed heartbeats before a worker is declared missing.
    pub heartbeat_liveness: u32,
    /// Seconds an agent waits before retrying a failed transport send.
    pub fallback_interval_secs: f64,
    /// Per-instance graceful stop timeout in seconds.
    pub stop_timeout_secs: Option<f64>,
    /// Target host handed to workers with each spawn instruction.
    pub host: Option<String>,
    /// Worker CPU percentage above which the master warns (once per node).
    pub cpu_warning_threshold: f64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 1.0,
            heartbeat_liveness: 3,
            fallback_interval_secs: 5.0,
            stop_timeout_secs: None,
            host: None,
            cpu_warning_threshold: 90.0,
        }
    }
}

impl ClusterConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ClusterConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs_f64(self.heartbeat_interval_secs)
    }

    pub fn fallback_interval(&self) -> Duration {
        Duration::from_secs_f64(self.fallback_interval_secs)
    }

    pub fn stop_timeout(&self) -> Option<Duration> {
        self.stop_timeout_secs.map(Duration::from_secs_f64)
    }
}
