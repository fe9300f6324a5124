//! Configuration management (TOML)

use crate::monitor::{DEFAULT_REFRESH_INTERVAL, MIN_REFRESH_INTERVAL};
use crate::session::{DEFAULT_SAMPLING_INTERVAL, MIN_SAMPLING_INTERVAL};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub refresh: RefreshConfig,
    pub tracking: TrackingConfig,
    pub socket: SocketConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshConfig {
    pub auto_refresh: bool,
    pub interval_ms: u64,
    pub include_system_processes: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackingConfig {
    pub sampling_interval_ms: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        RefreshConfig {
            auto_refresh: true,
            interval_ms: DEFAULT_REFRESH_INTERVAL.as_millis() as u64,
            include_system_processes: true,
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            sampling_interval_ms: DEFAULT_SAMPLING_INTERVAL.as_millis() as u64,
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, content).with_context(|| format!("writing config {}", path.display()))?;
        Ok(())
    }

    /// Loads `path` if it exists, otherwise returns defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Config::default())
        }
    }

    pub fn config_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "proctrack")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Never below one second.
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh.interval_ms).max(MIN_REFRESH_INTERVAL)
    }

    /// Never below 500ms.
    pub fn sampling_interval(&self) -> Duration {
        Duration::from_millis(self.tracking.sampling_interval_ms).max(MIN_SAMPLING_INTERVAL)
    }
}
