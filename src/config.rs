use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::registry::ConfigurationError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// External script that enumerates a folder
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Desktop notification settings
    #[serde(default)]
    pub notifications: NotificationConfig,
    /// Folders to watch on startup
    #[serde(default)]
    pub folders: Vec<FolderConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Program to run, e.g. "osascript" or "powershell"
    pub command: String,
    /// Arguments placed before the folder path
    #[serde(default)]
    pub args: Vec<String>,
    /// Hard deadline for one invocation; the process is killed afterwards
    #[serde(default = "default_bridge_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_items")]
    pub max_items: usize,
    /// Exit code the script uses for "folder does not exist"
    #[serde(default = "default_not_found_exit_code")]
    pub not_found_exit_code: Option<i32>,
}

impl BridgeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Poll interval for folders that don't set their own
    #[serde(default = "default_interval_secs")]
    pub default_interval_secs: u64,
    /// Smallest interval `start_monitoring` accepts
    #[serde(default = "default_min_interval_ms")]
    pub min_interval_ms: u64,
    #[serde(default = "default_max_interval_secs")]
    pub max_interval_secs: u64,
    /// Ceiling for the failure backoff delay
    #[serde(default = "default_max_backoff_secs")]
    pub max_backoff_secs: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval_secs(),
            min_interval_ms: default_min_interval_ms(),
            max_interval_secs: default_max_interval_secs(),
            max_backoff_secs: default_max_backoff_secs(),
        }
    }
}

impl MonitorConfig {
    pub fn default_interval(&self) -> Duration {
        Duration::from_secs(self.default_interval_secs)
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_secs(self.max_interval_secs)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }

    /// Check an interval against the configured bounds.
    pub fn check_interval(&self, interval: Duration) -> Result<(), ConfigurationError> {
        if interval < self.min_interval() {
            return Err(ConfigurationError::IntervalTooShort {
                interval,
                min: self.min_interval(),
            });
        }
        if interval > self.max_interval() {
            return Err(ConfigurationError::IntervalTooLong {
                interval,
                max: self.max_interval(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationConfig {
    /// Enable desktop notifications for new mail
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Show email subject in notification
    #[serde(default = "default_true")]
    pub show_preview: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            show_preview: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FolderConfig {
    /// Folder path in the bridge's own addressing scheme
    pub path: String,
    /// Overrides `monitor.default_interval_secs`
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Per-folder notification override (None = use global setting)
    #[serde(default)]
    pub notifications: Option<bool>,
}

fn default_bridge_timeout_secs() -> u64 {
    30
}

fn default_max_items() -> usize {
    500
}

fn default_not_found_exit_code() -> Option<i32> {
    Some(2)
}

fn default_interval_secs() -> u64 {
    60
}

fn default_min_interval_ms() -> u64 {
    1000
}

fn default_max_interval_secs() -> u64 {
    86_400
}

fn default_max_backoff_secs() -> u64 {
    600
}

fn default_true() -> bool {
    true
}

impl Config {
    pub fn config_dir() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .context("Could not find config directory")?
            .join("folderwatch");
        Ok(dir)
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::config_dir()?.join("config.toml"))
    }

    pub fn data_dir() -> Result<PathBuf> {
        let dir = dirs::data_local_dir()
            .context("Could not find data directory")?
            .join("folderwatch");
        Ok(dir)
    }

    /// Interval for a configured folder, falling back to the monitor default.
    pub fn interval_for(&self, folder: &FolderConfig) -> Duration {
        folder
            .interval_secs
            .map(Duration::from_secs)
            .unwrap_or_else(|| self.monitor.default_interval())
    }

    /// Check if notifications are enabled for a folder path
    pub fn notifications_enabled_for(&self, path: &str) -> bool {
        // Per-folder setting overrides global
        self.folders
            .iter()
            .find(|f| f.path == path)
            .and_then(|f| f.notifications)
            .unwrap_or(self.notifications.enabled)
    }

    /// Load from the default location.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!(
                "Configuration file not found at {}\n\
                 Please create a config file. Example:\n\n\
                 [bridge]\n\
                 command = \"osascript\"\n\
                 args = [\"snapshot.scpt\"]\n\n\
                 [[folders]]\n\
                 path = \"Inbox\"\n\
                 interval_secs = 30",
                path.display()
            );
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the registry would refuse at runtime.
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.bridge.command.trim().is_empty() {
            return Err(ConfigurationError::MissingBridgeCommand);
        }
        if self.bridge.timeout_secs == 0 {
            return Err(ConfigurationError::ZeroBridgeTimeout);
        }
        if self.monitor.max_backoff() < self.monitor.min_interval() {
            return Err(ConfigurationError::BackoffBelowMinimum {
                max_backoff: self.monitor.max_backoff(),
                min: self.monitor.min_interval(),
            });
        }

        for folder in &self.folders {
            if folder.path.trim().is_empty() {
                return Err(ConfigurationError::EmptyFolderPath);
            }
            self.monitor.check_interval(self.interval_for(folder))?;
        }

        Ok(())
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(Self::config_dir()?)?;
        fs::create_dir_all(Self::data_dir()?)?;
        Ok(())
    }
}
