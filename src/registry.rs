//! Monitor registry: owns every running folder monitor.
//!
//! The host constructs one registry and passes it around; there is no
//! process-wide instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::FutureExt;

use crate::bridge::MailBridge;
use crate::bus::EventBus;
use crate::config::{Config, MonitorConfig};
use crate::monitor::{MonitorHandle, MonitorSettings, MonitorStatus, spawn_folder_monitor_after};

/// Invalid settings or requests. Returned synchronously to the caller.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("folder path must not be empty")]
    EmptyFolderPath,

    #[error("interval {interval:?} is shorter than the minimum of {min:?}")]
    IntervalTooShort { interval: Duration, min: Duration },

    #[error("interval {interval:?} is longer than the maximum of {max:?}")]
    IntervalTooLong { interval: Duration, max: Duration },

    #[error("max backoff {max_backoff:?} is below the minimum interval {min:?}")]
    BackoffBelowMinimum { max_backoff: Duration, min: Duration },

    #[error("bridge command must not be empty")]
    MissingBridgeCommand,

    #[error("bridge timeout must be at least one second")]
    ZeroBridgeTimeout,

    #[error("registry has been shut down")]
    ShutDown,
}

/// What `start_monitoring` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    Started,
    /// Same path and interval were already being monitored
    AlreadyMonitored,
    /// Running monitor kept its cached snapshot and switched interval
    Retimed { previous: Duration },
}

/// Limits applied to every monitor the registry starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrySettings {
    pub monitor: MonitorConfig,
    pub max_items: usize,
}

impl RegistrySettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            monitor: config.monitor.clone(),
            max_items: config.bridge.max_items,
        }
    }
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            monitor: MonitorConfig::default(),
            max_items: 500,
        }
    }
}

struct Entry {
    handle: MonitorHandle,
    interval: Duration,
}

struct Monitors {
    active: HashMap<String, Entry>,
    /// Stopped monitors whose in-flight scan may still be finishing
    retiring: Vec<MonitorHandle>,
    shut_down: bool,
}

/// Manages the set of monitored folders.
pub struct MonitorRegistry<B: MailBridge> {
    bridge: Arc<B>,
    bus: Arc<EventBus>,
    settings: RegistrySettings,
    monitors: Mutex<Monitors>,
}

impl<B: MailBridge> MonitorRegistry<B> {
    pub fn new(bridge: Arc<B>, bus: Arc<EventBus>, settings: RegistrySettings) -> Self {
        Self {
            bridge,
            bus,
            settings,
            monitors: Mutex::new(Monitors {
                active: HashMap::new(),
                retiring: Vec::new(),
                shut_down: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Monitors> {
        self.monitors
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bus the monitors publish to; subscribe here.
    pub fn events(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Start monitoring `folder_path` every `interval`.
    ///
    /// Calling it again for a monitored path is a no-op when the interval is
    /// unchanged; otherwise the running monitor is retimed in place and keeps
    /// its previous snapshot. Must be called from within a Tokio runtime.
    pub fn start_monitoring(
        &self,
        folder_path: &str,
        interval: Duration,
    ) -> Result<StartOutcome, ConfigurationError> {
        if folder_path.trim().is_empty() {
            return Err(ConfigurationError::EmptyFolderPath);
        }
        self.settings.monitor.check_interval(interval)?;

        let mut monitors = self.lock();
        if monitors.shut_down {
            return Err(ConfigurationError::ShutDown);
        }
        monitors.retiring.retain(|h| !h.is_finished());

        if let Some(entry) = monitors.active.get_mut(folder_path) {
            if entry.interval == interval {
                return Ok(StartOutcome::AlreadyMonitored);
            }
            let previous = entry.interval;
            entry.handle.set_interval(interval);
            entry.interval = interval;
            tracing::info!(
                "Retimed monitor for '{}' from {:?} to {:?}",
                folder_path,
                previous,
                interval
            );
            return Ok(StartOutcome::Retimed { previous });
        }

        // A stopped monitor of this folder may still be inside a bridge call
        let predecessors: Vec<_> = monitors
            .retiring
            .iter()
            .filter(|h| h.folder == folder_path)
            .map(MonitorHandle::finished)
            .collect();
        let predecessor = (!predecessors.is_empty())
            .then(|| futures::future::join_all(predecessors).map(|_| ()).boxed());

        let handle = spawn_folder_monitor_after(
            Arc::clone(&self.bridge),
            Arc::clone(&self.bus),
            folder_path.to_string(),
            MonitorSettings {
                interval,
                max_backoff: self.settings.monitor.max_backoff(),
                max_items: self.settings.max_items,
            },
            predecessor,
        );
        monitors
            .active
            .insert(folder_path.to_string(), Entry { handle, interval });

        tracing::info!("Spawned folder monitor for '{}'", folder_path);
        Ok(StartOutcome::Started)
    }

    /// Stop monitoring `folder_path`. Returns false if it wasn't monitored.
    pub fn stop_monitoring(&self, folder_path: &str) -> bool {
        let mut monitors = self.lock();
        monitors.retiring.retain(|h| !h.is_finished());

        let Some(entry) = monitors.active.remove(folder_path) else {
            return false;
        };
        entry.handle.stop();
        monitors.retiring.push(entry.handle);
        tracing::info!("Stopped folder monitor for '{}'", folder_path);
        true
    }

    /// Monitored folder paths, sorted.
    pub fn list_monitored(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.lock().active.keys().cloned().collect();
        paths.sort();
        paths
    }

    pub fn is_monitored(&self, folder_path: &str) -> bool {
        self.lock().active.contains_key(folder_path)
    }

    pub fn status(&self, folder_path: &str) -> Option<MonitorStatus> {
        self.lock()
            .active
            .get(folder_path)
            .map(|entry| entry.handle.status())
    }

    /// Status of every monitored folder, sorted by path.
    pub fn statuses(&self) -> Vec<MonitorStatus> {
        let mut statuses: Vec<MonitorStatus> = self
            .lock()
            .active
            .values()
            .map(|entry| entry.handle.status())
            .collect();
        statuses.sort_by(|a, b| a.folder.cmp(&b.folder));
        statuses
    }

    /// Ask a monitor to scan now. Dropped by the monitor if a scan is running.
    pub fn scan_now(&self, folder_path: &str) -> bool {
        self.lock()
            .active
            .get(folder_path)
            .is_some_and(|entry| entry.handle.scan_now())
    }

    /// Stop every monitor and wait for their tasks to exit.
    ///
    /// Waiting is bounded by the bridge timeout of any scan still in flight.
    /// Later `start_monitoring` calls fail with `ShutDown`.
    pub async fn shutdown(&self) {
        let handles: Vec<MonitorHandle> = {
            let mut monitors = self.lock();
            monitors.shut_down = true;
            let mut handles: Vec<MonitorHandle> =
                monitors.active.drain().map(|(_, entry)| entry.handle).collect();
            handles.append(&mut monitors.retiring);
            handles
        };

        tracing::info!("Shutting down {} folder monitors", handles.len());
        futures::future::join_all(handles.into_iter().map(MonitorHandle::shutdown)).await;
    }
}
