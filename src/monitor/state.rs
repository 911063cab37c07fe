//! Per-folder monitor state machine, free of I/O.
//!
//! ```text
//! Idle ──tick──▶ Scanning ──ok──▶ Idle
//!                   │
//!                   └──err──▶ Backoff ──tick──▶ Scanning
//! Idle / Backoff / Scanning ──stop──▶ Stopped
//! ```
//!
//! A tick that arrives while `Scanning` is dropped, which is what keeps at
//! most one bridge call in flight per folder.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::backoff::BackoffPolicy;
use crate::bridge::BridgeError;
use crate::diff::diff;
use crate::events::{FolderEvent, MonitorNotice};
use crate::snapshot::FolderSnapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitorPhase {
    Idle,
    Scanning,
    Backoff,
    Stopped,
}

/// What to do with an incoming tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickDecision {
    /// Start a bridge call now
    Scan,
    /// A scan is already in flight
    Dropped,
    /// Monitor is stopped
    Stopped,
}

/// Result of feeding a finished bridge call into the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Events to publish, in order
    pub events: Vec<FolderEvent>,
    pub next_tick_in: Duration,
}

/// Read-only view of a monitor for hosts and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatus {
    pub folder: String,
    pub phase: MonitorPhase,
    pub interval: Duration,
    pub consecutive_failures: u32,
    pub last_scan_at: Option<DateTime<Utc>>,
    pub last_total: Option<usize>,
    pub last_error: Option<BridgeError>,
    /// Ticks dropped because a scan was still in flight
    pub dropped_ticks: u64,
}

#[derive(Debug)]
pub struct MonitorState {
    folder_path: String,
    phase: MonitorPhase,
    /// Owned exclusively here; replaced only after a successful scan
    previous_snapshot: Option<FolderSnapshot>,
    consecutive_failures: u32,
    last_scan_at: Option<DateTime<Utc>>,
    last_error: Option<BridgeError>,
    backoff: BackoffPolicy,
    dropped_ticks: u64,
}

impl MonitorState {
    pub fn new(folder_path: impl Into<String>, backoff: BackoffPolicy) -> Self {
        Self {
            folder_path: folder_path.into(),
            phase: MonitorPhase::Idle,
            previous_snapshot: None,
            consecutive_failures: 0,
            last_scan_at: None,
            last_error: None,
            backoff,
            dropped_ticks: 0,
        }
    }

    pub fn folder_path(&self) -> &str {
        &self.folder_path
    }

    pub fn phase(&self) -> MonitorPhase {
        self.phase
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn interval(&self) -> Duration {
        self.backoff.base
    }

    pub fn previous_snapshot(&self) -> Option<&FolderSnapshot> {
        self.previous_snapshot.as_ref()
    }

    /// Change the poll interval; takes effect from the next scheduled tick.
    pub fn set_interval(&mut self, interval: Duration) {
        self.backoff.base = interval;
    }

    /// Delay until the next tick given the current failure count.
    pub fn current_delay(&self) -> Duration {
        self.backoff.delay_for(self.consecutive_failures)
    }

    pub fn on_tick(&mut self) -> TickDecision {
        match self.phase {
            MonitorPhase::Idle | MonitorPhase::Backoff => {
                self.phase = MonitorPhase::Scanning;
                TickDecision::Scan
            }
            MonitorPhase::Scanning => {
                self.dropped_ticks += 1;
                TickDecision::Dropped
            }
            MonitorPhase::Stopped => TickDecision::Stopped,
        }
    }

    /// Feed a finished bridge call. Returns `None` when the result must be
    /// discarded because the monitor was stopped while the call was running.
    pub fn on_scan_complete(
        &mut self,
        result: Result<FolderSnapshot, BridgeError>,
        now: DateTime<Utc>,
    ) -> Option<ScanOutcome> {
        if self.phase != MonitorPhase::Scanning {
            return None;
        }

        match result {
            Ok(snapshot) => Some(self.on_success(snapshot, now)),
            Err(error) => Some(self.on_failure(error)),
        }
    }

    fn on_success(&mut self, snapshot: FolderSnapshot, now: DateTime<Utc>) -> ScanOutcome {
        let mut events = Vec::new();

        if self.consecutive_failures > 0 {
            events.push(
                MonitorNotice::Recovered {
                    after_failures: self.consecutive_failures,
                }
                .into(),
            );
        }

        if snapshot.is_truncated() {
            tracing::debug!(
                "Monitor '{}': bridge returned {} of {} messages",
                self.folder_path,
                snapshot.len(),
                snapshot.total_count
            );
        }

        match self.previous_snapshot.as_ref() {
            // Priming scan: announce the baseline instead of flooding with NewMessage
            None => events.push(
                MonitorNotice::MonitoringStarted {
                    total_count: snapshot.total_count,
                }
                .into(),
            ),
            Some(previous) => {
                events.extend(diff(Some(previous), &snapshot).into_iter().map(FolderEvent::from))
            }
        }

        self.previous_snapshot = Some(snapshot);
        self.consecutive_failures = 0;
        self.last_error = None;
        self.last_scan_at = Some(now);
        self.phase = MonitorPhase::Idle;

        ScanOutcome {
            events,
            next_tick_in: self.backoff.base,
        }
    }

    fn on_failure(&mut self, error: BridgeError) -> ScanOutcome {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.phase = MonitorPhase::Backoff;
        self.last_error = Some(error.clone());

        let retry_in = self.backoff.delay_for(self.consecutive_failures);
        tracing::warn!(
            "Monitor '{}': scan failed ({} in a row): {}. Retrying in {:?}",
            self.folder_path,
            self.consecutive_failures,
            error,
            retry_in
        );

        ScanOutcome {
            events: vec![
                MonitorNotice::ScanFailed {
                    error,
                    consecutive_failures: self.consecutive_failures,
                    retry_in,
                }
                .into(),
            ],
            next_tick_in: retry_in,
        }
    }

    /// Move to `Stopped`. Returns false if already stopped.
    pub fn stop(&mut self) -> bool {
        if self.phase == MonitorPhase::Stopped {
            return false;
        }
        self.phase = MonitorPhase::Stopped;
        true
    }

    pub fn status(&self) -> MonitorStatus {
        MonitorStatus {
            folder: self.folder_path.clone(),
            phase: self.phase,
            interval: self.backoff.base,
            consecutive_failures: self.consecutive_failures,
            last_scan_at: self.last_scan_at,
            last_total: self.previous_snapshot.as_ref().map(|s| s.total_count),
            last_error: self.last_error.clone(),
            dropped_ticks: self.dropped_ticks,
        }
    }
}
