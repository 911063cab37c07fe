//! Event payloads shared by the differencer, the monitors and every subscriber.

use std::time::Duration;

use serde::Serialize;

use crate::bridge::BridgeError;
use crate::snapshot::MessageSnapshotEntry;

/// A single classified difference between two snapshots of one folder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ChangeEvent {
    NewMessage {
        entry: MessageSnapshotEntry,
    },
    StatusChanged {
        identity: String,
        subject: String,
        previous_is_read: bool,
        new_is_read: bool,
    },
    SubjectChanged {
        identity: String,
        previous_subject: String,
        new_subject: String,
    },
    /// `last_modified_at` advanced but no tracked field changed
    GenericModified {
        identity: String,
        subject: String,
    },
    Deleted {
        identity: String,
        last_known_subject: String,
    },
    /// Folder-level; at most one per scan
    CountChanged {
        previous_total: usize,
        new_total: usize,
        delta: i64,
    },
}

impl ChangeEvent {
    /// Identity of the message this event is about, `None` for folder-level events.
    pub fn identity(&self) -> Option<&str> {
        match self {
            ChangeEvent::NewMessage { entry } => Some(&entry.identity),
            ChangeEvent::StatusChanged { identity, .. }
            | ChangeEvent::SubjectChanged { identity, .. }
            | ChangeEvent::GenericModified { identity, .. }
            | ChangeEvent::Deleted { identity, .. } => Some(identity),
            ChangeEvent::CountChanged { .. } => None,
        }
    }

    pub fn count_changed(previous_total: usize, new_total: usize) -> Self {
        ChangeEvent::CountChanged {
            previous_total,
            new_total,
            delta: new_total as i64 - previous_total as i64,
        }
    }
}

/// Lifecycle and health notices a monitor publishes alongside changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum MonitorNotice {
    /// First successful scan after start; per-message events are suppressed
    MonitoringStarted { total_count: usize },
    ScanFailed {
        error: BridgeError,
        consecutive_failures: u32,
        retry_in: Duration,
    },
    /// A scan succeeded after one or more failures
    Recovered { after_failures: u32 },
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "payload", rename_all = "camelCase")]
pub enum FolderEvent {
    Change(ChangeEvent),
    Notice(MonitorNotice),
}

impl From<ChangeEvent> for FolderEvent {
    fn from(event: ChangeEvent) -> Self {
        FolderEvent::Change(event)
    }
}

impl From<MonitorNotice> for FolderEvent {
    fn from(notice: MonitorNotice) -> Self {
        FolderEvent::Notice(notice)
    }
}

/// Event tagged with the folder it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MonitorEvent {
    pub folder: String,
    pub event: FolderEvent,
}

impl MonitorEvent {
    pub fn change(&self) -> Option<&ChangeEvent> {
        match &self.event {
            FolderEvent::Change(change) => Some(change),
            FolderEvent::Notice(_) => None,
        }
    }

    pub fn notice(&self) -> Option<&MonitorNotice> {
        match &self.event {
            FolderEvent::Notice(notice) => Some(notice),
            FolderEvent::Change(_) => None,
        }
    }
}
