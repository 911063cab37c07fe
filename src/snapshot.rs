use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One observed message at a point in time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageSnapshotEntry {
    /// Join key across scans of the same folder
    pub identity: String,
    pub subject: String,
    pub is_read: bool,
    pub received_at: DateTime<Utc>,
    /// Used to tell "modified" apart from "unchanged"
    pub last_modified_at: Option<DateTime<Utc>>,
    pub sender_address: Option<String>,
    pub has_attachment: bool,
}

impl MessageSnapshotEntry {
    /// Create an unread entry with no sender, attachment or modification time.
    pub fn new(
        identity: impl Into<String>,
        subject: impl Into<String>,
        received_at: DateTime<Utc>,
    ) -> Self {
        Self {
            identity: identity.into(),
            subject: subject.into(),
            is_read: false,
            received_at,
            last_modified_at: None,
            sender_address: None,
            has_attachment: false,
        }
    }

    /// Whether `self` carries a strictly later modification stamp than `earlier`.
    pub fn modified_since(&self, earlier: &MessageSnapshotEntry) -> bool {
        match (self.last_modified_at, earlier.last_modified_at) {
            (Some(now), Some(before)) => now > before,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Full set of entries for one folder at one scan instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderSnapshot {
    pub folder: String,
    /// Entries in bridge enumeration order, unique by identity
    entries: Vec<MessageSnapshotEntry>,
    pub captured_at: DateTime<Utc>,
    /// Messages in the folder; can exceed `entries.len()` when the bridge truncates
    pub total_count: usize,
}

impl FolderSnapshot {
    /// Build a snapshot, dropping entries whose identity was already seen.
    ///
    /// `total_count` is raised to at least the number of kept entries, so a
    /// bridge that under-reports never produces a snapshot that contradicts
    /// its own contents.
    pub fn new(
        folder: impl Into<String>,
        entries: Vec<MessageSnapshotEntry>,
        total_count: usize,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let folder = folder.into();
        let mut seen = HashSet::with_capacity(entries.len());
        let mut unique = Vec::with_capacity(entries.len());

        for entry in entries {
            if seen.insert(entry.identity.clone()) {
                unique.push(entry);
            } else {
                tracing::warn!(
                    "Snapshot of '{}' repeats identity '{}', keeping the first occurrence",
                    folder,
                    entry.identity
                );
            }
        }

        let total_count = total_count.max(unique.len());
        Self {
            folder,
            entries: unique,
            captured_at,
            total_count,
        }
    }

    /// Snapshot whose total equals its entry count.
    pub fn complete(
        folder: impl Into<String>,
        entries: Vec<MessageSnapshotEntry>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        let total = entries.len();
        Self::new(folder, entries, total, captured_at)
    }

    pub fn entries(&self) -> &[MessageSnapshotEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// True when the bridge enumerated fewer entries than the folder holds.
    pub fn is_truncated(&self) -> bool {
        self.total_count > self.entries.len()
    }

    pub fn unread_count(&self) -> usize {
        self.entries.iter().filter(|e| !e.is_read).count()
    }

    pub fn get(&self, identity: &str) -> Option<&MessageSnapshotEntry> {
        self.entries.iter().find(|e| e.identity == identity)
    }
}
