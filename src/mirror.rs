//! In-memory projection of a folder built from change events.
//!
//! Each `ChangeEvent` maps to exactly one write against a store keyed by
//! message identity. Hosts that persist the mirror translate `MirrorWrite`
//! into an upsert or delete row operation.

use std::collections::HashMap;

use serde::Serialize;

use crate::events::ChangeEvent;
use crate::snapshot::{FolderSnapshot, MessageSnapshotEntry};

/// Store operation produced by applying one event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", content = "identity", rename_all = "camelCase")]
pub enum MirrorWrite {
    Upsert(String),
    Delete(String),
    /// Folder total changed; no message row touched
    Total,
    /// Event referred to a message the mirror doesn't hold
    Skipped,
}

#[derive(Debug, Clone, Default)]
pub struct FolderMirror {
    folder: String,
    messages: HashMap<String, MessageSnapshotEntry>,
    total_count: usize,
}

impl FolderMirror {
    pub fn new(folder: impl Into<String>) -> Self {
        Self {
            folder: folder.into(),
            messages: HashMap::new(),
            total_count: 0,
        }
    }

    /// Seed from a baseline snapshot, as after a priming scan.
    pub fn from_snapshot(snapshot: &FolderSnapshot) -> Self {
        Self {
            folder: snapshot.folder.clone(),
            messages: snapshot
                .entries()
                .iter()
                .map(|e| (e.identity.clone(), e.clone()))
                .collect(),
            total_count: snapshot.total_count,
        }
    }

    pub fn folder(&self) -> &str {
        &self.folder
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn total_count(&self) -> usize {
        self.total_count
    }

    pub fn get(&self, identity: &str) -> Option<&MessageSnapshotEntry> {
        self.messages.get(identity)
    }

    pub fn unread_count(&self) -> usize {
        self.messages.values().filter(|m| !m.is_read).count()
    }

    /// Identities currently held, sorted.
    pub fn identities(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.messages.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn apply(&mut self, event: &ChangeEvent) -> MirrorWrite {
        match event {
            ChangeEvent::NewMessage { entry } => {
                if self
                    .messages
                    .insert(entry.identity.clone(), entry.clone())
                    .is_none()
                {
                    self.total_count += 1;
                }
                MirrorWrite::Upsert(entry.identity.clone())
            }
            ChangeEvent::StatusChanged {
                identity,
                new_is_read,
                ..
            } => self.update(identity, |m| m.is_read = *new_is_read),
            ChangeEvent::SubjectChanged {
                identity,
                new_subject,
                ..
            } => self.update(identity, |m| m.subject = new_subject.clone()),
            ChangeEvent::GenericModified { identity, .. } => self.update(identity, |_| {}),
            ChangeEvent::Deleted { identity, .. } => match self.messages.remove(identity) {
                Some(_) => {
                    self.total_count = self.total_count.saturating_sub(1);
                    MirrorWrite::Delete(identity.clone())
                }
                None => MirrorWrite::Skipped,
            },
            // Authoritative; replaces the running estimate
            ChangeEvent::CountChanged { new_total, .. } => {
                self.total_count = *new_total;
                MirrorWrite::Total
            }
        }
    }

    pub fn apply_all<'a>(
        &mut self,
        events: impl IntoIterator<Item = &'a ChangeEvent>,
    ) -> Vec<MirrorWrite> {
        events.into_iter().map(|e| self.apply(e)).collect()
    }

    fn update(&mut self, identity: &str, f: impl FnOnce(&mut MessageSnapshotEntry)) -> MirrorWrite {
        match self.messages.get_mut(identity) {
            Some(message) => {
                f(message);
                MirrorWrite::Upsert(identity.to_string())
            }
            None => {
                tracing::debug!(
                    "Mirror '{}': change for unknown message {}",
                    self.folder,
                    identity
                );
                MirrorWrite::Skipped
            }
        }
    }
}
