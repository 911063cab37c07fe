//! Snapshot differencer.
//!
//! Compares two snapshots of the same folder by identity and produces the
//! change events in a fixed order:
//! 1. `NewMessage` in current enumeration order
//! 2. `StatusChanged` / `SubjectChanged` / `GenericModified` in current order
//! 3. `Deleted` in previous enumeration order
//! 4. at most one `CountChanged`

use std::collections::HashMap;

use crate::events::ChangeEvent;
use crate::snapshot::{FolderSnapshot, MessageSnapshotEntry};

/// Compute the changes that turn `previous` into `current`.
///
/// With no previous snapshot every current entry is reported as new and no
/// count change is emitted.
pub fn diff(previous: Option<&FolderSnapshot>, current: &FolderSnapshot) -> Vec<ChangeEvent> {
    let mut lookup: HashMap<&str, &MessageSnapshotEntry> = previous
        .map(|snapshot| {
            snapshot
                .entries()
                .iter()
                .map(|entry| (entry.identity.as_str(), entry))
                .collect()
        })
        .unwrap_or_default();

    let mut added = Vec::new();
    let mut modified = Vec::new();

    for entry in current.entries() {
        let Some(before) = lookup.remove(entry.identity.as_str()) else {
            added.push(ChangeEvent::NewMessage {
                entry: entry.clone(),
            });
            continue;
        };
        classify_modification(before, entry, &mut modified);
    }

    let mut events = added;
    events.append(&mut modified);

    if let Some(previous) = previous {
        // Whatever is left in the lookup vanished from the folder
        events.extend(
            previous
                .entries()
                .iter()
                .filter(|entry| lookup.contains_key(entry.identity.as_str()))
                .map(|entry| ChangeEvent::Deleted {
                    identity: entry.identity.clone(),
                    last_known_subject: entry.subject.clone(),
                }),
        );

        if previous.total_count != current.total_count {
            events.push(ChangeEvent::count_changed(
                previous.total_count,
                current.total_count,
            ));
        }
    }

    events
}

/// Status and subject changes fire independently; `GenericModified` only
/// when neither did.
fn classify_modification(
    before: &MessageSnapshotEntry,
    after: &MessageSnapshotEntry,
    out: &mut Vec<ChangeEvent>,
) {
    let mut tracked_change = false;

    if before.is_read != after.is_read {
        out.push(ChangeEvent::StatusChanged {
            identity: after.identity.clone(),
            subject: after.subject.clone(),
            previous_is_read: before.is_read,
            new_is_read: after.is_read,
        });
        tracked_change = true;
    }

    if before.subject != after.subject {
        out.push(ChangeEvent::SubjectChanged {
            identity: after.identity.clone(),
            previous_subject: before.subject.clone(),
            new_subject: after.subject.clone(),
        });
        tracked_change = true;
    }

    if !tracked_change && after.modified_since(before) {
        out.push(ChangeEvent::GenericModified {
            identity: after.identity.clone(),
            subject: after.subject.clone(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn entry(id: &str) -> MessageSnapshotEntry {
        MessageSnapshotEntry::new(id, format!("subject {}", id), at(100))
    }

    fn snapshot(entries: Vec<MessageSnapshotEntry>) -> FolderSnapshot {
        FolderSnapshot::complete("Inbox", entries, at(1000))
    }

    fn kinds(events: &[ChangeEvent]) -> Vec<&'static str> {
        events
            .iter()
            .map(|e| match e {
                ChangeEvent::NewMessage { .. } => "new",
                ChangeEvent::StatusChanged { .. } => "status",
                ChangeEvent::SubjectChanged { .. } => "subject",
                ChangeEvent::GenericModified { .. } => "modified",
                ChangeEvent::Deleted { .. } => "deleted",
                ChangeEvent::CountChanged { .. } => "count",
            })
            .collect()
    }

    #[test]
    fn test_overlapping_sets_yield_one_new_and_one_deleted() {
        let a = snapshot(vec![entry("i1"), entry("i2"), entry("i3")]);
        let b = snapshot(vec![entry("i2"), entry("i3"), entry("i4")]);

        let events = diff(Some(&a), &b);

        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], ChangeEvent::NewMessage { entry } if entry.identity == "i4"));
        assert_eq!(
            events[1],
            ChangeEvent::Deleted {
                identity: "i1".to_string(),
                last_known_subject: "subject i1".to_string(),
            }
        );
    }

    #[test]
    fn test_same_snapshot_twice_is_silent() {
        let a = snapshot(vec![entry("i1"), entry("i2")]);
        assert!(diff(Some(&a), &a).is_empty());
    }

    #[test]
    fn test_first_run_reports_only_new_messages() {
        let a = snapshot(vec![entry("i1"), entry("i2"), entry("i3")]);
        let events = diff(None, &a);

        assert_eq!(kinds(&events), vec!["new", "new", "new"]);
        let ids: Vec<_> = events.iter().filter_map(|e| e.identity()).collect();
        assert_eq!(ids, vec!["i1", "i2", "i3"]);
    }

    #[test]
    fn test_read_flip_is_status_change_only() {
        let a = snapshot(vec![entry("i1"), entry("i2")]);
        let mut read = entry("i2");
        read.is_read = true;
        read.last_modified_at = Some(at(500));
        let b = snapshot(vec![entry("i1"), read]);

        let events = diff(Some(&a), &b);

        assert_eq!(
            events,
            vec![ChangeEvent::StatusChanged {
                identity: "i2".to_string(),
                subject: "subject i2".to_string(),
                previous_is_read: false,
                new_is_read: true,
            }]
        );
    }

    #[test]
    fn test_status_and_subject_both_fire() {
        let a = snapshot(vec![entry("i1")]);
        let mut changed = entry("i1");
        changed.is_read = true;
        changed.subject = "edited".to_string();
        changed.last_modified_at = Some(at(900));
        let b = snapshot(vec![changed]);

        assert_eq!(kinds(&diff(Some(&a), &b)), vec!["status", "subject"]);
    }

    #[test]
    fn test_generic_modified_when_only_timestamp_advances() {
        let mut before = entry("i1");
        before.last_modified_at = Some(at(200));
        let mut after = before.clone();
        after.last_modified_at = Some(at(300));
        after.has_attachment = true;

        let events = diff(Some(&snapshot(vec![before])), &snapshot(vec![after]));
        assert_eq!(
            events,
            vec![ChangeEvent::GenericModified {
                identity: "i1".to_string(),
                subject: "subject i1".to_string(),
            }]
        );
    }

    #[test]
    fn test_unchanged_timestamp_is_not_generic_modified() {
        let mut before = entry("i1");
        before.last_modified_at = Some(at(200));
        let mut after = before.clone();
        after.sender_address = Some("someone@example.com".to_string());

        assert!(diff(Some(&snapshot(vec![before])), &snapshot(vec![after])).is_empty());
    }

    #[test]
    fn test_empty_current_deletes_everything() {
        let a = snapshot(vec![entry("i1"), entry("i2")]);
        let b = snapshot(vec![]);

        let events = diff(Some(&a), &b);
        assert_eq!(kinds(&events), vec!["deleted", "deleted", "count"]);
        assert_eq!(events[0].identity(), Some("i1"));
        assert_eq!(events[1].identity(), Some("i2"));
        assert_eq!(events[2], ChangeEvent::count_changed(2, 0));
    }

    #[test]
    fn test_fixed_event_order() {
        let mut a_entries = vec![entry("keep"), entry("gone-1"), entry("flip"), entry("gone-2")];
        a_entries[0].last_modified_at = Some(at(1));
        let a = FolderSnapshot::new("Inbox", a_entries, 4, at(1));

        let mut flip = entry("flip");
        flip.is_read = true;
        let mut keep = entry("keep");
        keep.last_modified_at = Some(at(2));
        let b = FolderSnapshot::new(
            "Inbox",
            vec![flip, entry("new-1"), keep, entry("new-2")],
            5,
            at(2),
        );

        let events = diff(Some(&a), &b);
        assert_eq!(
            kinds(&events),
            vec!["new", "new", "status", "modified", "deleted", "deleted", "count"]
        );
        let ids: Vec<_> = events.iter().filter_map(|e| e.identity()).collect();
        assert_eq!(ids, vec!["new-1", "new-2", "flip", "keep", "gone-1", "gone-2"]);
        assert_eq!(events[6], ChangeEvent::count_changed(4, 5));
    }

    #[test]
    fn test_count_change_without_entry_changes() {
        let a = FolderSnapshot::new("Inbox", vec![entry("i1")], 40, at(1));
        let b = FolderSnapshot::new("Inbox", vec![entry("i1")], 42, at(2));
        assert_eq!(diff(Some(&a), &b), vec![ChangeEvent::count_changed(40, 42)]);
    }
}
