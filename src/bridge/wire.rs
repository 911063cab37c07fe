//! JSON document written by the bridge script on stdout.
//!
//! A successful run prints a snapshot document:
//! `{"totalCount": 12, "capturedAt": "...", "items": [{"identity": "...", ...}]}`
//!
//! A run that fails in a way the script understands prints an error document:
//! `{"error": {"code": "not_found", "message": "..."}}`
//!
//! Anything else is a fault. In particular a document without `items` is
//! never read as an empty folder.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::BridgeError;
use crate::snapshot::{FolderSnapshot, MessageSnapshotEntry};

/// Prefix marking identities synthesized locally.
pub const DERIVED_IDENTITY_PREFIX: &str = "derived:";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BridgeDocument {
    Error { error: ErrorBody },
    Snapshot(SnapshotBody),
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotBody {
    #[serde(default)]
    total_count: Option<usize>,
    #[serde(default)]
    captured_at: Option<DateTime<Utc>>,
    items: Vec<WireEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireEntry {
    #[serde(default)]
    identity: Option<String>,
    #[serde(default)]
    subject: Option<String>,
    #[serde(default)]
    is_read: bool,
    received_at: DateTime<Utc>,
    #[serde(default)]
    last_modified_at: Option<DateTime<Utc>>,
    #[serde(default)]
    sender_address: Option<String>,
    #[serde(default)]
    has_attachment: bool,
}

impl WireEntry {
    /// `derived` counts derived identities already handed out in this document.
    fn into_entry(self, derived: &mut HashMap<String, usize>) -> MessageSnapshotEntry {
        let subject = self.subject.unwrap_or_default();
        let identity = match self.identity {
            Some(id) if !id.trim().is_empty() => id,
            _ => {
                let base =
                    derive_identity(self.received_at, self.sender_address.as_deref(), &subject);
                // Identical keyless messages get numbered in enumeration order
                let seen = derived.entry(base.clone()).or_insert(0);
                let identity = if *seen == 0 {
                    base
                } else {
                    format!("{}-{}", base, seen)
                };
                *seen += 1;
                identity
            }
        };

        MessageSnapshotEntry {
            identity,
            subject,
            is_read: self.is_read,
            received_at: self.received_at,
            last_modified_at: self.last_modified_at,
            sender_address: self.sender_address,
            has_attachment: self.has_attachment,
        }
    }
}

/// Identity for entries the bridge could not key.
///
/// Stable only while receive time, sender and subject stay unchanged.
pub fn derive_identity(received_at: DateTime<Utc>, sender: Option<&str>, subject: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(received_at.to_rfc3339().as_bytes());
    hasher.update([0u8]);
    hasher.update(sender.unwrap_or_default().as_bytes());
    hasher.update([0u8]);
    hasher.update(subject.as_bytes());
    let digest = hasher.finalize();

    let hex: String = digest[..16].iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", DERIVED_IDENTITY_PREFIX, hex)
}

/// Parse bridge stdout into a snapshot or a typed bridge error.
pub fn parse_output(folder_path: &str, stdout: &str) -> Result<FolderSnapshot, BridgeError> {
    let trimmed = stdout.trim();
    if trimmed.is_empty() {
        return Err(BridgeError::Fault("bridge produced no output".to_string()));
    }

    let value: serde_json::Value = serde_json::from_str(trimmed)
        .map_err(|e| BridgeError::Fault(format!("unparseable bridge output: {}", e)))?;
    if !value.is_object() {
        return Err(BridgeError::Fault(
            "bridge output is not a JSON object".to_string(),
        ));
    }

    let document: BridgeDocument = serde_json::from_value(value).map_err(|_| {
        BridgeError::Fault("bridge output is neither a snapshot nor an error document".to_string())
    })?;

    match document {
        BridgeDocument::Error { error } => Err(error_from_body(folder_path, error)),
        BridgeDocument::Snapshot(body) => {
            let mut derived = HashMap::new();
            let entries: Vec<MessageSnapshotEntry> = body
                .items
                .into_iter()
                .map(|item| item.into_entry(&mut derived))
                .collect();
            let total = body.total_count.unwrap_or(entries.len());
            let captured_at = body.captured_at.unwrap_or_else(Utc::now);
            Ok(FolderSnapshot::new(folder_path, entries, total, captured_at))
        }
    }
}

/// Error document printed by a script that exited non-zero, if any.
pub fn error_document(folder_path: &str, stdout: &str) -> Option<BridgeError> {
    #[derive(Deserialize)]
    struct ErrorOnly {
        error: ErrorBody,
    }

    serde_json::from_str::<ErrorOnly>(stdout.trim())
        .ok()
        .map(|doc| error_from_body(folder_path, doc.error))
}

fn error_from_body(folder_path: &str, body: ErrorBody) -> BridgeError {
    let message = if body.message.is_empty() {
        folder_path.to_string()
    } else {
        body.message
    };

    match body.code.to_ascii_lowercase().as_str() {
        "not_found" | "notfound" | "folder_not_found" => BridgeError::NotFound(message),
        _ => BridgeError::Fault(message),
    }
}
