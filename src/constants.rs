//! Application-wide constants for tuning and configuration
//!
//! Centralizes magic numbers to make them discoverable and configurable.

/// Log filter used when `RUST_LOG` is not set.
pub const DEFAULT_LOG_FILTER: &str = "info,folderwatch=debug";

/// Log file name inside the data directory.
pub const LOG_FILE_NAME: &str = "folderwatch.log";

/// Number of trailing stderr lines kept in a bridge fault message.
/// Bridge scripts tend to print a stack trace; the tail carries the cause.
pub const STDERR_TAIL_LINES: usize = 5;

/// Desktop notification display time in milliseconds.
pub const NOTIFICATION_TIMEOUT_MS: u32 = 5000;

/// Maximum subject length shown in a notification body, in characters.
pub const SUBJECT_PREVIEW_CHARS: usize = 100;

/// Entries printed by `folderwatch check`.
pub const CHECK_LIST_LIMIT: usize = 20;
