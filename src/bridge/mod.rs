//! External mail bridge adapter.
//!
//! This module is split into:
//! - `mod.rs` - The `MailBridge` contract, fetch options and error type
//! - `process.rs` - Bridge backed by one external script invocation per call
//! - `wire.rs` - JSON document the script writes to stdout

mod process;
pub(crate) mod wire;

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::snapshot::FolderSnapshot;

pub use process::ScriptBridge;

/// Failures reported by a bridge. All of them are retryable by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[serde(tag = "kind", content = "detail", rename_all = "camelCase")]
pub enum BridgeError {
    /// No response inside the deadline; the external process was killed
    #[error("bridge did not answer within {0:?}")]
    Timeout(Duration),

    #[error("folder not found: {0}")]
    NotFound(String),

    /// Internal bridge error, spawn failure or unparseable output
    #[error("bridge fault: {0}")]
    Fault(String),
}

/// Per-call fetch parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOptions {
    /// Upper bound on returned entries; the bridge may cap lower
    pub max_items: usize,
    /// Advisory lower bound on receive time
    pub since: Option<DateTime<Utc>>,
}

impl FetchOptions {
    pub fn new(max_items: usize) -> Self {
        Self {
            max_items,
            since: None,
        }
    }
}

/// Request/response access to the external mail store.
///
/// Implementations hold no connection between calls and never retry
/// internally; retry policy belongs to the folder monitor.
pub trait MailBridge: Send + Sync + 'static {
    fn fetch_snapshot(
        &self,
        folder_path: &str,
        options: &FetchOptions,
    ) -> impl Future<Output = Result<FolderSnapshot, BridgeError>> + Send;
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory bridge for monitor and registry tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::{BridgeError, FetchOptions, FolderSnapshot, MailBridge};

    pub struct MockBridge {
        responses: Mutex<VecDeque<Result<FolderSnapshot, BridgeError>>>,
        /// Returned once the scripted responses run out
        fallback: Mutex<Option<Result<FolderSnapshot, BridgeError>>>,
        delay: Duration,
        calls: AtomicUsize,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl MockBridge {
        pub fn new(delay: Duration) -> Self {
            Self {
                responses: Mutex::new(VecDeque::new()),
                fallback: Mutex::new(None),
                delay,
                calls: AtomicUsize::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }

        pub fn push(&self, response: Result<FolderSnapshot, BridgeError>) {
            self.responses.lock().unwrap().push_back(response);
        }

        pub fn set_fallback(&self, response: Result<FolderSnapshot, BridgeError>) {
            *self.fallback.lock().unwrap() = Some(response);
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub fn max_in_flight(&self) -> usize {
            self.max_in_flight.load(Ordering::SeqCst)
        }

        fn next_response(&self, folder_path: &str) -> Result<FolderSnapshot, BridgeError> {
            if let Some(response) = self.responses.lock().unwrap().pop_front() {
                return response;
            }
            self.fallback
                .lock()
                .unwrap()
                .clone()
                .unwrap_or_else(|| Err(BridgeError::NotFound(folder_path.to_string())))
        }
    }

    impl MailBridge for MockBridge {
        async fn fetch_snapshot(
            &self,
            folder_path: &str,
            _options: &FetchOptions,
        ) -> Result<FolderSnapshot, BridgeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);

            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }

            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.next_response(folder_path)
        }
    }
}
