//! Event bus: fans monitor events out to subscribers.
//!
//! Delivery is synchronous and in publish order. A failing or panicking
//! handler is logged and counted, and the remaining handlers still run.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;

use crate::events::{FolderEvent, MonitorEvent};

/// Folder selector used when subscribing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FolderFilter {
    /// Every folder (`"*"`)
    All,
    Folder(String),
}

impl FolderFilter {
    pub fn matches(&self, folder: &str) -> bool {
        match self {
            FolderFilter::All => true,
            FolderFilter::Folder(path) => path == folder,
        }
    }
}

impl From<&str> for FolderFilter {
    fn from(value: &str) -> Self {
        if value == "*" {
            FolderFilter::All
        } else {
            FolderFilter::Folder(value.to_string())
        }
    }
}

impl From<String> for FolderFilter {
    fn from(value: String) -> Self {
        if value == "*" {
            FolderFilter::All
        } else {
            FolderFilter::Folder(value)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Failure raised by a subscriber while handling an event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandlerError {
    #[error("handler failed: {0}")]
    Failed(String),

    #[error("handler panicked: {0}")]
    Panicked(String),

    /// Receiving side is gone; the subscription is removed
    #[error("subscriber disconnected")]
    Disconnected,
}

impl HandlerError {
    pub fn failed(message: impl fmt::Display) -> Self {
        HandlerError::Failed(message.to_string())
    }
}

type Handler = dyn Fn(&MonitorEvent) -> Result<(), HandlerError> + Send + Sync;

struct Subscriber {
    id: SubscriptionId,
    filter: FolderFilter,
    handler: Box<Handler>,
}

struct Subscribers {
    next_id: u64,
    list: Vec<Arc<Subscriber>>,
}

pub struct EventBus {
    subscribers: Mutex<Subscribers>,
    handler_failures: AtomicU64,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Subscribers {
                next_id: 1,
                list: Vec::new(),
            }),
            handler_failures: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Subscribers> {
        // Handlers never run under this lock, so poisoning can't leave it inconsistent
        self.subscribers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a callback for one folder or all folders.
    pub fn subscribe<F>(&self, filter: impl Into<FolderFilter>, handler: F) -> SubscriptionId
    where
        F: Fn(&MonitorEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let filter = filter.into();
        let mut subscribers = self.lock();
        let id = SubscriptionId(subscribers.next_id);
        subscribers.next_id += 1;

        tracing::debug!("Bus: {} subscribed to {:?}", id, filter);
        subscribers.list.push(Arc::new(Subscriber {
            id,
            filter,
            handler: Box::new(handler),
        }));
        id
    }

    /// Register a channel-backed subscriber.
    ///
    /// Dropping the receiver ends the subscription on the next delivery.
    pub fn subscribe_channel(
        &self,
        filter: impl Into<FolderFilter>,
    ) -> (SubscriptionId, mpsc::UnboundedReceiver<MonitorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.subscribe(filter, move |event| {
            tx.send(event.clone()).map_err(|_| HandlerError::Disconnected)
        });
        (id, rx)
    }

    /// Remove a subscription. Returns false if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.lock();
        let before = subscribers.list.len();
        subscribers.list.retain(|s| s.id != id);
        let removed = subscribers.list.len() != before;
        if removed {
            tracing::debug!("Bus: {} unsubscribed", id);
        }
        removed
    }

    pub fn subscriber_count(&self) -> usize {
        self.lock().list.len()
    }

    /// Number of handler invocations that failed or panicked so far.
    pub fn handler_failures(&self) -> u64 {
        self.handler_failures.load(Ordering::Relaxed)
    }

    /// Deliver events for `folder` to every matching subscriber, in order.
    pub fn publish<I>(&self, folder: &str, events: I)
    where
        I: IntoIterator,
        I::Item: Into<FolderEvent>,
    {
        for event in events {
            self.deliver(MonitorEvent {
                folder: folder.to_string(),
                event: event.into(),
            });
        }
    }

    pub fn publish_one(&self, folder: &str, event: impl Into<FolderEvent>) {
        self.publish(folder, std::iter::once(event));
    }

    fn deliver(&self, event: MonitorEvent) {
        // Copy the matching list so handlers may (un)subscribe re-entrantly
        let targets: Vec<Arc<Subscriber>> = self
            .lock()
            .list
            .iter()
            .filter(|s| s.filter.matches(&event.folder))
            .cloned()
            .collect();

        let mut disconnected = Vec::new();

        for subscriber in targets {
            let outcome = catch_unwind(AssertUnwindSafe(|| (subscriber.handler)(&event)))
                .unwrap_or_else(|payload| Err(HandlerError::Panicked(panic_message(&*payload))));

            match outcome {
                Ok(()) => {}
                Err(HandlerError::Disconnected) => disconnected.push(subscriber.id),
                Err(e) => {
                    self.handler_failures.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!(
                        "Bus: {} failed on event for '{}': {}",
                        subscriber.id,
                        event.folder,
                        e
                    );
                }
            }
        }

        for id in disconnected {
            tracing::debug!("Bus: {} receiver dropped, removing", id);
            self.unsubscribe(id);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
