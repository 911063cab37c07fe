//! Real-time mail folder monitoring over an external scripting bridge.
//!
//! A [`registry::MonitorRegistry`] runs one monitor task per folder. Each
//! monitor polls the folder through a [`bridge::MailBridge`], diffs the
//! result against the previous snapshot and publishes typed events on an
//! [`bus::EventBus`].

pub mod bridge;
pub mod bus;
pub mod config;
pub mod constants;
pub mod diff;
pub mod events;
pub mod mirror;
pub mod monitor;
#[cfg(feature = "notifications")]
pub mod notification;
pub mod registry;
pub mod snapshot;

pub use bridge::{BridgeError, FetchOptions, MailBridge, ScriptBridge};
pub use bus::{EventBus, FolderFilter, HandlerError, SubscriptionId};
pub use events::{ChangeEvent, FolderEvent, MonitorEvent, MonitorNotice};
pub use registry::{ConfigurationError, MonitorRegistry, RegistrySettings, StartOutcome};
pub use snapshot::{FolderSnapshot, MessageSnapshotEntry};
