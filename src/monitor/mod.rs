//! Folder monitor: one polling task per watched folder.
//!
//! This module is split into:
//! - `mod.rs` - Task loop, commands and the handle returned to the registry
//! - `state.rs` - Pure phase state machine (Idle / Scanning / Backoff / Stopped)
//! - `backoff.rs` - Delay policy after failed scans
//!
//! The task owns the previous snapshot. Each loop iteration waits for the
//! timer or a command, runs exactly one bridge call, publishes the resulting
//! events and re-arms the timer.

mod backoff;
mod state;

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::bridge::{FetchOptions, MailBridge};
use crate::bus::EventBus;
use crate::events::MonitorNotice;

pub use backoff::BackoffPolicy;
pub use state::{MonitorPhase, MonitorState, MonitorStatus, ScanOutcome, TickDecision};

/// Commands sent TO a folder monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorCommand {
    /// Tick immediately; dropped if a scan is in flight
    ScanNow,
    SetInterval(Duration),
    Stop,
}

/// Settings for one monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorSettings {
    pub interval: Duration,
    pub max_backoff: Duration,
    pub max_items: usize,
}

/// Handle for a running folder monitor.
///
/// Dropping the handle stops the monitor.
pub struct MonitorHandle {
    pub folder: String,
    cmd_tx: mpsc::UnboundedSender<MonitorCommand>,
    status_rx: watch::Receiver<MonitorStatus>,
    task: JoinHandle<()>,
}

impl MonitorHandle {
    fn send(&self, cmd: MonitorCommand) -> bool {
        if let Err(e) = self.cmd_tx.send(cmd) {
            tracing::debug!("Monitor '{}' is gone, dropped {:?}", self.folder, e.0);
            return false;
        }
        true
    }

    pub fn scan_now(&self) -> bool {
        self.send(MonitorCommand::ScanNow)
    }

    pub fn set_interval(&self, interval: Duration) -> bool {
        self.send(MonitorCommand::SetInterval(interval))
    }

    /// Request shutdown of the monitor. Cancels the pending timer at once; an
    /// in-flight bridge call is allowed to finish and its result is discarded.
    pub fn stop(&self) {
        self.send(MonitorCommand::Stop);
    }

    pub fn status(&self) -> MonitorStatus {
        self.status_rx.borrow().clone()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<MonitorStatus> {
        self.status_rx.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Resolves once the monitor task has exited, in-flight scan included.
    pub fn finished(&self) -> BoxFuture<'static, ()> {
        let mut status_rx = self.status_rx.clone();
        // The task owns the sender; it is dropped on exit
        async move { while status_rx.changed().await.is_ok() {} }.boxed()
    }

    /// Stop the monitor and wait for its task to exit.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            tracing::warn!("Monitor '{}' task ended abnormally: {}", self.folder, e);
        }
    }
}

/// Spawn a monitor for one folder.
///
/// The monitor will:
/// 1. Scan right away (the priming scan only announces the baseline)
/// 2. Publish the diff of every later scan to the bus
/// 3. Back off after bridge failures and keep retrying
/// 4. Repeat until stopped
pub fn spawn_folder_monitor<B: MailBridge>(
    bridge: Arc<B>,
    bus: Arc<EventBus>,
    folder: String,
    settings: MonitorSettings,
) -> MonitorHandle {
    spawn_folder_monitor_after(bridge, bus, folder, settings, None)
}

/// Like [`spawn_folder_monitor`], but the first scan waits for `predecessor`.
///
/// Used when a stopped monitor for the same folder may still have a bridge
/// call in flight.
pub fn spawn_folder_monitor_after<B: MailBridge>(
    bridge: Arc<B>,
    bus: Arc<EventBus>,
    folder: String,
    settings: MonitorSettings,
    predecessor: Option<BoxFuture<'static, ()>>,
) -> MonitorHandle {
    let state = MonitorState::new(
        folder.clone(),
        BackoffPolicy::new(settings.interval, settings.max_backoff),
    );
    let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
    let (status_tx, status_rx) = watch::channel(state.status());
    let options = FetchOptions::new(settings.max_items);

    let task = tokio::spawn(folder_monitor_loop(
        bridge,
        bus,
        state,
        options,
        predecessor,
        cmd_rx,
        status_tx,
    ));

    MonitorHandle {
        folder,
        cmd_tx,
        status_rx,
        task,
    }
}

/// The folder monitor loop.
async fn folder_monitor_loop<B: MailBridge>(
    bridge: Arc<B>,
    bus: Arc<EventBus>,
    mut state: MonitorState,
    options: FetchOptions,
    predecessor: Option<BoxFuture<'static, ()>>,
    mut cmd_rx: mpsc::UnboundedReceiver<MonitorCommand>,
    status_tx: watch::Sender<MonitorStatus>,
) {
    let folder = state.folder_path().to_string();

    if let Some(predecessor) = predecessor {
        tracing::debug!(
            "Folder monitor '{}': waiting for previous monitor to exit",
            folder
        );
        if !wait_for_predecessor(predecessor, &mut state, &mut cmd_rx, &status_tx).await {
            finish(&mut state, &status_tx, &bus, &folder);
            return;
        }
    }

    let mut next_tick = Instant::now();
    // None until the priming scan has finished
    let mut last_scan_done: Option<Instant> = None;

    tracing::info!(
        "Folder monitor '{}' started (interval {:?})",
        folder,
        state.interval()
    );

    'monitor: loop {
        // Idle or Backoff: wait for the timer or a command
        tokio::select! {
            _ = tokio::time::sleep_until(next_tick) => {}
            cmd = cmd_rx.recv() => match cmd {
                Some(MonitorCommand::ScanNow) => {
                    tracing::debug!("Folder monitor '{}': scan requested", folder);
                }
                Some(MonitorCommand::SetInterval(interval)) => {
                    state.set_interval(interval);
                    if state.phase() == MonitorPhase::Idle
                        && let Some(done) = last_scan_done
                    {
                        next_tick = done + interval;
                    }
                    status_tx.send_replace(state.status());
                    continue;
                }
                Some(MonitorCommand::Stop) | None => break 'monitor,
            }
        }

        if state.on_tick() != TickDecision::Scan {
            break;
        }
        status_tx.send_replace(state.status());
        tracing::debug!("Folder monitor '{}': scanning", folder);

        let fetch = bridge.fetch_snapshot(&folder, &options);
        tokio::pin!(fetch);
        let mut stop_requested = false;

        // Scanning: the only phase where commands race the bridge call
        let result = loop {
            tokio::select! {
                result = &mut fetch => break result,
                cmd = cmd_rx.recv(), if !stop_requested => match cmd {
                    Some(MonitorCommand::ScanNow) => {
                        state.on_tick();
                        tracing::debug!(
                            "Folder monitor '{}': scan already in flight, tick dropped",
                            folder
                        );
                        status_tx.send_replace(state.status());
                    }
                    Some(MonitorCommand::SetInterval(interval)) => {
                        state.set_interval(interval);
                        status_tx.send_replace(state.status());
                    }
                    Some(MonitorCommand::Stop) | None => {
                        tracing::debug!(
                            "Folder monitor '{}': stop during scan, waiting for bridge",
                            folder
                        );
                        stop_requested = true;
                        state.stop();
                        status_tx.send_replace(state.status());
                    }
                }
            }
        };

        let Some(ScanOutcome {
            events,
            next_tick_in,
        }) = state.on_scan_complete(result, chrono::Utc::now())
        else {
            tracing::debug!("Folder monitor '{}': discarded result of stopped scan", folder);
            break;
        };

        if !events.is_empty() {
            tracing::debug!(
                "Folder monitor '{}': publishing {} events",
                folder,
                events.len()
            );
        }
        bus.publish(&folder, events);
        status_tx.send_replace(state.status());
        let done = Instant::now();
        last_scan_done = Some(done);
        next_tick = done + next_tick_in;
    }

    finish(&mut state, &status_tx, &bus, &folder);
}

/// Wait for the previous monitor of this folder. Returns false if stopped meanwhile.
async fn wait_for_predecessor(
    mut predecessor: BoxFuture<'static, ()>,
    state: &mut MonitorState,
    cmd_rx: &mut mpsc::UnboundedReceiver<MonitorCommand>,
    status_tx: &watch::Sender<MonitorStatus>,
) -> bool {
    loop {
        tokio::select! {
            _ = &mut predecessor => return true,
            cmd = cmd_rx.recv() => match cmd {
                // The first scan runs as soon as the wait ends anyway
                Some(MonitorCommand::ScanNow) => {}
                Some(MonitorCommand::SetInterval(interval)) => {
                    state.set_interval(interval);
                    status_tx.send_replace(state.status());
                }
                Some(MonitorCommand::Stop) | None => return false,
            }
        }
    }
}

fn finish(
    state: &mut MonitorState,
    status_tx: &watch::Sender<MonitorStatus>,
    bus: &EventBus,
    folder: &str,
) {
    state.stop();
    status_tx.send_replace(state.status());
    bus.publish_one(folder, MonitorNotice::Stopped);
    tracing::info!("Folder monitor '{}' stopped", folder);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::BridgeError;
    use crate::bridge::mock::MockBridge;
    use crate::events::{ChangeEvent, FolderEvent, MonitorEvent};
    use crate::snapshot::{FolderSnapshot, MessageSnapshotEntry};
    use chrono::{TimeZone, Utc};

    fn snapshot(ids: &[&str]) -> FolderSnapshot {
        let received = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let entries = ids
            .iter()
            .map(|id| MessageSnapshotEntry::new(*id, format!("subject {}", id), received))
            .collect();
        FolderSnapshot::complete("X", entries, received)
    }

    fn settings(interval_secs: u64, max_backoff_secs: u64) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(interval_secs),
            max_backoff: Duration::from_secs(max_backoff_secs),
            max_items: 100,
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MonitorEvent>) -> Vec<FolderEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event.event);
        }
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_scan_only_announces_count() {
        let ids: Vec<String> = (0..10).map(|i| format!("m{}", i)).collect();
        let refs: Vec<&str> = ids.iter().map(String::as_str).collect();
        let bridge = Arc::new(MockBridge::new(Duration::ZERO));
        bridge.set_fallback(Ok(snapshot(&refs)));
        let bus = Arc::new(EventBus::new());
        let (_, mut rx) = bus.subscribe_channel("X");

        let handle = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 60));
        tokio::time::sleep(Duration::from_secs(12)).await;
        handle.shutdown().await;

        assert_eq!(bridge.calls(), 3);
        assert_eq!(
            drain(&mut rx),
            vec![
                FolderEvent::Notice(MonitorNotice::MonitoringStarted { total_count: 10 }),
                FolderEvent::Notice(MonitorNotice::Stopped),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_later_scans_publish_changes_in_order() {
        let bridge = Arc::new(MockBridge::new(Duration::ZERO));
        bridge.push(Ok(snapshot(&["i1", "i2", "i3"])));
        bridge.set_fallback(Ok(snapshot(&["i2", "i3", "i4"])));
        let bus = Arc::new(EventBus::new());
        let (_, mut rx) = bus.subscribe_channel("*");

        let handle = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 60));
        tokio::time::sleep(Duration::from_secs(7)).await;
        handle.shutdown().await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 4, "{:?}", events);
        assert_eq!(
            events[0],
            FolderEvent::Notice(MonitorNotice::MonitoringStarted { total_count: 3 })
        );
        assert!(matches!(
            &events[1],
            FolderEvent::Change(ChangeEvent::NewMessage { entry }) if entry.identity == "i4"
        ));
        assert!(matches!(
            &events[2],
            FolderEvent::Change(ChangeEvent::Deleted { identity, .. }) if identity == "i1"
        ));
        assert_eq!(events[3], FolderEvent::Notice(MonitorNotice::Stopped));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scan_requests_during_slow_scan_are_dropped() {
        let bridge = Arc::new(MockBridge::new(Duration::from_secs(3)));
        bridge.set_fallback(Ok(snapshot(&["a"])));
        let bus = Arc::new(EventBus::new());

        let handle = spawn_folder_monitor(bridge.clone(), bus, "X".into(), settings(10, 60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(handle.status().phase, MonitorPhase::Scanning);

        assert!(handle.scan_now());
        assert!(handle.scan_now());
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(bridge.calls(), 1);
        assert_eq!(bridge.max_in_flight(), 1);
        let status = handle.status();
        assert_eq!(status.dropped_ticks, 2);
        assert_eq!(status.phase, MonitorPhase::Idle);

        // An idle monitor honours the request immediately
        assert!(handle.scan_now());
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(bridge.calls(), 2);
        assert_eq!(bridge.max_in_flight(), 1);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_consecutive_timeouts_back_off() {
        let bridge = Arc::new(MockBridge::new(Duration::ZERO));
        bridge.set_fallback(Err(BridgeError::Timeout(Duration::from_secs(30))));
        let bus = Arc::new(EventBus::new());
        let (_, mut rx) = bus.subscribe_channel("X");

        // Failures at t=0, t=5 and t=15; the fourth attempt would be at t=27
        let handle = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 12));
        tokio::time::sleep(Duration::from_secs(20)).await;

        let status = handle.status();
        assert_eq!(status.consecutive_failures, 3);
        assert_eq!(status.phase, MonitorPhase::Backoff);
        assert_eq!(bridge.calls(), 3);

        let events = drain(&mut rx);
        let retry_delays: Vec<Duration> = events
            .iter()
            .map(|event| match event {
                FolderEvent::Notice(MonitorNotice::ScanFailed { retry_in, .. }) => *retry_in,
                other => panic!("unexpected event {:?}", other),
            })
            .collect();
        assert_eq!(
            retry_delays,
            vec![
                Duration::from_secs(5),
                Duration::from_secs(10),
                Duration::from_secs(12)
            ]
        );

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_failure() {
        let bridge = Arc::new(MockBridge::new(Duration::ZERO));
        bridge.push(Err(BridgeError::Fault("bridge crashed".to_string())));
        bridge.set_fallback(Ok(snapshot(&["a", "b"])));
        let bus = Arc::new(EventBus::new());
        let (_, mut rx) = bus.subscribe_channel("X");

        let handle = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 60));
        tokio::time::sleep(Duration::from_secs(6)).await;

        let events = drain(&mut rx);
        assert_eq!(events.len(), 3, "{:?}", events);
        assert!(matches!(
            events[0],
            FolderEvent::Notice(MonitorNotice::ScanFailed {
                consecutive_failures: 1,
                ..
            })
        ));
        assert_eq!(
            events[1],
            FolderEvent::Notice(MonitorNotice::Recovered { after_failures: 1 })
        );
        assert_eq!(
            events[2],
            FolderEvent::Notice(MonitorNotice::MonitoringStarted { total_count: 2 })
        );
        assert_eq!(handle.status().consecutive_failures, 0);

        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_scan_discards_result() {
        let bridge = Arc::new(MockBridge::new(Duration::from_secs(3)));
        bridge.set_fallback(Ok(snapshot(&["a"])));
        let bus = Arc::new(EventBus::new());
        let (_, mut rx) = bus.subscribe_channel("X");

        let handle = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 60));
        let mut status = handle.watch_status();
        tokio::time::sleep(Duration::from_secs(1)).await;

        handle.stop();
        status
            .wait_for(|s| s.phase == MonitorPhase::Stopped)
            .await
            .unwrap();
        handle.shutdown().await;

        assert_eq!(bridge.calls(), 1);
        assert_eq!(drain(&mut rx), vec![FolderEvent::Notice(MonitorNotice::Stopped)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_handle_stops_monitor() {
        let bridge = Arc::new(MockBridge::new(Duration::ZERO));
        bridge.set_fallback(Ok(snapshot(&["a"])));
        let bus = Arc::new(EventBus::new());
        let (_, mut rx) = bus.subscribe_channel("X");

        let handle = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(handle);
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(bridge.calls(), 1);
        let events = drain(&mut rx);
        assert_eq!(events.last(), Some(&FolderEvent::Notice(MonitorNotice::Stopped)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_successor_waits_for_in_flight_scan() {
        let bridge = Arc::new(MockBridge::new(Duration::from_secs(3)));
        bridge.set_fallback(Ok(snapshot(&["a"])));
        let bus = Arc::new(EventBus::new());

        let old = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        old.stop();

        let new = spawn_folder_monitor_after(
            bridge.clone(),
            bus.clone(),
            "X".into(),
            settings(5, 60),
            Some(old.finished()),
        );
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bridge.calls(), 1);

        // Old scan ends at t=3, the new monitor scans right after
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(old.is_finished());
        assert_eq!(bridge.calls(), 2);
        assert_eq!(bridge.max_in_flight(), 1);

        new.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_waiting_for_predecessor() {
        let bridge = Arc::new(MockBridge::new(Duration::from_secs(3)));
        bridge.set_fallback(Ok(snapshot(&["a"])));
        let bus = Arc::new(EventBus::new());
        let (_, mut rx) = bus.subscribe_channel("Y");

        let old = spawn_folder_monitor(bridge.clone(), bus.clone(), "X".into(), settings(5, 60));
        tokio::time::sleep(Duration::from_secs(1)).await;
        old.stop();

        let new = spawn_folder_monitor_after(
            bridge.clone(),
            bus.clone(),
            "Y".into(),
            settings(5, 60),
            Some(old.finished()),
        );
        new.shutdown().await;

        assert_eq!(bridge.calls(), 1);
        assert_eq!(drain(&mut rx), vec![FolderEvent::Notice(MonitorNotice::Stopped)]);
        old.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_interval_retimes_next_scan() {
        let bridge = Arc::new(MockBridge::new(Duration::ZERO));
        bridge.set_fallback(Ok(snapshot(&["a"])));
        let bus = Arc::new(EventBus::new());

        let handle = spawn_folder_monitor(bridge.clone(), bus, "X".into(), settings(60, 600));
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bridge.calls(), 1);

        // Scans at t=2 and t=4, counted from the end of the first scan
        assert!(handle.set_interval(Duration::from_secs(2)));
        tokio::time::sleep(Duration::from_secs(4)).await;

        assert_eq!(bridge.calls(), 3);
        assert_eq!(handle.status().interval, Duration::from_secs(2));
        handle.shutdown().await;
    }
}
