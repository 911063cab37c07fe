//! Desktop notification support for new mail alerts

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::Config;
use crate::constants::{NOTIFICATION_TIMEOUT_MS, SUBJECT_PREVIEW_CHARS};
use crate::events::{ChangeEvent, MonitorEvent};

/// New mail found in one folder within a burst of events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMailSummary {
    pub folder: String,
    pub count: usize,
    /// Subject of the last new message in the burst
    pub latest_subject: String,
}

/// Group the `NewMessage` events of a burst by folder, in first-seen order.
pub fn summarize_new_mail(events: &[MonitorEvent]) -> Vec<NewMailSummary> {
    let mut summaries: Vec<NewMailSummary> = Vec::new();

    for event in events {
        let Some(ChangeEvent::NewMessage { entry }) = event.change() else {
            continue;
        };
        match summaries.iter_mut().find(|s| s.folder == event.folder) {
            Some(summary) => {
                summary.count += 1;
                summary.latest_subject = entry.subject.clone();
            }
            None => summaries.push(NewMailSummary {
                folder: event.folder.clone(),
                count: 1,
                latest_subject: entry.subject.clone(),
            }),
        }
    }

    summaries
}

/// Consume bus events and raise one notification per folder per burst.
///
/// Returns once the subscription's sender is dropped.
pub async fn run_notifier(config: Arc<Config>, mut rx: mpsc::UnboundedReceiver<MonitorEvent>) {
    while let Some(first) = rx.recv().await {
        // One scan publishes its events back to back; drain them together
        let mut burst = vec![first];
        while let Ok(event) = rx.try_recv() {
            burst.push(event);
        }

        for summary in summarize_new_mail(&burst) {
            notify_new_mail(&config, &summary);
        }
    }
    tracing::debug!("Notifier stopped");
}

/// Send a desktop notification for new mail
pub fn notify_new_mail(config: &Config, summary: &NewMailSummary) {
    // Check if notifications are enabled for this folder
    if !config.notifications_enabled_for(&summary.folder) {
        return;
    }

    let title = if summary.count == 1 {
        format!("New mail - {}", summary.folder)
    } else {
        format!("{} new emails - {}", summary.count, summary.folder)
    };

    let body = if config.notifications.show_preview && !summary.latest_subject.is_empty() {
        Some(preview(&summary.latest_subject))
    } else {
        None
    };

    // Fire and forget, don't block on errors
    if let Err(e) = send_notification(&title, body.as_deref()) {
        tracing::warn!("Failed to send desktop notification: {}", e);
    }
}

/// Truncate long subjects on a character boundary
fn preview(subject: &str) -> String {
    if subject.chars().count() > SUBJECT_PREVIEW_CHARS {
        let cut: String = subject.chars().take(SUBJECT_PREVIEW_CHARS - 3).collect();
        format!("{}...", cut)
    } else {
        subject.to_string()
    }
}

/// Low-level notification sending
fn send_notification(summary: &str, body: Option<&str>) -> Result<(), notify_rust::error::Error> {
    use notify_rust::Notification;

    let mut notification = Notification::new();
    notification
        .summary(summary)
        .appname("folderwatch")
        .timeout(notify_rust::Timeout::Milliseconds(NOTIFICATION_TIMEOUT_MS));

    if let Some(body) = body {
        notification.body(body);
    }

    notification.icon("mail-unread");

    notification.show()?;
    Ok(())
}
