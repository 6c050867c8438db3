//! Presentation-layer notifications for downloads.
//!
//! The worker renders each record into a [`DownloadNotification`] and hands
//! it to a [`NotificationSink`]. Taps on a notification's actions come back
//! as [`NotificationAction`]s through
//! [`DownloadManager::handle_notification_action`](crate::DownloadManager::handle_notification_action).

use std::fmt;

use tracing::info;

use crate::record::{DownloadRecord, DownloadStatus};

/// Action a notification offers for its download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationAction {
    Pause,
    Resume,
    Cancel,
    Retry,
}

impl NotificationAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for NotificationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Renderable state of one download.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadNotification {
    pub id: i64,
    pub file_name: String,
    pub status: DownloadStatus,
    /// Whole percent, 0 while the total is unknown.
    pub progress: u8,
    pub downloaded_bytes: i64,
    pub total_bytes: i64,
    /// Bytes per millisecond, present only when speed display is enabled
    /// and the download is transferring.
    pub speed_per_ms: Option<f64>,
}

impl DownloadNotification {
    #[must_use]
    pub fn from_record(record: &DownloadRecord, show_speed: bool) -> Self {
        let speed_per_ms = (show_speed && record.status == DownloadStatus::InProgress)
            .then_some(record.speed_per_ms);
        Self {
            id: record.id,
            file_name: record.file_name.clone(),
            status: record.status,
            progress: record.progress(),
            downloaded_bytes: record.downloaded_bytes,
            total_bytes: record.total_bytes,
            speed_per_ms,
        }
    }

    /// Actions that make sense for the current status.
    #[must_use]
    pub fn actions(&self) -> &'static [NotificationAction] {
        match self.status {
            DownloadStatus::Queued | DownloadStatus::Started | DownloadStatus::InProgress => {
                &[NotificationAction::Pause, NotificationAction::Cancel]
            }
            DownloadStatus::Paused | DownloadStatus::Failed => {
                &[NotificationAction::Resume, NotificationAction::Cancel]
            }
            DownloadStatus::Cancelled => &[NotificationAction::Retry],
            DownloadStatus::Default | DownloadStatus::Success => &[],
        }
    }

    /// True once the download reached a state no job will change.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !self.status.is_active()
    }
}

/// Receives rendered notifications.
pub trait NotificationSink: Send + Sync {
    /// Posts or refreshes the notification for `notification.id`.
    fn show(&self, notification: &DownloadNotification);

    /// Removes the notification for `id`, if any.
    fn dismiss(&self, id: i64);
}

/// Sink that renders notifications as `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl NotificationSink for TracingNotifier {
    fn show(&self, notification: &DownloadNotification) {
        let actions: Vec<&str> = notification
            .actions()
            .iter()
            .map(NotificationAction::as_str)
            .collect();
        info!(
            id = notification.id,
            file = %notification.file_name,
            status = %notification.status,
            progress = notification.progress,
            speed_per_ms = notification.speed_per_ms,
            actions = ?actions,
            "download notification"
        );
    }

    fn dismiss(&self, id: i64) {
        info!(id, "download notification dismissed");
    }
}
