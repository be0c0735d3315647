//! Fire-and-forget progress channel towards whatever is presenting the run.

use log::info;

/// One status message, optionally with a completion percentage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub progress: Option<u8>,
}

impl Notification {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            progress: None,
        }
    }

    pub fn progress(message: impl Into<String>, processed: usize, total: usize) -> Self {
        let percent = if total == 0 {
            100
        } else {
            (processed.min(total) * 100 / total) as u8
        };
        Self {
            message: message.into(),
            progress: Some(percent),
        }
    }
}

/// Receiver of notifications. Delivery must never fail the sender, so
/// implementations swallow their own errors.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Writes notifications to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: Notification) {
        match notification.progress {
            Some(percent) => info!("[{percent:>3}%] {}", notification.message),
            None => info!("{}", notification.message),
        }
    }
}

/// Drops every notification, for callers without a listener.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _notification: Notification) {}
}
