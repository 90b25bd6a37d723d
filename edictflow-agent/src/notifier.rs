//! User-facing notifications
//!
//! Delivery belongs to the desktop; the daemon only decides what to say.
//! A failing or absent notifier never affects enforcement.

use parking_lot::Mutex;

use crate::error::Result;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    ChangeBlocked,
    ChangeApproved,
    ChangeRejected,
    ChangeAutoReverted,
    ExceptionGranted,
    ExceptionDenied,
    RulesUpdated,
    ConnectionLost,
    ConnectionRestored,
    SectionRestored,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::ChangeBlocked => "change_blocked",
            NotificationKind::ChangeApproved => "change_approved",
            NotificationKind::ChangeRejected => "change_rejected",
            NotificationKind::ChangeAutoReverted => "change_auto_reverted",
            NotificationKind::ExceptionGranted => "exception_granted",
            NotificationKind::ExceptionDenied => "exception_denied",
            NotificationKind::RulesUpdated => "rules_updated",
            NotificationKind::ConnectionLost => "connection_lost",
            NotificationKind::ConnectionRestored => "connection_restored",
            NotificationKind::SectionRestored => "section_restored",
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, kind: NotificationKind, title: &str, body: &str) -> Result<()>;
}

/// Writes notifications to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, kind: NotificationKind, title: &str, body: &str) -> Result<()> {
        tracing::info!(kind = kind.as_str(), title, body, "notification");
        Ok(())
    }
}

/// Keeps every notification in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    seen: Mutex<Vec<(NotificationKind, String)>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn kinds(&self) -> Vec<NotificationKind> {
        self.seen.lock().iter().map(|(k, _)| *k).collect()
    }

    pub fn titles(&self) -> Vec<String> {
        self.seen.lock().iter().map(|(_, t)| t.clone()).collect()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, kind: NotificationKind, title: &str, _body: &str) -> Result<()> {
        self.seen.lock().push((kind, title.to_string()));
        Ok(())
    }
}

/// Deliver, logging instead of failing
pub fn notify_quietly(notifier: &dyn Notifier, kind: NotificationKind, title: &str, body: &str) {
    if let Err(e) = notifier.notify(kind, title, body) {
        tracing::debug!(kind = kind.as_str(), error = %e, "notification not delivered");
    }
}
