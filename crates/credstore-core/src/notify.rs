//! User notifications raised by the storage layer

use tracing::warn;

/// Presents a message to the user (balloon, dialog, status bar ...)
pub trait Notifier: Send + Sync {
    fn notify(&self, title: &str, message: &str);
}

/// Default notifier: writes the notification to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, message: &str) {
        warn!(title, "{}", message);
    }
}
