//! Outbound failure notifications.
//!
//! The real delivery channel (mail, chat, pager) lives outside this crate;
//! the supervisor only needs a best-effort `notify`.

/// Best-effort notification sink. Implementations must not panic and must not
/// block for long: `notify` runs on the failing unit's thread.
pub trait Notifier: Send + Sync + std::fmt::Debug {
    fn notify(&self, title: &str, body: &str);
}

/// Default notifier: a warning in the log stream.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, title: &str, body: &str) {
        tracing::warn!("notify: {}: {}", title, body);
    }
}

/// Drops every notification.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopNotifier;

impl Notifier for NoopNotifier {
    fn notify(&self, _title: &str, _body: &str) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_tracing_notifier_logs_warning() {
        TracingNotifier.notify("crawler down", "boom");
        NoopNotifier.notify("ignored", "ignored");
        assert!(logs_contain("notify: crawler down: boom"));
        assert!(!logs_contain("ignored"));
    }
}
