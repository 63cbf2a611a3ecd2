// Operator notifications behind a cooldown gate.
//
// Delivery transports (mail and friends) live outside this crate; this
// layer only decides whether a notification may fire again and hands the
// message to the injected transport. The gate is armed before delivery,
// so a failing transport cannot turn into a retry storm either.

use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, error, info};

use crate::runtime::EditorData;

/// Kinds of repeating operator notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    LicenseExpired,
}

impl NotificationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LicenseExpired => "license_expired",
        }
    }
}

/// Delivery channel (external collaborator).
pub trait NotificationTransport: Send + Sync {
    fn send(&self, kind: NotificationKind, message: &str) -> Result<()>;
}

/// Rate-limits each notification kind to once per window.
pub struct Notifier {
    runtime: Arc<dyn EditorData>,
    transport: Arc<dyn NotificationTransport>,
    window_sec: u32,
}

impl Notifier {
    pub fn new(
        runtime: Arc<dyn EditorData>,
        transport: Arc<dyn NotificationTransport>,
        window_sec: u32,
    ) -> Self {
        Self { runtime, transport, window_sec }
    }

    /// Deliver `message` unless the same kind already fired within the
    /// window. Returns whether delivery was attempted.
    pub fn notify(&self, kind: NotificationKind, message: &str, now: DateTime<Utc>) -> bool {
        if !self.runtime.try_acquire_cooldown(kind.as_str(), self.window_sec, now) {
            debug!(kind = kind.as_str(), "notification suppressed by cooldown");
            return false;
        }
        match self.transport.send(kind, message) {
            Ok(()) => info!(kind = kind.as_str(), "notification sent"),
            Err(send_error) => {
                error!(kind = kind.as_str(), error = format!("{send_error:#}"), "notification delivery failed");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::{Duration, TimeZone, Utc};

    use crate::runtime::MemoryEditorData;

    use super::*;

    #[derive(Default)]
    struct CountingTransport {
        sent: AtomicUsize,
    }

    impl NotificationTransport for CountingTransport {
        fn send(&self, _kind: NotificationKind, _message: &str) -> Result<()> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn ts(seconds: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(seconds, 0).single().expect("timestamp should be valid")
    }

    #[test]
    fn repeats_within_window_are_suppressed() {
        let transport = Arc::new(CountingTransport::default());
        let notifier =
            Notifier::new(Arc::new(MemoryEditorData::new()), transport.clone(), 3600);
        let now = ts(1_700_000_000);

        assert!(notifier.notify(NotificationKind::LicenseExpired, "license expired", now));
        assert!(!notifier.notify(
            NotificationKind::LicenseExpired,
            "license expired",
            now + Duration::seconds(1800)
        ));
        assert_eq!(transport.sent.load(Ordering::SeqCst), 1);

        assert!(notifier.notify(
            NotificationKind::LicenseExpired,
            "license expired",
            now + Duration::seconds(3600)
        ));
        assert_eq!(transport.sent.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn failed_delivery_still_arms_the_cooldown() {
        struct FailingTransport;
        impl NotificationTransport for FailingTransport {
            fn send(&self, _kind: NotificationKind, _message: &str) -> Result<()> {
                anyhow::bail!("smtp down")
            }
        }

        let notifier =
            Notifier::new(Arc::new(MemoryEditorData::new()), Arc::new(FailingTransport), 3600);
        let now = ts(1_700_000_100);

        assert!(notifier.notify(NotificationKind::LicenseExpired, "license expired", now));
        assert!(!notifier.notify(
            NotificationKind::LicenseExpired,
            "license expired",
            now + Duration::seconds(10)
        ));
    }
}
