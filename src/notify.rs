//! Operator notifications
//!
//! Structured notifications routed through the log sink, with per-key
//! throttling so recurring conditions (insufficient balance, repeated
//! transient failures) surface at most hourly.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

const DEFAULT_THROTTLE: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifyType {
    Info,
    Warning,
    Error,
}

impl NotifyType {
    pub fn as_str(self) -> &'static str {
        match self {
            NotifyType::Info => "info",
            NotifyType::Warning => "warning",
            NotifyType::Error => "error",
        }
    }
}

pub struct Notifier {
    throttle: Duration,
    last_sent: Mutex<HashMap<String, Instant>>,
}

impl Notifier {
    pub fn new() -> Self {
        Notifier {
            throttle: DEFAULT_THROTTLE,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_throttle(throttle: Duration) -> Self {
        Notifier {
            throttle,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    pub fn notify(&self, kind: NotifyType, message: &str) {
        match kind {
            NotifyType::Info => info!(target: "notify", "{}", message),
            NotifyType::Warning => warn!(target: "notify", "{}", message),
            NotifyType::Error => error!(target: "notify", "{}", message),
        }
    }

    /// Sends at most once per throttle window for the same `key`.
    /// Returns whether the notification went out.
    pub fn notify_throttled(&self, key: &str, kind: NotifyType, message: &str) -> bool {
        let mut last_sent = self.last_sent.lock().unwrap();
        if let Some(stamp) = last_sent.get(key) {
            if stamp.elapsed() < self.throttle {
                return false;
            }
        }
        last_sent.insert(key.to_string(), Instant::now());
        drop(last_sent);
        self.notify(kind, message);
        true
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Notifier::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttle_suppresses_repeats() {
        let notifier = Notifier::with_throttle(Duration::from_secs(60));
        assert!(notifier.notify_throttled("low-balance", NotifyType::Warning, "low"));
        assert!(!notifier.notify_throttled("low-balance", NotifyType::Warning, "low"));
        // a different key is independent
        assert!(notifier.notify_throttled("api-errors", NotifyType::Warning, "flaky"));
    }

    #[test]
    fn test_throttle_expires() {
        let notifier = Notifier::with_throttle(Duration::from_millis(0));
        assert!(notifier.notify_throttled("k", NotifyType::Info, "a"));
        assert!(notifier.notify_throttled("k", NotifyType::Info, "b"));
    }
}
