//! Rate-limited logging
//!
//! Decode and timing errors can arrive once per frame; a
//! [`LimitedLogger`] caps how often they reach the log so a broken
//! stream cannot flood it. One instance is shared by all decode-error
//! paths of a session.

use std::sync::Mutex;
use std::time::{Duration, Instant};

const DEFAULT_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// A logger wrapper that drops messages arriving faster than a minimum
/// interval
pub struct LimitedLogger {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl Default for LimitedLogger {
    fn default() -> Self {
        Self::new()
    }
}

impl LimitedLogger {
    pub fn new() -> Self {
        Self::with_interval(DEFAULT_MIN_INTERVAL)
    }

    pub fn with_interval(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    /// Log at warn level, unless a message went out too recently
    pub fn warn(&self, path: &str, msg: &str) {
        if self.allow() {
            tracing::warn!(path = %path, "{}", msg);
        }
    }

    fn allow(&self) -> bool {
        let mut last = self.last.lock().unwrap();
        let now = Instant::now();
        match *last {
            Some(prev) if now.duration_since(prev) < self.min_interval => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}
