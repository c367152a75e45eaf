//! Short-window suppression of repeated connection requests.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

/// Requests repeated within this window are suppressed.
pub const DEFAULT_DEDUP_WINDOW: Duration = Duration::from_millis(100);

/// Remembers when each caller-supplied key was last accepted.
///
/// Keys are not session-scoped: an entry outlives the session it admitted
/// and is only ever replaced by a later accept for the same key.
pub struct DedupGuard {
    window: TimeDelta,
    last_accepted: HashMap<String, DateTime<Utc>>,
}

impl DedupGuard {
    pub fn new(window: Duration) -> Self {
        let window = TimeDelta::from_std(window).unwrap_or_else(|_| TimeDelta::milliseconds(100));
        Self {
            window,
            last_accepted: HashMap::new(),
        }
    }

    /// Returns true and records `now` if `key` was not accepted within the
    /// window; returns false (recording nothing) otherwise.
    pub fn should_accept(&mut self, key: &str, now: DateTime<Utc>) -> bool {
        if let Some(last) = self.last_accepted.get(key) {
            if now.signed_duration_since(*last) < self.window {
                return false;
            }
        }
        self.last_accepted.insert(key.to_string(), now);
        true
    }

    /// Number of keys currently remembered.
    pub fn len(&self) -> usize {
        self.last_accepted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_accepted.is_empty()
    }
}

impl Default for DedupGuard {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_WINDOW)
    }
}
