//! Sliding window rate limiting.
//!
//! Keyed sliding windows used by the anti-flood guard and the alert limiter.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// Window configuration: at most `max_events` per `window`.
#[derive(Debug, Clone, Copy)]
pub struct WindowLimit {
    pub max_events: u32,
    pub window: Duration,
}

impl WindowLimit {
    pub fn new(max_events: u32, window: std::time::Duration) -> Self {
        Self {
            max_events,
            window: to_chrono(window),
        }
    }
}

/// Convert a std duration, saturating at a century.
pub(crate) fn to_chrono(d: std::time::Duration) -> Duration {
    Duration::from_std(d).unwrap_or_else(|_| Duration::days(36_500))
}

/// Sliding window for tracking events.
#[derive(Debug)]
struct SlidingWindow {
    timestamps: VecDeque<DateTime<Utc>>,
}

impl SlidingWindow {
    fn new() -> Self {
        Self {
            timestamps: VecDeque::new(),
        }
    }

    /// Drop timestamps that fell out of the window.
    fn prune(&mut self, now: DateTime<Utc>, limit: &WindowLimit) {
        let horizon = now - limit.window;
        while let Some(&ts) = self.timestamps.front() {
            if ts <= horizon {
                self.timestamps.pop_front();
            } else {
                break;
            }
        }
    }

    fn allows(&mut self, now: DateTime<Utc>, limit: &WindowLimit) -> bool {
        self.prune(now, limit);
        self.timestamps.len() < limit.max_events as usize
    }

    fn latest(&self) -> Option<DateTime<Utc>> {
        self.timestamps.back().copied()
    }
}

/// Rate limiter with one sliding window per key.
#[derive(Debug)]
pub struct KeyedRateLimiter<K> {
    limit: WindowLimit,
    windows: HashMap<K, SlidingWindow>,
}

impl<K: Eq + Hash + Clone> KeyedRateLimiter<K> {
    pub fn new(limit: WindowLimit) -> Self {
        Self {
            limit,
            windows: HashMap::new(),
        }
    }

    /// Whether an event for `key` would be allowed now. Does not record.
    pub fn would_allow(&mut self, key: &K, now: DateTime<Utc>) -> bool {
        match self.windows.get_mut(key) {
            Some(window) => window.allows(now, &self.limit),
            None => self.limit.max_events > 0,
        }
    }

    /// Record the event if allowed. Returns whether it was allowed.
    pub fn check_and_record(&mut self, key: &K, now: DateTime<Utc>) -> bool {
        let limit = self.limit;
        let window = self
            .windows
            .entry(key.clone())
            .or_insert_with(SlidingWindow::new);
        if !window.allows(now, &limit) {
            return false;
        }
        window.timestamps.push_back(now);
        true
    }

    /// Most recent recorded event for `key`.
    pub fn latest(&self, key: &K) -> Option<DateTime<Utc>> {
        self.windows.get(key).and_then(SlidingWindow::latest)
    }

    /// Undo the most recent recorded event for `key`.
    pub fn forget_latest(&mut self, key: &K) {
        if let Some(window) = self.windows.get_mut(key) {
            window.timestamps.pop_back();
            if window.timestamps.is_empty() {
                self.windows.remove(key);
            }
        }
    }

    /// Drop windows with no events left inside the horizon.
    pub fn evict_idle(&mut self, now: DateTime<Utc>) -> usize {
        let limit = self.limit;
        let before = self.windows.len();
        self.windows.retain(|_, w| {
            w.prune(now, &limit);
            !w.timestamps.is_empty()
        });
        before - self.windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}
