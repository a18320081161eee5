//! In-process sliding-window store.

use std::collections::{HashMap, VecDeque};

use parking_lot::Mutex;
use tracing::debug;

use super::{RateLimitStore, WindowOutcome};
use crate::error::Result;

/// Interval between sweeps of idle buckets, in seconds.
pub const CLEANUP_INTERVAL_SECS: f64 = 300.0;

/// Smallest `retry_after` reported on rejection.
pub const MIN_RETRY_AFTER_SECS: f64 = 0.1;

/// Timestamps of admitted requests for one bucket, oldest first.
#[derive(Debug, Default)]
pub struct SlidingWindow {
    hits: VecDeque<f64>,
    window_secs: f64,
}

impl SlidingWindow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict, check, and record in one step. The caller provides exclusion.
    pub fn allow(&mut self, max_requests: u32, window_secs: f64, now: f64) -> WindowOutcome {
        self.window_secs = window_secs;
        let cutoff = now - window_secs;
        while self.hits.front().is_some_and(|&t| t <= cutoff) {
            self.hits.pop_front();
        }

        let max = max_requests as usize;
        if self.hits.len() >= max {
            let retry_after = self
                .hits
                .front()
                .map(|&oldest| oldest + window_secs - now)
                .unwrap_or(window_secs)
                .max(MIN_RETRY_AFTER_SECS);
            return WindowOutcome {
                allowed: false,
                remaining: 0,
                retry_after,
            };
        }

        self.hits.push_back(now);
        WindowOutcome {
            allowed: true,
            remaining: (max - self.hits.len()) as u32,
            retry_after: 0.0,
        }
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    /// Empty, or nothing recorded for longer than twice the window.
    fn is_idle(&self, now: f64) -> bool {
        match self.hits.back() {
            None => true,
            Some(&newest) => now - newest > 2.0 * self.window_secs,
        }
    }
}

#[derive(Debug)]
struct Buckets {
    windows: HashMap<String, SlidingWindow>,
    last_cleanup: f64,
}

/// Process-local store: one mutex over every bucket.
///
/// Correct for a single process only; two processes each get their own
/// budget.
#[derive(Debug)]
pub struct MemoryStore {
    buckets: Mutex<Buckets>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(Buckets {
                windows: HashMap::new(),
                last_cleanup: f64::NEG_INFINITY,
            }),
        }
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.lock().windows.len()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimitStore for MemoryStore {
    fn allow(
        &self,
        bucket_key: &str,
        max_requests: u32,
        window_secs: f64,
        now: f64,
    ) -> Result<WindowOutcome> {
        let mut buckets = self.buckets.lock();
        if now - buckets.last_cleanup >= CLEANUP_INTERVAL_SECS {
            buckets.last_cleanup = now;
            let before = buckets.windows.len();
            buckets.windows.retain(|_, w| !w.is_idle(now));
            let purged = before - buckets.windows.len();
            if purged > 0 {
                debug!(purged, remaining = buckets.windows.len(), "purged idle rate-limit buckets");
            }
        }

        let window = buckets
            .windows
            .entry(bucket_key.to_string())
            .or_default();
        Ok(window.allow(max_requests, window_secs, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn timestamp_exactly_at_cutoff_is_evicted() {
        let mut w = SlidingWindow::new();
        assert!(w.allow(1, 10.0, 0.0).allowed);
        assert!(!w.allow(1, 10.0, 9.99).allowed);
        assert!(w.allow(1, 10.0, 10.0).allowed);
        assert_eq!(w.len(), 1);
    }

    #[test]
    fn remaining_counts_down() {
        let mut w = SlidingWindow::new();
        let remaining: Vec<u32> = (0..3).map(|i| w.allow(3, 60.0, i as f64).remaining).collect();
        assert_eq!(remaining, vec![2, 1, 0]);
    }

    #[test]
    fn retry_after_is_floored() {
        let mut w = SlidingWindow::new();
        assert!(w.allow(1, 1.0, 0.0).allowed);
        let out = w.allow(1, 1.0, 0.99);
        assert!(!out.allowed);
        assert_relative_eq!(out.retry_after, MIN_RETRY_AFTER_SECS);
    }

    #[test]
    fn idle_buckets_are_purged_on_sweep() {
        let store = MemoryStore::new();
        store.allow("a:light", 5, 60.0, 0.0).expect("allow");
        store.allow("b:light", 5, 60.0, 0.0).expect("allow");
        assert_eq!(store.bucket_count(), 2);

        // First call after the interval sweeps both stale buckets, then
        // creates the one being asked for.
        store.allow("a:light", 5, 60.0, 400.0).expect("allow");
        assert_eq!(store.bucket_count(), 1);
    }

    #[test]
    fn recent_buckets_survive_sweep() {
        let store = MemoryStore::new();
        store.allow("a:heavy", 5, 600.0, 0.0).expect("allow");
        store.allow("b:light", 5, 60.0, 350.0).expect("allow");
        assert_eq!(store.bucket_count(), 2);
    }
}
