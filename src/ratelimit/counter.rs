//! In-memory sliding window counter.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;

use super::backend::{RateLimitDecision, WindowCounter};
use crate::clock::ceil_secs;

/// Time window for rate limiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimeWindow {
    /// Per-second rate limiting
    Second,
    /// Per-minute rate limiting
    Minute,
    /// Per-hour rate limiting
    Hour,
    /// Per-day rate limiting
    Day,
    /// Any other length
    Custom(Duration),
}

impl TimeWindow {
    /// Get the duration of this time window.
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Second => Duration::from_secs(1),
            TimeWindow::Minute => Duration::from_secs(60),
            TimeWindow::Hour => Duration::from_secs(3600),
            TimeWindow::Day => Duration::from_secs(86400),
            TimeWindow::Custom(d) => *d,
        }
    }

    /// Pick the named window for a length in seconds when one exists.
    pub fn from_secs(secs: u64) -> Self {
        match secs {
            1 => TimeWindow::Second,
            60 => TimeWindow::Minute,
            3600 => TimeWindow::Hour,
            86400 => TimeWindow::Day,
            other => TimeWindow::Custom(Duration::from_secs(other)),
        }
    }
}

/// Sliding window counter keeping one timestamp per admitted request.
///
/// Each key maps to an ordered deque of millisecond timestamps. The map is
/// sharded, so concurrent checks on different keys do not contend.
pub struct SlidingWindowCounter {
    windows: DashMap<String, VecDeque<u64>>,
}

impl SlidingWindowCounter {
    /// Create an empty counter.
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
        }
    }

    /// Synchronous form of [`WindowCounter::record_and_check`].
    pub fn check(
        &self,
        key: &str,
        now: Duration,
        limit: u64,
        window: Duration,
        burst: u64,
    ) -> RateLimitDecision {
        let now_ms = now.as_millis() as u64;
        let window_ms = window.as_millis() as u64;
        let capacity = limit + burst;

        let mut entries = self.windows.entry(key.to_string()).or_default();
        trim(&mut entries, now_ms, window_ms);

        if entries.len() as u64 >= capacity {
            let oldest = entries.front().copied().unwrap_or(now_ms);
            let wait = Duration::from_millis((oldest + window_ms).saturating_sub(now_ms));
            return RateLimitDecision::deny(capacity, ceil_secs(wait).max(1));
        }

        entries.push_back(now_ms);
        RateLimitDecision::allow(capacity, capacity - entries.len() as u64)
    }

    /// Number of live entries for `key` after trimming.
    pub fn active_entries(&self, key: &str, now: Duration, window: Duration) -> usize {
        match self.windows.get_mut(key) {
            Some(mut entries) => {
                trim(
                    &mut entries,
                    now.as_millis() as u64,
                    window.as_millis() as u64,
                );
                entries.len()
            }
            None => 0,
        }
    }

    /// Drop keys with no entries inside `longest_window`.
    ///
    /// Returns the number of keys removed.
    pub fn sweep(&self, now: Duration, longest_window: Duration) -> usize {
        let now_ms = now.as_millis() as u64;
        let window_ms = longest_window.as_millis() as u64;
        let before = self.windows.len();

        self.windows.retain(|_, entries| {
            trim(entries, now_ms, window_ms);
            !entries.is_empty()
        });

        let removed = before.saturating_sub(self.windows.len());
        debug!(
            removed = removed,
            remaining = self.windows.len(),
            "Swept idle rate limit windows"
        );
        removed
    }

    /// Get the number of tracked keys.
    pub fn key_count(&self) -> usize {
        self.windows.len()
    }
}

impl Default for SlidingWindowCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowCounter for SlidingWindowCounter {
    async fn record_and_check(
        &self,
        key: &str,
        now: Duration,
        limit: u64,
        window: Duration,
        burst: u64,
    ) -> RateLimitDecision {
        self.check(key, now, limit, window, burst)
    }
}

/// Remove timestamps older than `now - window`.
fn trim(entries: &mut VecDeque<u64>, now_ms: u64, window_ms: u64) {
    let cutoff = now_ms.saturating_sub(window_ms);
    while entries.front().is_some_and(|&ts| ts < cutoff) {
        entries.pop_front();
    }
}
