//! Window counter trait for abstracting local and distributed implementations.

use async_trait::async_trait;
use std::time::Duration;

/// Outcome of one rate limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Capacity of the window this decision reports on
    pub limit: u64,
    /// Requests left in the window; zero when denied
    pub remaining: u64,
    /// Seconds until a slot frees up; only meaningful when denied
    pub retry_after_seconds: u64,
}

impl RateLimitDecision {
    pub fn allow(limit: u64, remaining: u64) -> Self {
        Self {
            allowed: true,
            limit,
            remaining,
            retry_after_seconds: 0,
        }
    }

    pub fn deny(limit: u64, retry_after_seconds: u64) -> Self {
        Self {
            allowed: false,
            limit,
            remaining: 0,
            retry_after_seconds,
        }
    }
}

/// Trait for sliding window counter implementations.
///
/// This trait abstracts over both the in-memory `SlidingWindowCounter` and
/// the store-backed `DistributedWindowCounter` so the rate limiter can work
/// with either.
#[async_trait]
pub trait WindowCounter: Send + Sync {
    /// Trim the window for `key`, then admit and record the request if fewer
    /// than `limit + burst` entries remain.
    async fn record_and_check(
        &self,
        key: &str,
        now: Duration,
        limit: u64,
        window: Duration,
        burst: u64,
    ) -> RateLimitDecision;
}
