//! Distributed sliding window counter backed by a shared store.
//!
//! This module provides a window counter whose state lives in a
//! [`WindowStore`], so every process that shares the store enforces one
//! consistent limit per key.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{trace, warn};
use uuid::Uuid;

use super::backend::{RateLimitDecision, WindowCounter};
use crate::config::FailMode;
use crate::metrics::GuardMetrics;
use crate::store::WindowStore;

/// A window counter that delegates each check to one atomic store call.
pub struct DistributedWindowCounter<S: WindowStore> {
    /// The shared store.
    store: Arc<S>,
    /// Prepended to every key, e.g. `rate_limit`.
    key_prefix: String,
    /// What to do when the store cannot answer.
    fail_mode: FailMode,
    metrics: Arc<GuardMetrics>,
}

impl<S: WindowStore> DistributedWindowCounter<S> {
    /// Create a new distributed counter.
    pub fn new(store: Arc<S>, key_prefix: &str, fail_mode: FailMode, metrics: Arc<GuardMetrics>) -> Self {
        Self {
            store,
            key_prefix: key_prefix.to_string(),
            fail_mode,
            metrics,
        }
    }

    /// Get the store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    fn store_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }
}

#[async_trait]
impl<S: WindowStore + 'static> WindowCounter for DistributedWindowCounter<S> {
    async fn record_and_check(
        &self,
        key: &str,
        now: Duration,
        limit: u64,
        window: Duration,
        burst: u64,
    ) -> RateLimitDecision {
        let capacity = limit + burst;
        let store_key = self.store_key(key);
        let now_ms = now.as_millis() as u64;
        let member = format!("{}-{}", now_ms, Uuid::new_v4());

        trace!(
            key = %store_key,
            capacity = capacity,
            window_secs = window.as_secs(),
            "Checking distributed rate limit"
        );

        match self
            .store
            .eval_window(&store_key, capacity, window.as_secs(), now_ms, &member)
            .await
        {
            Ok(reply) if reply.allowed => RateLimitDecision::allow(capacity, reply.value),
            Ok(reply) => RateLimitDecision::deny(capacity, reply.value.max(1)),
            Err(e) => {
                self.metrics.record_store_error();
                warn!(
                    key = %store_key,
                    error = %e,
                    fail_mode = ?self.fail_mode,
                    "Rate limit store unavailable"
                );
                match self.fail_mode {
                    FailMode::Open => RateLimitDecision::allow(capacity, capacity),
                    FailMode::Closed => RateLimitDecision::deny(capacity, 1),
                }
            }
        }
    }
}
