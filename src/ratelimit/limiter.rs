//! Core rate limiter implementation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

use super::backend::{RateLimitDecision, WindowCounter};
use super::counter::SlidingWindowCounter;
use super::descriptor::RequestDescriptor;
use super::distributed::DistributedWindowCounter;
use super::policy::RateLimitPolicy;
use crate::clock::Clock;
use crate::config::{DeploymentMode, RateLimitingConfig};
use crate::error::{BulwarkError, Result};
use crate::metrics::GuardMetrics;
use crate::store::RedisStore;

/// The rate limiter that ties a clock, a window counter and a policy together.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter {
    counter: Arc<dyn WindowCounter>,
    /// Set when the counter is process-local, so the sweeper can reach it
    local: Option<Arc<SlidingWindowCounter>>,
    policy: RateLimitPolicy,
    clock: Arc<dyn Clock>,
    /// Paths that are never limited, matched exactly
    bypass: HashSet<String>,
}

impl RateLimiter {
    /// Create a limiter over any window counter.
    pub fn new(
        counter: Arc<dyn WindowCounter>,
        policy: RateLimitPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            counter,
            local: None,
            policy,
            clock,
            bypass: HashSet::new(),
        }
    }

    /// Create a limiter backed by an in-memory counter.
    pub fn local(policy: RateLimitPolicy, clock: Arc<dyn Clock>) -> Self {
        let counter = Arc::new(SlidingWindowCounter::new());
        Self {
            counter: counter.clone(),
            local: Some(counter),
            policy,
            clock,
            bypass: HashSet::new(),
        }
    }

    /// Build the limiter the configuration asks for.
    ///
    /// `distributed` mode connects lazily, so an unreachable store does not
    /// prevent startup; it only degrades to the configured fail mode.
    pub fn from_config(
        config: &RateLimitingConfig,
        clock: Arc<dyn Clock>,
        metrics: Arc<GuardMetrics>,
    ) -> Result<Self> {
        let policy = RateLimitPolicy::from_config(config);
        let limiter = match config.mode {
            DeploymentMode::Local => Self::local(policy, clock),
            DeploymentMode::Distributed => {
                let url = config.store.url.as_deref().ok_or_else(|| {
                    BulwarkError::Config("distributed mode requires rate_limiting.store.url".into())
                })?;
                let store = RedisStore::new(url, Duration::from_millis(config.store.timeout_ms))?;
                let counter = DistributedWindowCounter::new(
                    Arc::new(store),
                    &config.store.key_prefix,
                    config.store.fail_mode,
                    metrics,
                );
                Self::new(Arc::new(counter), policy, clock)
            }
        };
        Ok(limiter.with_bypass_paths(config.bypass_paths.iter().cloned()))
    }

    /// Replace the set of bypass paths.
    pub fn with_bypass_paths(mut self, paths: impl IntoIterator<Item = String>) -> Self {
        self.bypass = paths.into_iter().collect();
        self
    }

    /// Whether `path` skips rate limiting entirely.
    pub fn is_bypassed(&self, path: &str) -> bool {
        self.bypass.contains(path)
    }

    /// Check and record one request.
    ///
    /// Returns `None` for bypass paths. Otherwise every applicable window is
    /// evaluated; the request is denied if any window denies, with the
    /// longest retry hint among the denying windows. When allowed, the
    /// decision reports the primary window.
    pub async fn check(&self, descriptor: &RequestDescriptor) -> Option<RateLimitDecision> {
        if self.is_bypassed(&descriptor.path) {
            trace!(path = %descriptor.path, "Rate limit bypassed");
            return None;
        }

        let now = self.clock.now();
        let specs = self.policy.resolve_all(
            &descriptor.route_key,
            descriptor.tier(),
            descriptor.is_authenticated(),
        );

        let mut primary: Option<RateLimitDecision> = None;
        let mut denied: Option<RateLimitDecision> = None;

        for (slot, spec) in specs.into_iter().enumerate() {
            let window = spec.window_duration();
            let key = counter_key(descriptor, window, slot);
            let decision = self
                .counter
                .record_and_check(&key, now, spec.limit, window, spec.burst)
                .await;

            trace!(
                key = %key,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "Window evaluated"
            );

            if primary.is_none() {
                primary = Some(decision);
            }
            if !decision.allowed {
                denied = match denied {
                    Some(prev) if prev.retry_after_seconds >= decision.retry_after_seconds => Some(prev),
                    _ => Some(decision),
                };
            }
        }

        if let Some(decision) = denied {
            warn!(
                client = %descriptor.client_key,
                route = %descriptor.route_key,
                retry_after = decision.retry_after_seconds,
                "Rate limit exceeded"
            );
            return Some(decision);
        }

        debug!(
            client = %descriptor.client_key,
            route = %descriptor.route_key,
            "Rate limit check passed"
        );
        primary
    }

    /// Drop idle in-memory windows. Returns the number of keys removed, or
    /// zero when the counter lives in a shared store.
    pub fn sweep(&self) -> usize {
        match &self.local {
            Some(counter) => counter.sweep(self.clock.now(), self.policy.longest_window()),
            None => 0,
        }
    }

    /// Number of keys held by the in-memory counter.
    pub fn local_key_count(&self) -> usize {
        self.local.as_ref().map(|c| c.key_count()).unwrap_or(0)
    }
}

/// Key for one client, route and window.
///
/// The hourly window gets its own tag so that a primary window of the same
/// length never shares its entries.
fn counter_key(descriptor: &RequestDescriptor, window: Duration, slot: usize) -> String {
    match slot {
        0 => format!(
            "{}:{}:{}s",
            descriptor.client_key,
            descriptor.route_key,
            window.as_secs()
        ),
        _ => format!(
            "{}:{}:{}s:hourly",
            descriptor.client_key,
            descriptor.route_key,
            window.as_secs()
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::{FailMode, RouteLimit};
    use crate::ratelimit::{Identity, LimitSpec, TimeWindow, Tier};
    use crate::store::MemoryStore;
    use axum::http::Method;

    fn minute(limit: u64, burst: u64) -> LimitSpec {
        LimitSpec {
            limit,
            window: TimeWindow::Minute,
            burst,
        }
    }

    fn limiter(policy: RateLimitPolicy) -> (RateLimiter, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(1_000)));
        let limiter = RateLimiter::local(policy, clock.clone())
            .with_bypass_paths(["/health".to_string(), "/metrics".to_string()]);
        (limiter, clock)
    }

    fn get(path: &str) -> RequestDescriptor {
        RequestDescriptor::new(Method::GET, path, "10.0.0.1")
    }

    #[tokio::test]
    async fn test_bypass_paths_are_not_counted() {
        let (limiter, _clock) = limiter(RateLimitPolicy::new(minute(1, 0)));

        for _ in 0..5 {
            assert!(limiter.check(&get("/health")).await.is_none());
        }
        assert_eq!(limiter.local_key_count(), 0);

        // A sub-path is not an exact match
        assert!(limiter.check(&get("/health/deep")).await.is_some());
    }

    #[tokio::test]
    async fn test_decreasing_remaining_then_denial() {
        let (limiter, _clock) = limiter(RateLimitPolicy::new(minute(3, 0)));

        for expected in [2, 1, 0] {
            let decision = limiter.check(&get("/api/items")).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected);
            assert_eq!(decision.limit, 3);
        }

        let decision = limiter.check(&get("/api/items")).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
        assert_eq!(decision.retry_after_seconds, 60);
    }

    #[tokio::test]
    async fn test_window_recovers_after_clock_advances() {
        let (limiter, clock) = limiter(RateLimitPolicy::new(minute(1, 0)));

        assert!(limiter.check(&get("/a")).await.unwrap().allowed);
        assert!(!limiter.check(&get("/a")).await.unwrap().allowed);

        clock.advance(Duration::from_millis(60_001));
        assert!(limiter.check(&get("/a")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_routes_and_clients_are_separate() {
        let (limiter, _clock) = limiter(RateLimitPolicy::new(minute(1, 0)));

        assert!(limiter.check(&get("/a")).await.unwrap().allowed);
        assert!(limiter.check(&get("/b")).await.unwrap().allowed);

        let other = RequestDescriptor::new(Method::GET, "/a", "10.0.0.2");
        assert!(limiter.check(&other).await.unwrap().allowed);

        // Numeric ids share one route key
        assert!(limiter.check(&get("/items/1")).await.unwrap().allowed);
        assert!(!limiter.check(&get("/items/2")).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_hourly_window_denies_independently() {
        let policy = RateLimitPolicy::new(minute(2, 0)).with_hourly(Some(3));
        let (limiter, clock) = limiter(policy);

        assert!(limiter.check(&get("/a")).await.unwrap().allowed);
        assert!(limiter.check(&get("/a")).await.unwrap().allowed);

        clock.advance(Duration::from_secs(61));
        let decision = limiter.check(&get("/a")).await.unwrap();
        assert!(decision.allowed);
        // Reported against the minute window
        assert_eq!(decision.limit, 2);
        assert_eq!(decision.remaining, 1);

        clock.advance(Duration::from_secs(1));
        let decision = limiter.check(&get("/a")).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.limit, 3);
        // The first hourly entry was recorded 62s ago
        assert_eq!(decision.retry_after_seconds, 3600 - 62);
    }

    #[tokio::test]
    async fn test_retry_after_is_max_of_denying_windows() {
        let policy = RateLimitPolicy::new(minute(1, 0)).with_hourly(Some(1));
        let (limiter, _clock) = limiter(policy);

        assert!(limiter.check(&get("/a")).await.unwrap().allowed);
        let decision = limiter.check(&get("/a")).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_seconds, 3600);
    }

    #[tokio::test]
    async fn test_hourly_route_override_counts_each_request_once() {
        let policy = RateLimitPolicy::new(minute(60, 0))
            .with_route(
                "/api/export",
                LimitSpec {
                    limit: 10,
                    window: TimeWindow::Hour,
                    burst: 0,
                },
            )
            .with_hourly(Some(1000));
        let (limiter, clock) = limiter(policy);

        for expected in (0..10).rev() {
            clock.advance(Duration::from_millis(10));
            let decision = limiter.check(&get("/api/export")).await.unwrap();
            assert!(decision.allowed);
            assert_eq!(decision.limit, 10);
            assert_eq!(decision.remaining, expected);
        }
        assert!(!limiter.check(&get("/api/export")).await.unwrap().allowed);
    }

    #[test]
    fn test_counter_keys_differ_per_window_slot() {
        let descriptor = get("/a");
        let primary = counter_key(&descriptor, Duration::from_secs(3600), 0);
        let hourly = counter_key(&descriptor, Duration::from_secs(3600), 1);
        assert_eq!(primary, "10.0.0.1:GET /a:3600s");
        assert_ne!(primary, hourly);
    }

    #[tokio::test]
    async fn test_authenticated_tier_scales_limit() {
        let (limiter, _clock) = limiter(RateLimitPolicy::new(minute(2, 0)));
        let identity = Identity {
            user_id: "u1".to_string(),
            tier: Tier::Basic,
        };
        let descriptor = get("/a").with_identity(Some(identity));

        let decision = limiter.check(&descriptor).await.unwrap();
        assert_eq!(decision.limit, 4);
        assert_eq!(decision.remaining, 3);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_keys() {
        let (limiter, clock) = limiter(RateLimitPolicy::new(minute(5, 0)));
        limiter.check(&get("/a")).await;
        limiter.check(&get("/b")).await;
        assert_eq!(limiter.local_key_count(), 2);

        clock.advance(Duration::from_secs(120));
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.local_key_count(), 0);
    }

    #[tokio::test]
    async fn test_from_config_local_mode() {
        let mut config = RateLimitingConfig::default();
        config.routes.insert(
            "POST /api/auth/login".to_string(),
            RouteLimit {
                limit: 1,
                window_secs: None,
                burst: Some(0),
            },
        );
        let clock = Arc::new(ManualClock::new(Duration::ZERO));
        let limiter =
            RateLimiter::from_config(&config, clock, Arc::new(GuardMetrics::new())).unwrap();

        assert!(limiter.is_bypassed("/health"));
        let login = RequestDescriptor::new(Method::POST, "/api/auth/login", "10.0.0.1");
        assert!(limiter.check(&login).await.unwrap().allowed);
        assert!(!limiter.check(&login).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_distributed_counter_behaves_like_local() {
        let clock = Arc::new(ManualClock::new(Duration::from_secs(5)));
        let counter = DistributedWindowCounter::new(
            Arc::new(MemoryStore::new()),
            "rate_limit",
            FailMode::Open,
            Arc::new(GuardMetrics::new()),
        );
        let limiter = RateLimiter::new(
            Arc::new(counter),
            RateLimitPolicy::new(minute(2, 1)),
            clock,
        );

        for expected in [2, 1, 0] {
            assert_eq!(limiter.check(&get("/a")).await.unwrap().remaining, expected);
        }
        assert!(!limiter.check(&get("/a")).await.unwrap().allowed);
        // Sweeping is a no-op for shared stores
        assert_eq!(limiter.sweep(), 0);
    }
}
