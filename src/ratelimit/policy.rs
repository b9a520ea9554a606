//! Rate limit policy resolution.
//!
//! This module turns configuration into the concrete limits that apply to a
//! request. Resolution is a pure function of the route key and the caller's
//! tier, so it can be tested exhaustively.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use super::counter::TimeWindow;
use crate::config::RateLimitingConfig;

/// Subscription tier of an authenticated caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Free,
    Basic,
    Pro,
    Enterprise,
}

impl Tier {
    /// Factor applied to the resolved limit.
    pub fn multiplier(&self) -> u64 {
        match self {
            Tier::Free => 1,
            Tier::Basic => 2,
            Tier::Pro => 5,
            Tier::Enterprise => 10,
        }
    }

    /// Parse a tier name; unknown names fall back to `Free`.
    pub fn parse(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "basic" => Tier::Basic,
            "pro" => Tier::Pro,
            "enterprise" => Tier::Enterprise,
            _ => Tier::Free,
        }
    }
}

/// A concrete limit for one window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LimitSpec {
    /// Requests allowed per window
    pub limit: u64,
    /// Window length
    pub window: TimeWindow,
    /// Extra capacity on top of `limit`
    pub burst: u64,
}

impl LimitSpec {
    pub fn window_duration(&self) -> Duration {
        self.window.duration()
    }

    /// Total admissions before the window denies.
    pub fn capacity(&self) -> u64 {
        self.limit + self.burst
    }
}

/// Resolves the limits that apply to a route and caller.
#[derive(Debug, Clone)]
pub struct RateLimitPolicy {
    default: LimitSpec,
    /// Overrides keyed by `"METHOD /path"` (method upper-cased) or `"/path"`
    routes: HashMap<String, LimitSpec>,
    hourly: Option<u64>,
}

impl RateLimitPolicy {
    /// Create a policy with only a default limit.
    pub fn new(default: LimitSpec) -> Self {
        Self {
            default,
            routes: HashMap::new(),
            hourly: None,
        }
    }

    /// Build a policy from the rate limiting configuration.
    pub fn from_config(config: &RateLimitingConfig) -> Self {
        let default = LimitSpec {
            limit: config.per_minute,
            window: TimeWindow::from_secs(config.window_secs),
            burst: config.burst,
        };

        let mut policy = Self::new(default).with_hourly(config.per_hour);
        for (key, route) in &config.routes {
            policy = policy.with_route(
                key,
                LimitSpec {
                    limit: route.limit,
                    window: route
                        .window_secs
                        .map(TimeWindow::from_secs)
                        .unwrap_or(default.window),
                    burst: route.burst.unwrap_or(default.burst),
                },
            );
        }
        policy
    }

    /// Add a route override.
    pub fn with_route(mut self, key: &str, spec: LimitSpec) -> Self {
        self.routes.insert(canonical_route_key(key), spec);
        self
    }

    /// Set the hourly limit, or disable the hourly window with `None`.
    pub fn with_hourly(mut self, per_hour: Option<u64>) -> Self {
        self.hourly = per_hour;
        self
    }

    /// Resolve the primary window limit for a request.
    ///
    /// Exact route-key override, then path-only override, then the default.
    /// Authenticated callers get their tier's multiplier; anonymous callers
    /// are always treated as `Free`.
    pub fn resolve(&self, route_key: &str, tier: Tier, is_authenticated: bool) -> LimitSpec {
        let base = self
            .routes
            .get(route_key)
            .or_else(|| {
                route_key
                    .split_once(' ')
                    .and_then(|(_, path)| self.routes.get(path))
            })
            .copied()
            .unwrap_or(self.default);

        let tier = if is_authenticated { tier } else { Tier::Free };
        LimitSpec {
            limit: base.limit.saturating_mul(tier.multiplier()),
            ..base
        }
    }

    /// Resolve every window that applies: the primary one, then the hourly one.
    pub fn resolve_all(&self, route_key: &str, tier: Tier, is_authenticated: bool) -> Vec<LimitSpec> {
        let mut specs = vec![self.resolve(route_key, tier, is_authenticated)];
        if let Some(per_hour) = self.hourly {
            let tier = if is_authenticated { tier } else { Tier::Free };
            specs.push(LimitSpec {
                limit: per_hour.saturating_mul(tier.multiplier()),
                window: TimeWindow::Hour,
                burst: 0,
            });
        }
        specs
    }

    /// The longest window any resolution can produce.
    pub fn longest_window(&self) -> Duration {
        let mut longest = self.default.window_duration();
        for spec in self.routes.values() {
            longest = longest.max(spec.window_duration());
        }
        if self.hourly.is_some() {
            longest = longest.max(TimeWindow::Hour.duration());
        }
        longest
    }
}

/// Upper-case the method part of a route key so lookups match `route_key()`.
fn canonical_route_key(key: &str) -> String {
    match key.trim().split_once(' ') {
        Some((method, path)) => format!("{} {}", method.to_ascii_uppercase(), path.trim()),
        None => key.trim().to_string(),
    }
}
