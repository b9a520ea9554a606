//! Coarse flood detection per source address.
//!
//! Two signals are tracked per address: concurrent in-flight requests and
//! requests seen in the last minute. Crossing either threshold blocks the
//! address for a fixed period. This runs before rate limiting and is meant
//! to shed obvious floods cheaply, not to enforce quotas.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::clock::{ceil_secs, Clock};
use crate::config::DdosConfig;

const RATE_WINDOW_MS: u64 = 60_000;

/// Why the shield turned a request away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DdosRejection {
    /// The address is serving a block
    Blocked,
    /// This request tripped a threshold; the address is now blocked
    Flooding { retry_after_seconds: u64 },
}

#[derive(Debug, Default)]
struct Activity {
    in_flight: u64,
    recent: VecDeque<u64>,
    blocked_until: Option<u64>,
}

/// Per-address flood heuristics with temporary blocks.
pub struct DdosShield {
    max_in_flight: u64,
    max_per_minute: u64,
    block_for: Duration,
    clock: Arc<dyn Clock>,
    clients: DashMap<String, Activity>,
}

/// Holds one in-flight slot; released on drop.
pub struct InFlightGuard {
    shield: Arc<DdosShield>,
    ip: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Some(mut activity) = self.shield.clients.get_mut(&self.ip) {
            activity.in_flight = activity.in_flight.saturating_sub(1);
        }
    }
}

impl DdosShield {
    pub fn new(
        max_in_flight: u64,
        max_per_minute: u64,
        block_for: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            max_in_flight,
            max_per_minute,
            block_for,
            clock,
            clients: DashMap::new(),
        }
    }

    pub fn from_config(config: &DdosConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.max_in_flight,
            config.max_requests_per_minute,
            Duration::from_secs(config.block_secs),
            clock,
        )
    }

    /// Admit a request from `ip`, holding an in-flight slot until the
    /// returned guard is dropped.
    pub fn admit(self: &Arc<Self>, ip: &str) -> Result<InFlightGuard, DdosRejection> {
        let now_ms = self.clock.now_millis();
        let mut activity = self.clients.entry(ip.to_string()).or_default();

        let blocked_until = activity.blocked_until;
        match blocked_until {
            Some(until) if now_ms < until => {
                debug!(client = %ip, "Request from blocked address");
                return Err(DdosRejection::Blocked);
            }
            Some(_) => {
                debug!(client = %ip, "Block expired");
                activity.blocked_until = None;
            }
            None => {}
        }

        let cutoff = now_ms.saturating_sub(RATE_WINDOW_MS);
        while activity.recent.front().is_some_and(|&ts| ts <= cutoff) {
            activity.recent.pop_front();
        }
        activity.recent.push_back(now_ms);

        let in_flight = activity.in_flight + 1;
        let per_minute = activity.recent.len() as u64;
        if in_flight > self.max_in_flight || per_minute > self.max_per_minute {
            let block_ms = self.block_for.as_millis() as u64;
            activity.blocked_until = Some(now_ms + block_ms);
            warn!(
                client = %ip,
                in_flight = in_flight,
                per_minute = per_minute,
                block_secs = self.block_for.as_secs(),
                "Flood detected, blocking address"
            );
            return Err(DdosRejection::Flooding {
                retry_after_seconds: ceil_secs(self.block_for).max(1),
            });
        }

        activity.in_flight = in_flight;
        drop(activity);

        Ok(InFlightGuard {
            shield: Arc::clone(self),
            ip: ip.to_string(),
        })
    }

    /// Whether `ip` is currently blocked.
    pub fn is_blocked(&self, ip: &str) -> bool {
        let now_ms = self.clock.now_millis();
        self.clients
            .get(ip)
            .and_then(|a| a.blocked_until)
            .is_some_and(|until| now_ms < until)
    }

    /// Requests from `ip` currently holding a slot.
    pub fn in_flight(&self, ip: &str) -> u64 {
        self.clients.get(ip).map(|a| a.in_flight).unwrap_or(0)
    }

    /// Forget idle, unblocked addresses. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now_ms = self.clock.now_millis();
        let cutoff = now_ms.saturating_sub(RATE_WINDOW_MS);
        let before = self.clients.len();

        self.clients.retain(|_, activity| {
            while activity.recent.front().is_some_and(|&ts| ts <= cutoff) {
                activity.recent.pop_front();
            }
            let blocked = activity.blocked_until.is_some_and(|until| now_ms < until);
            blocked || activity.in_flight > 0 || !activity.recent.is_empty()
        });

        before.saturating_sub(self.clients.len())
    }

    pub fn tracked_addresses(&self) -> usize {
        self.clients.len()
    }
}
