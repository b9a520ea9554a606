//! Per-route circuit breaker.
//!
//! Each route key owns a small state machine:
//!
//! - `Closed`: calls proceed. Consecutive failures are counted and reaching
//!   the threshold opens the circuit.
//! - `Open`: calls are short-circuited until the recovery timeout elapses.
//!   The first call after that moves the route to `HalfOpen` and becomes the
//!   probe, a single trial call.
//! - `HalfOpen`: only the probe is admitted. Its outcome closes or reopens
//!   the circuit.
//!
//! All transitions happen under one mutex, so the open to half-open flip and
//! the claim of the probe slot are a single atomic step.
//!
//! Outcomes are applied in the order they arrive, whichever call they belong
//! to. A call admitted while the circuit was still closed may finish after
//! the circuit went half-open; its outcome then closes or reopens the circuit
//! even though the trial call has not reported yet. When the trial call
//! reports later its outcome applies to whatever phase it finds.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::clock::{ceil_secs, Clock};
use crate::config::CircuitBreakerConfig;

/// Phase of one route's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Closed,
    Open,
    HalfOpen,
}

/// State of one route's circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitState {
    pub phase: Phase,
    pub consecutive_failures: u32,
    /// When the circuit last opened
    pub opened_at: Option<Duration>,
    /// A half-open probe has been admitted and has not reported back
    pub probe_in_flight: bool,
}

impl Default for CircuitState {
    fn default() -> Self {
        Self {
            phase: Phase::Closed,
            consecutive_failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Whether a call may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDecision {
    Allowed,
    ShortCircuited { retry_after_seconds: u64 },
}

/// Result of [`CircuitBreaker::admit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub decision: CallDecision,
    /// The call is the half-open probe
    pub is_probe: bool,
}

impl Admission {
    fn allowed(is_probe: bool) -> Self {
        Self {
            decision: CallDecision::Allowed,
            is_probe,
        }
    }

    fn short_circuited(retry_after_seconds: u64) -> Self {
        Self {
            decision: CallDecision::ShortCircuited {
                retry_after_seconds,
            },
            is_probe: false,
        }
    }
}

/// Circuit breaker keyed by route.
pub struct CircuitBreaker {
    threshold: u32,
    recovery_timeout: Duration,
    /// Only paths under one of these prefixes are guarded
    protected_prefixes: Vec<String>,
    /// Statuses at or above this count as failures
    failure_status: u16,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<String, CircuitState>>,
}

impl CircuitBreaker {
    /// Create a breaker that guards every path and counts 5xx as failure.
    pub fn new(threshold: u32, recovery_timeout: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            threshold: threshold.max(1),
            recovery_timeout,
            protected_prefixes: vec!["/".to_string()],
            failure_status: 500,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self::new(
            config.threshold,
            Duration::from_secs(config.recovery_timeout_secs),
            clock,
        )
        .with_protected_prefixes(config.protected_prefixes.iter().cloned())
        .with_failure_status(config.failure_status)
    }

    pub fn with_protected_prefixes(mut self, prefixes: impl IntoIterator<Item = String>) -> Self {
        self.protected_prefixes = prefixes.into_iter().collect();
        self
    }

    pub fn with_failure_status(mut self, status: u16) -> Self {
        self.failure_status = status;
        self
    }

    /// Whether calls to `path` go through the breaker.
    pub fn protects(&self, path: &str) -> bool {
        self.protected_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
    }

    /// Whether a response status counts as a downstream failure.
    pub fn is_failure_status(&self, status: u16) -> bool {
        status >= self.failure_status
    }

    /// Decide whether a call to `route` may proceed.
    pub fn before_call(&self, route: &str) -> CallDecision {
        self.admit(route).decision
    }

    /// Like [`before_call`](Self::before_call), but also reports whether the
    /// admitted call holds the half-open probe slot. Callers that may be
    /// cancelled use this to know when [`release_probe`](Self::release_probe)
    /// applies to them.
    pub fn admit(&self, route: &str) -> Admission {
        let now = self.clock.now();
        let mut states = self.states.lock();
        let state = states.entry(route.to_string()).or_default();

        match state.phase {
            Phase::Closed => Admission::allowed(false),
            Phase::Open => {
                let opened_at = state.opened_at.unwrap_or(now);
                let elapsed = now.saturating_sub(opened_at);
                if elapsed >= self.recovery_timeout {
                    state.phase = Phase::HalfOpen;
                    state.probe_in_flight = true;
                    debug!(route = %route, "Circuit half-open, admitting probe");
                    Admission::allowed(true)
                } else {
                    let wait = self.recovery_timeout - elapsed;
                    Admission::short_circuited(ceil_secs(wait).max(1))
                }
            }
            Phase::HalfOpen if state.probe_in_flight => Admission::short_circuited(1),
            Phase::HalfOpen => {
                state.probe_in_flight = true;
                debug!(route = %route, "Circuit half-open, admitting probe");
                Admission::allowed(true)
            }
        }
    }

    /// Record the outcome of a call admitted by [`before_call`](Self::before_call).
    pub fn record_outcome(&self, route: &str, success: bool) {
        let now = self.clock.now();
        let mut states = self.states.lock();
        let state = states.entry(route.to_string()).or_default();

        match (state.phase, success) {
            (Phase::Closed, true) => state.consecutive_failures = 0,
            (Phase::Closed, false) => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.threshold {
                    state.phase = Phase::Open;
                    state.opened_at = Some(now);
                    warn!(
                        route = %route,
                        failures = state.consecutive_failures,
                        "Circuit opened"
                    );
                }
            }
            (Phase::HalfOpen, true) => {
                *state = CircuitState::default();
                info!(route = %route, "Circuit closed after successful probe");
            }
            (Phase::HalfOpen, false) => {
                state.phase = Phase::Open;
                state.consecutive_failures += 1;
                state.opened_at = Some(now);
                state.probe_in_flight = false;
                warn!(route = %route, "Probe failed, circuit reopened");
            }
            // A call admitted before the circuit opened finished late
            (Phase::Open, true) => {}
            (Phase::Open, false) => state.consecutive_failures += 1,
        }
    }

    /// Free the probe slot of a call that never reported an outcome.
    pub fn release_probe(&self, route: &str) {
        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(route) {
            if state.phase == Phase::HalfOpen && state.probe_in_flight {
                state.probe_in_flight = false;
                debug!(route = %route, "Abandoned probe released");
            }
        }
    }

    /// Current phase of `route`; routes never seen are closed.
    pub fn phase(&self, route: &str) -> Phase {
        self.states
            .lock()
            .get(route)
            .map(|s| s.phase)
            .unwrap_or(Phase::Closed)
    }

    /// Snapshot of `route`'s state, if it has been seen.
    pub fn state(&self, route: &str) -> Option<CircuitState> {
        self.states.lock().get(route).cloned()
    }
}
