//! Guard counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters incremented by the guards. Shared through an `Arc`.
#[derive(Debug, Default)]
pub struct GuardMetrics {
    requests: AtomicU64,
    rate_limited: AtomicU64,
    store_errors: AtomicU64,
    circuit_rejections: AtomicU64,
    content_rejections: AtomicU64,
    ddos_blocks: AtomicU64,
    signature_rejections: AtomicU64,
}

/// Point-in-time copy of [`GuardMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub requests: u64,
    pub rate_limited: u64,
    pub store_errors: u64,
    pub circuit_rejections: u64,
    pub content_rejections: u64,
    pub ddos_blocks: u64,
    pub signature_rejections: u64,
}

impl GuardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rate_limited(&self) {
        self.rate_limited.fetch_add(1, Ordering::Relaxed);
    }

    /// One failed round trip to the shared store.
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_circuit_rejection(&self) {
        self.circuit_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_content_rejection(&self) {
        self.content_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_ddos_block(&self) {
        self.ddos_blocks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_signature_rejection(&self) {
        self.signature_rejections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            requests: self.requests.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            circuit_rejections: self.circuit_rejections.load(Ordering::Relaxed),
            content_rejections: self.content_rejections.load(Ordering::Relaxed),
            ddos_blocks: self.ddos_blocks.load(Ordering::Relaxed),
            signature_rejections: self.signature_rejections.load(Ordering::Relaxed),
        }
    }
}
