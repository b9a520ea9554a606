//! Shared window stores for distributed rate limiting.
//!
//! A store evaluates one sliding window atomically: trim expired members,
//! count, and conditionally add, in a single round trip. Every process that
//! shares a store therefore sees one consistent count per key.

mod memory;
mod redis;

pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur talking to a store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("store round trip exceeded {0:?}")]
    Timeout(Duration),
    #[error("unexpected store reply: {0}")]
    Protocol(String),
}

impl From<::redis::RedisError> for StoreError {
    fn from(err: ::redis::RedisError) -> Self {
        if err.is_io_error() || err.is_connection_refusal() || err.is_connection_dropped() {
            StoreError::Unavailable(err.to_string())
        } else if err.is_timeout() {
            StoreError::Unavailable(format!("timed out: {}", err))
        } else {
            StoreError::Protocol(err.to_string())
        }
    }
}

/// Reply of one window evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScriptReply {
    pub allowed: bool,
    /// Remaining capacity when allowed, retry-after seconds when denied
    pub value: u64,
}

/// An atomic sliding window evaluator.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Evaluate the window `key` at `now_ms`.
    ///
    /// `limit` is the full capacity. `member` must be unique per call so that
    /// requests landing in the same millisecond are all counted.
    async fn eval_window(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<ScriptReply, StoreError>;
}
