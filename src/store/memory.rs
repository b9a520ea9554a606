//! Process-local window store.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{ScriptReply, StoreError, WindowStore};

#[derive(Debug, Default)]
struct SortedWindow {
    /// (score, member), ascending by score
    members: Vec<(u64, String)>,
    expires_at: u64,
}

/// In-process store with the same semantics as the Redis window script.
///
/// Useful for single-node development and for exercising
/// `DistributedWindowCounter` without a server.
#[derive(Debug, Default)]
pub struct MemoryStore {
    windows: Mutex<HashMap<String, SortedWindow>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live keys.
    pub fn key_count(&self) -> usize {
        self.windows.lock().len()
    }
}

#[async_trait]
impl WindowStore for MemoryStore {
    async fn eval_window(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<ScriptReply, StoreError> {
        let window_ms = window_secs * 1000;
        let mut windows = self.windows.lock();

        if windows.get(key).is_some_and(|w| now_ms > w.expires_at) {
            windows.remove(key);
        }
        let window = windows.entry(key.to_string()).or_default();

        let cutoff = now_ms.saturating_sub(window_ms);
        window.members.retain(|(score, _)| *score >= cutoff);
        let current = window.members.len() as u64;

        if current < limit {
            let at = window.members.partition_point(|(score, _)| *score <= now_ms);
            window.members.insert(at, (now_ms, member.to_string()));
            window.expires_at = now_ms + window_ms;
            return Ok(ScriptReply {
                allowed: true,
                value: limit - current - 1,
            });
        }

        let retry_after = match window.members.first() {
            Some((oldest, _)) => ((oldest + window_ms).saturating_sub(now_ms))
                .div_ceil(1000)
                .max(1),
            None => 1,
        };
        Ok(ScriptReply {
            allowed: false,
            value: retry_after,
        })
    }
}
