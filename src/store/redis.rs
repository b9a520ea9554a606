//! Redis-backed window store.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use super::{ScriptReply, StoreError, WindowStore};

/// Trim, count and conditionally add in one atomic step.
///
/// KEYS[1] = window key
/// ARGV    = capacity, window seconds, now (ms), unique member
/// Returns {1, remaining} when admitted, {0, retry_after_secs} when denied.
const WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local limit = tonumber(ARGV[1])
local window_ms = tonumber(ARGV[2]) * 1000
local now = tonumber(ARGV[3])
local member = ARGV[4]

redis.call('ZREMRANGEBYSCORE', key, '-inf', string.format('(%d', now - window_ms))
local current = redis.call('ZCARD', key)

if current < limit then
    redis.call('ZADD', key, now, member)
    redis.call('PEXPIRE', key, window_ms)
    return {1, limit - current - 1}
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
local retry_after = 1
if oldest[2] then
    retry_after = math.max(1, math.ceil((tonumber(oldest[2]) + window_ms - now) / 1000))
end
return {0, retry_after}
"#;

/// Window store backed by a Redis sorted set per key.
///
/// The connection is established lazily and shared: `ConnectionManager`
/// multiplexes concurrent calls over one connection and reconnects on its
/// own after failures.
pub struct RedisStore {
    client: Client,
    connection: OnceCell<ConnectionManager>,
    script: Script,
    timeout: Duration,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.connection.initialized())
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl RedisStore {
    /// Create a store for `url`. No connection is made until first use.
    pub fn new(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = Client::open(url).map_err(|e| StoreError::Protocol(e.to_string()))?;
        Ok(Self {
            client,
            connection: OnceCell::new(),
            script: Script::new(WINDOW_SCRIPT),
            timeout,
        })
    }

    async fn connection(&self) -> Result<ConnectionManager, StoreError> {
        let manager = self
            .connection
            .get_or_try_init(|| async {
                info!("Connecting to rate limit store");
                ConnectionManager::new(self.client.clone())
                    .await
                    .map_err(StoreError::from)
            })
            .await?;
        Ok(manager.clone())
    }

    /// Check that the store answers.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let round_trip = async {
            let mut conn = self.connection().await?;
            let _: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, StoreError>(())
        };
        tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))?
    }
}

#[async_trait]
impl WindowStore for RedisStore {
    async fn eval_window(
        &self,
        key: &str,
        limit: u64,
        window_secs: u64,
        now_ms: u64,
        member: &str,
    ) -> Result<ScriptReply, StoreError> {
        let round_trip = async {
            let mut conn = self.connection().await?;
            let mut invocation = self.script.prepare_invoke();
            invocation
                .key(key)
                .arg(limit)
                .arg(window_secs)
                .arg(now_ms)
                .arg(member);
            let (allowed, value): (i64, i64) = invocation.invoke_async(&mut conn).await?;
            Ok::<_, StoreError>((allowed, value))
        };

        let (allowed, value) = tokio::time::timeout(self.timeout, round_trip)
            .await
            .map_err(|_| StoreError::Timeout(self.timeout))??;

        debug!(key = %key, allowed = allowed, value = value, "Window script evaluated");

        match allowed {
            0 | 1 => Ok(ScriptReply {
                allowed: allowed == 1,
                value: value.max(0) as u64,
            }),
            other => Err(StoreError::Protocol(format!(
                "window script returned flag {}",
                other
            ))),
        }
    }
}
