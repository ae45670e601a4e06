//! Redis-backed sliding-window store.
//!
//! Each (policy, identifier) key is a sorted set of events scored by their
//! timestamp in milliseconds. Recording runs as a Lua script, so trimming,
//! adding and counting happen atomically on the server no matter how many
//! instances write to the same key.

use std::borrow::Cow;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::Script;
use tracing::{debug, info};

use super::store::{CounterStore, WindowCount};
use crate::error::StoreError;

const RECORD_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local member = ARGV[3]

redis.call('ZREMRANGEBYSCORE', key, '-inf', now - window)
redis.call('ZADD', key, now, member)
redis.call('PEXPIRE', key, window)

local count = redis.call('ZCARD', key)
local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {count, tonumber(oldest[2])}
"#;

const COUNT_SCRIPT: &str = r#"
local key = KEYS[1]
local now = tonumber(ARGV[1])
local window = tonumber(ARGV[2])
local lower = '(' .. (now - window)

local count = redis.call('ZCOUNT', key, lower, now)
if count == 0 then
    return {0, -1}
end
local oldest = redis.call('ZRANGEBYSCORE', key, lower, now, 'WITHSCORES', 'LIMIT', 0, 1)
return {count, tonumber(oldest[2])}
"#;

/// Sliding-window [`CounterStore`] stored in Redis.
///
/// Keys are used exactly as given; namespacing is the caller's job
/// (see `DistributedWindowLimiter::with_key_prefix`).
#[derive(Clone)]
pub struct RedisStore {
    connection: ConnectionManager,
    record_script: Script,
    count_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore").finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Wrap an existing connection manager.
    pub fn new(connection: ConnectionManager) -> Self {
        Self {
            connection,
            record_script: Script::new(RECORD_SCRIPT),
            count_script: Script::new(COUNT_SCRIPT),
        }
    }

    /// Open a connection to `url` and verify it with a `PING`.
    ///
    /// The whole handshake is bounded by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;

        let connect = async {
            let mut connection = ConnectionManager::new(client).await?;
            let _: String = redis::cmd("PING").query_async(&mut connection).await?;
            Ok::<_, StoreError>(connection)
        };

        let connection = tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        info!(url = %redact(url), "Connected to shared rate limit store");
        Ok(Self::new(connection))
    }
}

fn window_millis(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

fn into_window_count(reply: Vec<i64>) -> Result<WindowCount, StoreError> {
    match reply.as_slice() {
        [count, oldest] => {
            let count = u64::try_from(*count)
                .map_err(|_| StoreError::UnexpectedReply(format!("negative count {count}")))?;
            let oldest_ms = u64::try_from(*oldest).ok().filter(|_| count > 0);
            Ok(WindowCount { count, oldest_ms })
        }
        other => Err(StoreError::UnexpectedReply(format!(
            "expected [count, oldest], got {other:?}"
        ))),
    }
}

// Strip credentials before a URL reaches the logs.
fn redact(url: &str) -> Cow<'_, str> {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            Cow::Owned(format!("{}://***@{}", &url[..scheme], &url[at + 1..]))
        }
        _ => Cow::Borrowed(url),
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn record(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
        member: &str,
    ) -> Result<WindowCount, StoreError> {
        let mut connection = self.connection.clone();

        let reply: Vec<i64> = self
            .record_script
            .key(key)
            .arg(now_ms)
            .arg(window_millis(window))
            .arg(member)
            .invoke_async(&mut connection)
            .await?;

        debug!(key = %key, reply = ?reply, "Recorded event in shared store");
        into_window_count(reply)
    }

    async fn count(
        &self,
        key: &str,
        window: Duration,
        now_ms: u64,
    ) -> Result<WindowCount, StoreError> {
        let mut connection = self.connection.clone();

        let reply: Vec<i64> = self
            .count_script
            .key(key)
            .arg(now_ms)
            .arg(window_millis(window))
            .invoke_async(&mut connection)
            .await?;

        into_window_count(reply)
    }
}
