//! Redis-backed quota store shared between limiter instances.
//!
//! States are stored as flat JSON under the lookup key with a native expiry
//! equal to the time left in the window. Initialization and consumption run as
//! Lua scripts so each is a single atomic step on the server.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, RedisResult, Script};
use tracing::{info, warn};

use super::QuotaStore;
use crate::config::RedisConfig;
use crate::error::{QuotaError, Result};
use crate::ratelimit::state::{Admission, QuotaState};

/// KEYS[1] = key, ARGV[1] = payload, ARGV[2] = now, ARGV[3] = ttl seconds.
/// Writes the payload unless a readable state with `reset > now` is present.
/// Undecodable records are overwritten.
const SET_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if raw then
  local ok, current = pcall(cjson.decode, raw)
  if ok and type(current) == 'table' and type(current.reset) == 'number'
      and current.reset > tonumber(ARGV[2]) then
    return 0
  end
end
redis.call('SET', KEYS[1], ARGV[1], 'EX', ARGV[3])
return 1
"#;

/// KEYS[1] = key, ARGV[1] = now, ARGV[2] = fallback limit.
/// Returns false when no live state exists, otherwise {admitted, payload}.
const CONSUME_SCRIPT: &str = r#"
local raw = redis.call('GET', KEYS[1])
if not raw then
  return false
end
local state = cjson.decode(raw)
local now = tonumber(ARGV[1])
if state.reset <= now then
  redis.call('DEL', KEYS[1])
  return false
end
local limit = state.limit
if type(limit) ~= 'number' then
  limit = tonumber(ARGV[2])
  state.limit = limit
end
if limit > 0 and state.remaining <= 0 then
  return {0, raw}
end
state.requests = state.requests + 1
if limit > 0 and state.remaining > 0 then
  state.remaining = state.remaining - 1
end
local encoded = cjson.encode(state)
redis.call('SET', KEYS[1], encoded, 'EX', state.reset - now)
return {1, encoded}
"#;

/// Shared quota store on Redis.
///
/// The connection is owned by the store and reconnects on its own after
/// transient failures. Every call is bounded by the configured timeout.
pub struct RedisStore {
    conn: ConnectionManager,
    set_script: Script,
    consume_script: Script,
    timeout: Duration,
}

impl RedisStore {
    /// Connect using the given configuration.
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = Client::open(config.url())?;
        let timeout = config.timeout();
        let conn = bounded(timeout, ConnectionManager::new(client)).await?;

        info!(
            host = %config.host,
            port = config.port,
            db = config.db,
            "Connected to Redis"
        );
        Ok(Self::with_connection(conn, timeout))
    }

    /// Wrap an existing connection.
    pub fn with_connection(conn: ConnectionManager, timeout: Duration) -> Self {
        Self {
            conn,
            set_script: Script::new(SET_SCRIPT),
            consume_script: Script::new(CONSUME_SCRIPT),
            timeout,
        }
    }

    fn decode(key: &str, raw: &str) -> Result<QuotaState> {
        serde_json::from_str(raw).map_err(|err| {
            warn!(key = %key, error = %err, "Malformed quota record");
            QuotaError::Serialization(err)
        })
    }
}

/// Run a Redis future, turning an elapsed timeout into an error.
async fn bounded<T, F>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = RedisResult<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(QuotaError::from),
        Err(_) => Err(QuotaError::Timeout(limit)),
    }
}

#[async_trait]
impl QuotaStore for RedisStore {
    async fn get(&self, key: &str, now: i64) -> Result<Option<QuotaState>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = bounded(self.timeout, conn.get(key)).await?;

        match raw {
            None => Ok(None),
            Some(raw) => {
                let state = Self::decode(key, &raw)?;
                // Native expiry has one-second granularity; never hand out a
                // window that has already ended.
                if state.is_expired(now) {
                    Ok(None)
                } else {
                    Ok(Some(state))
                }
            }
        }
    }

    async fn set(&self, state: &QuotaState, ttl: Duration, now: i64) -> Result<bool> {
        let payload = serde_json::to_string(state)?;
        let ttl_secs = ttl.as_secs().max(1);

        let mut conn = self.conn.clone();
        let written: i64 = bounded(
            self.timeout,
            self.set_script
                .key(&state.key)
                .arg(payload)
                .arg(now)
                .arg(ttl_secs)
                .invoke_async(&mut conn),
        )
        .await?;

        Ok(written == 1)
    }

    async fn consume(
        &self,
        key: &str,
        fallback_limit: u64,
        now: i64,
    ) -> Result<Option<Admission>> {
        let mut conn = self.conn.clone();
        let reply: Option<(i64, String)> = bounded(
            self.timeout,
            self.consume_script
                .key(key)
                .arg(now)
                .arg(fallback_limit)
                .invoke_async(&mut conn),
        )
        .await?;

        match reply {
            None => Ok(None),
            Some((admitted, raw)) => Ok(Some(Admission {
                admitted: admitted == 1,
                state: Self::decode(key, &raw)?,
            })),
        }
    }
}
