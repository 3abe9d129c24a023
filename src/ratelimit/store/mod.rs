//! Quota state storage.
//!
//! Two interchangeable backends implement [`QuotaStore`]: a process-local
//! [`MemoryStore`] and a shared [`RedisStore`]. [`StoreBackend`] is the closed set
//! a process picks from at start-up, so the decision engine never branches on
//! which one it is talking to.

mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use crate::config::{CacheBackend, QuotagateConfig};
use crate::error::Result;

use super::state::{Admission, QuotaState};

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Storage contract for quota states.
///
/// All operations take the caller's `now` (epoch seconds) so that expiry is
/// judged against the same clock the decision engine uses.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Fetch the live state for `key`. Expired states are reported as absent.
    async fn get(&self, key: &str, now: i64) -> Result<Option<QuotaState>>;

    /// Store a freshly initialized state unless a live one already exists.
    ///
    /// Returns whether `state` was written. `ttl` is the time until `state.reset`.
    async fn set(&self, state: &QuotaState, ttl: Duration, now: i64) -> Result<bool>;

    /// Atomically apply the admission test to the live state for `key` and
    /// persist the result. Returns `None` when no live state exists.
    ///
    /// `fallback_limit` is the resolved limit, applied to records that do not
    /// carry their own.
    async fn consume(&self, key: &str, fallback_limit: u64, now: i64)
        -> Result<Option<Admission>>;

    /// Drop states whose window has ended. Returns how many were removed.
    ///
    /// Backends with native expiry have nothing to do here.
    async fn purge_expired(&self, _now: i64) -> Result<usize> {
        Ok(0)
    }
}

/// The quota store selected for this process.
pub enum StoreBackend {
    Memory(MemoryStore),
    Redis(RedisStore),
}

impl StoreBackend {
    /// Build the store named by the configuration's `cache` selector.
    pub async fn from_config(config: &QuotagateConfig) -> Result<Self> {
        match config.backend() {
            CacheBackend::Redis => {
                info!(
                    host = %config.redis.host,
                    port = config.redis.port,
                    "Using Redis as quota store"
                );
                Ok(StoreBackend::Redis(RedisStore::connect(&config.redis).await?))
            }
            CacheBackend::Memory => {
                info!("Using in-memory quota store");
                Ok(StoreBackend::Memory(MemoryStore::new()))
            }
        }
    }

    pub fn kind(&self) -> CacheBackend {
        match self {
            StoreBackend::Memory(_) => CacheBackend::Memory,
            StoreBackend::Redis(_) => CacheBackend::Redis,
        }
    }
}

#[async_trait]
impl QuotaStore for StoreBackend {
    async fn get(&self, key: &str, now: i64) -> Result<Option<QuotaState>> {
        match self {
            StoreBackend::Memory(store) => store.get(key, now).await,
            StoreBackend::Redis(store) => store.get(key, now).await,
        }
    }

    async fn set(&self, state: &QuotaState, ttl: Duration, now: i64) -> Result<bool> {
        match self {
            StoreBackend::Memory(store) => store.set(state, ttl, now).await,
            StoreBackend::Redis(store) => store.set(state, ttl, now).await,
        }
    }

    async fn consume(
        &self,
        key: &str,
        fallback_limit: u64,
        now: i64,
    ) -> Result<Option<Admission>> {
        match self {
            StoreBackend::Memory(store) => store.consume(key, fallback_limit, now).await,
            StoreBackend::Redis(store) => store.consume(key, fallback_limit, now).await,
        }
    }

    async fn purge_expired(&self, now: i64) -> Result<usize> {
        match self {
            StoreBackend::Memory(store) => store.purge_expired(now).await,
            StoreBackend::Redis(store) => store.purge_expired(now).await,
        }
    }
}
