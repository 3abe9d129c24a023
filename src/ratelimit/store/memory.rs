//! Process-local quota store.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::trace;

use super::QuotaStore;
use crate::error::Result;
use crate::ratelimit::state::{Admission, QuotaState};

/// Volatile quota store backed by a concurrent map.
///
/// Expiry is judged on access by comparing `reset` with `now`; the `ttl`
/// passed to [`QuotaStore::set`] is not used. Each key's read-modify-write in
/// [`QuotaStore::consume`] runs under that key's shard lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, QuotaState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored states, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn evict_if_expired(&self, key: &str, now: i64) {
        if self
            .entries
            .remove_if(key, |_, state| state.is_expired(now))
            .is_some()
        {
            trace!(key = %key, "Evicted expired quota state");
        }
    }
}

#[async_trait]
impl QuotaStore for MemoryStore {
    async fn get(&self, key: &str, now: i64) -> Result<Option<QuotaState>> {
        if let Some(entry) = self.entries.get(key) {
            if !entry.is_expired(now) {
                return Ok(Some(entry.value().clone()));
            }
        } else {
            return Ok(None);
        }

        self.evict_if_expired(key, now);
        Ok(None)
    }

    async fn set(&self, state: &QuotaState, _ttl: Duration, now: i64) -> Result<bool> {
        match self.entries.entry(state.key.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_expired(now) {
                    return Ok(false);
                }
                entry.insert(state.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(state.clone());
            }
        }
        Ok(true)
    }

    async fn consume(
        &self,
        key: &str,
        fallback_limit: u64,
        now: i64,
    ) -> Result<Option<Admission>> {
        let admission = match self.entries.get_mut(key) {
            None => return Ok(None),
            Some(mut entry) => {
                if entry.is_expired(now) {
                    None
                } else {
                    entry.fill_limit(fallback_limit);
                    let admitted = entry.admit();
                    Some(Admission {
                        admitted,
                        state: entry.value().clone(),
                    })
                }
            }
        };

        if admission.is_none() {
            self.evict_if_expired(key, now);
        }
        Ok(admission)
    }

    async fn purge_expired(&self, now: i64) -> Result<usize> {
        let before = self.entries.len();
        self.entries.retain(|_, state| !state.is_expired(now));
        Ok(before.saturating_sub(self.entries.len()))
    }
}
