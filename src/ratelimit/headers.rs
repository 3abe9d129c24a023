//! Projection of a quota state into response header values.

use std::collections::BTreeMap;

use super::state::QuotaState;

/// Requests observed in the current window.
pub const LIMIT_HEADER: &str = "Ratelimit-Limit";
/// Requests left in the current window.
pub const REMAINING_HEADER: &str = "Ratelimit-Remaining";
/// Time until the current window ends.
pub const RESET_HEADER: &str = "Ratelimit-Reset";

/// Header name to value mapping for one key.
///
/// An empty mapping means no rate-limit information is available for the key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RateLimitHeaders {
    entries: BTreeMap<&'static str, String>,
}

impl RateLimitHeaders {
    pub fn project(state: &QuotaState, now: i64) -> Self {
        let reset_in = state.ttl(now);

        let mut entries = BTreeMap::new();
        entries.insert(LIMIT_HEADER, state.requests.to_string());
        entries.insert(REMAINING_HEADER, state.remaining.to_string());
        entries.insert(RESET_HEADER, humantime::format_duration(reset_in).to_string());
        Self { entries }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &str)> + '_ {
        self.entries.iter().map(|(name, value)| (*name, value.as_str()))
    }
}
