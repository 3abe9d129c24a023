//! Quota resolution from configured overrides.
//!
//! Lookups are exact string matches. Token overrides take precedence over IP
//! overrides, which take precedence over the default.

use std::collections::HashMap;

use tracing::trace;

use crate::config::RateLimiterConfig;

/// An effective quota: `limit` requests every `every` seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    /// Maximum requests allowed in the window; 0 means unlimited
    pub limit: u64,
    /// Window length in seconds
    pub every: u64,
}

impl Quota {
    pub fn new(limit: u64, every: u64) -> Self {
        Self { limit, every }
    }
}

/// Maps a lookup key to its effective quota.
#[derive(Debug, Clone)]
pub struct QuotaResolver {
    tokens: HashMap<String, Quota>,
    ips: HashMap<String, Quota>,
    default: Quota,
}

impl QuotaResolver {
    /// Build the lookup tables. For duplicate entries the first one wins.
    pub fn new(config: &RateLimiterConfig) -> Self {
        let mut tokens = HashMap::with_capacity(config.token.len());
        for entry in &config.token {
            tokens
                .entry(entry.token.clone())
                .or_insert_with(|| Quota::new(entry.requests, entry.every));
        }

        let mut ips = HashMap::with_capacity(config.ip.len());
        for entry in &config.ip {
            ips.entry(entry.ip.clone())
                .or_insert_with(|| Quota::new(entry.requests, entry.every));
        }

        Self {
            tokens,
            ips,
            default: Quota::new(config.default.requests, config.default.every),
        }
    }

    /// Resolve the quota for a token or IP.
    pub fn resolve(&self, key: &str) -> Quota {
        if let Some(quota) = self.tokens.get(key) {
            trace!(key = %key, "Resolved token override");
            return *quota;
        }
        if let Some(quota) = self.ips.get(key) {
            trace!(key = %key, "Resolved IP override");
            return *quota;
        }
        self.default
    }

    pub fn default_quota(&self) -> Quota {
        self.default
    }
}
