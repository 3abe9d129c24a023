//! Fixed-window decision engine.

use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::config::{BackendErrorPolicy, RateLimiterConfig};

use super::clock::{Clock, SystemClock};
use super::headers::RateLimitHeaders;
use super::resolver::{Quota, QuotaResolver};
use super::state::QuotaState;
use super::store::QuotaStore;

/// Passes through the lookup loop before a request is denied outright.
///
/// A pass creates the window when it is missing and then consumes from it. A
/// window that closes before the consume costs one pass.
const MAX_ATTEMPTS: usize = 3;

/// Result of reading the state for a key under the backend-error policy.
enum Lookup {
    Found(QuotaState),
    Missing,
    Denied,
}

/// The rate limiter that decides whether a request for a key is admitted.
///
/// This struct is thread-safe and can be shared across multiple tasks.
pub struct RateLimiter<S> {
    /// Where quota states live
    store: S,
    /// Configured quotas
    resolver: QuotaResolver,
    /// Source of "now"
    clock: Arc<dyn Clock>,
    /// Handling of failed lookups
    on_backend_error: BackendErrorPolicy,
}

impl<S: QuotaStore> RateLimiter<S> {
    /// Create a rate limiter over `store` using wall-clock time.
    pub fn new(store: S, config: &RateLimiterConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    /// Create a rate limiter with an explicit time source.
    pub fn with_clock(store: S, config: &RateLimiterConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            resolver: QuotaResolver::new(config),
            clock,
            on_backend_error: config.on_backend_error,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Decide whether one more request for `key` is admitted.
    ///
    /// Never fails: backend errors end in a denial or, for lookups under
    /// [`BackendErrorPolicy::ResetWindow`], in a new window.
    pub async fn verify(&self, key: &str) -> bool {
        let quota = self.resolver.resolve(key);

        for attempt in 1..=MAX_ATTEMPTS {
            let now = self.clock.now();

            let mut state = match self.lookup(key, now).await {
                Lookup::Found(state) => state,
                Lookup::Denied => return false,
                Lookup::Missing => {
                    self.initialize(key, quota, now).await;
                    match self.lookup(key, now).await {
                        Lookup::Found(state) => state,
                        Lookup::Denied => return false,
                        Lookup::Missing => {
                            trace!(
                                key = %key,
                                attempt = attempt,
                                "No quota state after initializing"
                            );
                            continue;
                        }
                    }
                }
            };
            state.fill_limit(quota.limit);

            if state.is_exhausted() {
                debug!(
                    key = %key,
                    limit = ?state.limit,
                    reset = state.reset,
                    "Rate limit exceeded"
                );
                return false;
            }

            if state.is_unlimited() {
                trace!(key = %key, "No limit configured, admitting");
                return true;
            }

            match self.store.consume(key, quota.limit, now).await {
                Ok(Some(admission)) => {
                    if admission.admitted {
                        trace!(
                            key = %key,
                            remaining = admission.state.remaining,
                            requests = admission.state.requests,
                            "Request admitted"
                        );
                    } else {
                        debug!(key = %key, limit = ?admission.state.limit, "Rate limit exceeded");
                    }
                    return admission.admitted;
                }
                Ok(None) => {
                    trace!(key = %key, attempt = attempt, "Window closed before consume, retrying");
                }
                Err(err) => {
                    warn!(
                        key = %key,
                        error = %err,
                        "Failed to update quota state, denying request"
                    );
                    return false;
                }
            }
        }

        warn!(
            key = %key,
            attempts = MAX_ATTEMPTS,
            "Could not establish quota state, denying request"
        );
        false
    }

    /// Rate-limit headers for `key`, empty when no state can be read.
    pub async fn headers(&self, key: &str) -> RateLimitHeaders {
        let now = self.clock.now();
        match self.store.get(key, now).await {
            Ok(Some(state)) => RateLimitHeaders::project(&state, now),
            Ok(None) => RateLimitHeaders::default(),
            Err(err) => {
                debug!(key = %key, error = %err, "No rate limit headers available");
                RateLimitHeaders::default()
            }
        }
    }

    /// Drop states whose window has ended from stores that need it.
    pub async fn purge_expired(&self) -> usize {
        match self.store.purge_expired(self.clock.now()).await {
            Ok(removed) => removed,
            Err(err) => {
                warn!(error = %err, "Failed to purge expired quota states");
                0
            }
        }
    }

    async fn lookup(&self, key: &str, now: i64) -> Lookup {
        match self.store.get(key, now).await {
            Ok(Some(state)) => Lookup::Found(state),
            Ok(None) => Lookup::Missing,
            Err(err) => match self.on_backend_error {
                BackendErrorPolicy::Deny => {
                    warn!(key = %key, error = %err, "Quota lookup failed, denying request");
                    Lookup::Denied
                }
                BackendErrorPolicy::ResetWindow => {
                    warn!(key = %key, error = %err, "Quota lookup failed, starting a new window");
                    Lookup::Missing
                }
            },
        }
    }

    async fn initialize(&self, key: &str, quota: Quota, now: i64) {
        let state = QuotaState::fresh(key, quota, now);

        match self.store.set(&state, state.ttl(now), now).await {
            Ok(true) => debug!(
                key = %key,
                limit = quota.limit,
                every = quota.every,
                reset = state.reset,
                "Created quota state"
            ),
            Ok(false) => trace!(key = %key, "Quota state already initialized"),
            Err(err) => warn!(key = %key, error = %err, "Failed to store quota state"),
        }
    }
}
