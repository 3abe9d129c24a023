//! The persisted quota record and its fixed-window arithmetic.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::resolver::Quota;

/// Quota state for one key within the current window.
///
/// The serialized shape is the flat record stored by the shared backend:
/// `key`, `requests` (observed count), `every`, `remaining`, `reset` and `limit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaState {
    /// Token or IP address this state belongs to
    pub key: String,
    /// Requests processed so far in this window
    pub requests: u64,
    /// Window length in seconds
    pub every: u64,
    /// Requests still allowed in this window
    pub remaining: u64,
    /// Epoch seconds at which this window ends
    pub reset: i64,
    /// Configured ceiling for the window; 0 means unlimited.
    ///
    /// Records written without it carry `None` until the resolved quota fills it in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,
}

impl QuotaState {
    /// Start a new window for `key` at `now`.
    ///
    /// A zero-length window is stretched to one second so `reset` is always
    /// in the future.
    pub fn fresh(key: &str, quota: Quota, now: i64) -> Self {
        let window = quota.every.max(1);
        Self {
            key: key.to_string(),
            requests: 0,
            every: quota.every,
            remaining: quota.limit,
            reset: now.saturating_add(i64::try_from(window).unwrap_or(i64::MAX)),
            limit: Some(quota.limit),
        }
    }

    /// Take `limit` from the resolved quota when the record does not carry one.
    pub fn fill_limit(&mut self, fallback: u64) {
        self.limit.get_or_insert(fallback);
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit == Some(0)
    }

    /// No requests are left in this window.
    ///
    /// A record without a known limit is exhausted once `remaining` reaches zero.
    pub fn is_exhausted(&self) -> bool {
        !self.is_unlimited() && self.remaining == 0
    }

    /// The window has ended; the state must not be reused.
    pub fn is_expired(&self, now: i64) -> bool {
        self.reset <= now
    }

    /// Time left until the window ends, zero once it has ended.
    pub fn ttl(&self, now: i64) -> Duration {
        Duration::from_secs(u64::try_from(self.reset.saturating_sub(now)).unwrap_or(0))
    }

    /// Apply the admission test and, if admitted, count the request.
    ///
    /// Returns `false` without touching any counter when the window is exhausted.
    pub fn admit(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }

        self.requests += 1;
        if !self.is_unlimited() && self.remaining > 0 {
            self.remaining -= 1;
        }
        true
    }
}

/// Outcome of an atomic consume against a live state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    /// Whether the request was admitted
    pub admitted: bool,
    /// The state as stored after the consume
    pub state: QuotaState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_state() {
        let state = QuotaState::fresh("tokA", Quota::new(2, 30), 1_000);

        assert_eq!(state.key, "tokA");
        assert_eq!(state.requests, 0);
        assert_eq!(state.remaining, 2);
        assert_eq!(state.limit, Some(2));
        assert_eq!(state.every, 30);
        assert_eq!(state.reset, 1_030);
        assert_eq!(state.ttl(1_000), Duration::from_secs(30));
    }

    #[test]
    fn test_zero_window_still_ends_in_the_future() {
        let state = QuotaState::fresh("k", Quota::new(5, 0), 1_000);
        assert_eq!(state.reset, 1_001);
        assert!(!state.is_expired(1_000));
        assert!(state.is_expired(1_001));
    }

    #[test]
    fn test_admit_until_exhausted() {
        let mut state = QuotaState::fresh("k", Quota::new(2, 60), 0);

        assert!(state.admit());
        assert_eq!(state.remaining, 1);
        assert!(state.admit());
        assert_eq!(state.remaining, 0);
        assert!(state.is_exhausted());

        assert!(!state.admit());
        assert_eq!(state.requests, 2, "denied requests are not counted");
        assert_eq!(state.remaining, 0);
    }

    #[test]
    fn test_unlimited_never_decrements() {
        let mut state = QuotaState::fresh("k", Quota::new(0, 60), 0);
        for _ in 0..5 {
            assert!(state.admit());
        }
        assert!(state.is_unlimited());
        assert_eq!(state.remaining, 0);
        assert_eq!(state.requests, 5);
    }

    #[test]
    fn test_ttl_saturates_at_zero() {
        let state = QuotaState::fresh("k", Quota::new(1, 10), 100);
        assert_eq!(state.ttl(105), Duration::from_secs(5));
        assert_eq!(state.ttl(200), Duration::ZERO);
    }

    #[test]
    fn test_record_field_names() {
        let state = QuotaState::fresh("10.0.0.1", Quota::new(100, 60), 1_700_000_000);
        let value = serde_json::to_value(&state).unwrap();

        assert_eq!(value["key"], "10.0.0.1");
        assert_eq!(value["requests"], 0);
        assert_eq!(value["every"], 60);
        assert_eq!(value["remaining"], 100);
        assert_eq!(value["reset"], 1_700_000_060i64);
        assert_eq!(value["limit"], 100);
    }

    #[test]
    fn test_record_without_limit_takes_resolved_limit() {
        let raw = r#"{"key":"k","requests":3,"every":60,"remaining":7,"reset":1700000060}"#;
        let mut state: QuotaState = serde_json::from_str(raw).unwrap();
        assert_eq!(state.limit, None);
        assert!(!state.is_unlimited());

        state.fill_limit(10);
        assert_eq!(state.limit, Some(10));
        state.fill_limit(0);
        assert_eq!(state.limit, Some(10), "a stored limit is never replaced");

        assert!(state.admit());
        assert_eq!(state.remaining, 6);
        assert_eq!(state.requests, 4);
    }

    #[test]
    fn test_record_without_limit_is_exhausted_at_zero() {
        let raw =
            r#"{"key":"10.0.0.1","requests":100,"every":60,"remaining":0,"reset":1700000060}"#;
        let mut state: QuotaState = serde_json::from_str(raw).unwrap();

        assert!(state.is_exhausted());
        assert!(!state.admit());
        assert_eq!(state.requests, 100);
    }

    #[test]
    fn test_record_without_limit_serializes_without_it() {
        let raw = r#"{"key":"k","requests":3,"every":60,"remaining":7,"reset":1700000060}"#;
        let state: QuotaState = serde_json::from_str(raw).unwrap();
        let value = serde_json::to_value(&state).unwrap();
        assert!(value.get("limit").is_none());
    }

    #[test]
    fn test_malformed_record_is_an_error() {
        assert!(serde_json::from_str::<QuotaState>(r#"{"key":"k","requests":"many"}"#).is_err());
    }
}
