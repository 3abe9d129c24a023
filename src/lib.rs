//! Quotagate - Fixed-Window Rate Limiting
//!
//! This crate grants or denies requests against a per-key quota counted over a
//! fixed window. Keys are API tokens or client IPs, quotas come from per-token and
//! per-IP overrides with a global default, and quota state lives either in process
//! memory or in Redis so that several instances can share it.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
