//! Rate limiting middleware for axum routers.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use tracing::{debug, warn};

use crate::ratelimit::{QuotaStore, RateLimitHeaders, RateLimiter};

/// Header carrying the caller's API token.
pub const API_KEY_HEADER: &str = "API_KEY";
/// Proxy chain header; every listed address is checked.
pub const FORWARDED_FOR_HEADER: &str = "X-Forwarded-For";
/// Single client address set by a proxy.
pub const REAL_IP_HEADER: &str = "X-Real-IP";

/// Body of the 429 response.
pub const DENIED_MESSAGE: &str = "you have reached the maximum number of requests or actions \
                                  allowed within a certain time frame";

/// Derive the keys a request is limited by.
///
/// An API token wins outright. Otherwise every address in `X-Forwarded-For`,
/// then `X-Real-IP`, then the peer address without its port.
pub fn lookup_keys(headers: &HeaderMap, remote: Option<SocketAddr>) -> Vec<String> {
    if let Some(token) = header_str(headers, API_KEY_HEADER) {
        return vec![token.to_string()];
    }

    if let Some(forwarded) = header_str(headers, FORWARDED_FOR_HEADER) {
        let ips: Vec<String> = forwarded
            .split(',')
            .map(str::trim)
            .filter(|ip| !ip.is_empty())
            .map(str::to_string)
            .collect();
        if !ips.is_empty() {
            return ips;
        }
    }

    if let Some(real_ip) = header_str(headers, REAL_IP_HEADER) {
        return vec![real_ip.trim().to_string()];
    }

    remote
        .map(|addr| vec![addr.ip().to_string()])
        .unwrap_or_default()
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
}

/// Middleware that admits or rejects a request before it reaches the router.
///
/// Use with [`axum::middleware::from_fn_with_state`].
pub async fn rate_limit<S: QuotaStore + 'static>(
    State(limiter): State<Arc<RateLimiter<S>>>,
    request: Request,
    next: Next,
) -> Response {
    let remote = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let keys = lookup_keys(request.headers(), remote);

    if keys.is_empty() {
        warn!("No rate limit key could be derived from the request");
    }

    let mut injected = Vec::new();
    for key in &keys {
        let admitted = limiter.verify(key).await;
        collect_headers(&mut injected, &limiter.headers(key).await);

        if !admitted {
            debug!(key = %key, "Request rejected by rate limiter");
            let mut response = (StatusCode::TOO_MANY_REQUESTS, DENIED_MESSAGE).into_response();
            append_headers(response.headers_mut(), injected);
            return response;
        }
    }

    let mut response = next.run(request).await;
    append_headers(response.headers_mut(), injected);
    response
}

fn collect_headers(into: &mut Vec<(HeaderName, HeaderValue)>, headers: &RateLimitHeaders) {
    for (name, value) in headers.iter() {
        match (HeaderName::from_bytes(name.as_bytes()), HeaderValue::from_str(value)) {
            (Ok(name), Ok(value)) => into.push((name, value)),
            _ => warn!(header = %name, value = %value, "Skipping invalid rate limit header"),
        }
    }
}

fn append_headers(headers: &mut HeaderMap, injected: Vec<(HeaderName, HeaderValue)>) {
    for (name, value) in injected {
        headers.append(name, value);
    }
}
