//! HTTP surface: the rate limiting middleware and the server that hosts it.

mod middleware;
mod server;

pub use middleware::{
    lookup_keys, rate_limit, API_KEY_HEADER, DENIED_MESSAGE, FORWARDED_FOR_HEADER, REAL_IP_HEADER,
};
pub use server::{router, HttpServer};
