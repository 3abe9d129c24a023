//! HTTP server hosting the rate-limited routes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::rate_limit;
use crate::error::{QuotaError, Result};
use crate::ratelimit::{QuotaStore, RateLimiter};

/// Build the application router with every route behind the rate limiter.
pub fn router<S: QuotaStore + 'static>(limiter: Arc<RateLimiter<S>>) -> Router {
    Router::new()
        .route("/", get(|| async { "Hello from behind the rate limiter!" }))
        .layer(axum::middleware::from_fn_with_state(limiter, rate_limit::<S>))
}

/// HTTP server for the rate-limited service.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    /// Routes with the rate limiting layer applied
    router: Router,
}

impl HttpServer {
    /// Create a new server around a rate limiter.
    pub fn new<S: QuotaStore + 'static>(addr: SocketAddr, limiter: Arc<RateLimiter<S>>) -> Self {
        Self {
            addr,
            router: router(limiter),
        }
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve_on(listener, signal).await
    }

    /// Serve on an already bound listener until `signal` resolves.
    pub async fn serve_on<F>(self, listener: TcpListener, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Starting HTTP server with graceful shutdown");

        axum::serve(
            listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(error = %e, "HTTP server failed");
            QuotaError::Io(e)
        })
    }
}
