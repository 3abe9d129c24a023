use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tokio::signal;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use quotagate::config::{CacheBackend, QuotagateConfig};
use quotagate::http::HttpServer;
use quotagate::ratelimit::{RateLimiter, StoreBackend};

/// How often the in-memory store drops windows that have ended.
const PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[command(name = "quotagate", version, about = "Fixed-window rate limiting for HTTP services")]
struct Args {
    /// Path to a yaml configuration file; environment variables override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);
    match args.log_format {
        LogFormat::Text => subscriber.init(),
        LogFormat::Json => subscriber.json().init(),
    }

    info!("Starting Quotagate Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = QuotagateConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        cache = %config.cache,
        default_requests = config.rate_limiter.default.requests,
        default_every = config.rate_limiter.default.every,
        ip_overrides = config.rate_limiter.ip.len(),
        token_overrides = config.rate_limiter.token.len(),
        "Configuration loaded"
    );

    // Initialize the quota store and the rate limiter on top of it
    let store = StoreBackend::from_config(&config).await?;
    let uses_memory = store.kind() == CacheBackend::Memory;
    let rate_limiter = Arc::new(RateLimiter::new(store, &config.rate_limiter));
    info!("Rate limiter initialized");

    if uses_memory {
        let limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PURGE_INTERVAL);
            loop {
                interval.tick().await;
                let removed = limiter.purge_expired().await;
                if removed > 0 {
                    debug!(removed = removed, "Purged expired quota states");
                }
            }
        });
    }

    let server = HttpServer::new(config.server.listen_addr, rate_limiter);
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Quotagate Rate Limiting Service stopped");
    Ok(())
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
