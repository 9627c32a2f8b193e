use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use turnstile::config::TurnstileConfig;
use turnstile::http::HttpServer;
use turnstile::ratelimit::{LimiterConfig, RateLimiter};

#[derive(Parser)]
#[command(name = "turnstile", version, about = "Per-client token bucket rate limiter")]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Address to listen on
    #[arg(long)]
    addr: Option<SocketAddr>,

    /// Maximum burst per client, in tokens
    #[arg(long)]
    capacity: Option<f64>,

    /// Tokens restored per second
    #[arg(long)]
    rate: Option<f64>,

    /// Emit logs as JSON lines
    #[arg(long, default_value_t = false)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = TurnstileConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.addr {
        config.server.http_addr = addr;
    }
    if let Some(capacity) = args.capacity {
        config.rate_limiting.capacity = capacity;
    }
    if let Some(rate) = args.rate {
        config.rate_limiting.rate = rate;
    }
    if args.log_json {
        config.logging.json = true;
    }

    init_tracing(&config);

    info!("Starting Turnstile Rate Limiting Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        http_addr = %config.server.http_addr,
        capacity = config.rate_limiting.capacity,
        rate = config.rate_limiting.rate,
        "Configuration loaded"
    );

    // Initialize the rate limiter
    let rate_limiter = Arc::new(RateLimiter::with_config(LimiterConfig::from(
        &config.rate_limiting,
    ))?);
    rate_limiter.start();
    info!("Rate limiter initialized");

    let http_server = HttpServer::new(config.server.http_addr, rate_limiter.clone());

    // Run the server with graceful shutdown on Ctrl+C
    http_server.serve_with_shutdown(shutdown_signal()).await?;

    rate_limiter.shutdown().await;

    info!("Turnstile Rate Limiting Service stopped");
    Ok(())
}

/// Install the global subscriber. `RUST_LOG` takes precedence over the
/// configured level.
fn init_tracing(config: &TurnstileConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
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
