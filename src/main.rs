use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bulwark::clock::SystemClock;
use bulwark::config::{BulwarkConfig, DeploymentMode};
use bulwark::http::{HttpServer, RequestPipeline};
use bulwark::metrics::GuardMetrics;
use bulwark::store::RedisStore;

/// Request guard pipeline in front of an HTTP service.
#[derive(Debug, Parser)]
#[command(name = "bulwark", version, about)]
struct Args {
    /// YAML configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Listen address, overriding the configuration
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if args.log_json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .init();
    }

    info!("Starting Bulwark");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    // Invalid configuration stops startup before anything binds
    let mut config = BulwarkConfig::load(args.config.as_deref())?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }
    info!(
        listen_addr = %config.server.listen_addr,
        environment = ?config.server.environment,
        mode = ?config.rate_limiting.mode,
        "Configuration loaded"
    );

    if config.rate_limiting.enabled && config.rate_limiting.mode == DeploymentMode::Distributed {
        check_store(&config).await;
    }

    let metrics = Arc::new(GuardMetrics::new());
    let pipeline = RequestPipeline::from_config(&config, Arc::new(SystemClock), metrics)?;
    info!("Guard pipeline initialized");

    let server = HttpServer::new(config.server.listen_addr, pipeline)
        .with_sweep_interval(Duration::from_secs(config.rate_limiting.sweep_interval_secs));

    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Bulwark stopped");
    Ok(())
}

/// Report whether the shared store answers. Startup continues either way;
/// the configured fail mode covers an unreachable store.
async fn check_store(config: &BulwarkConfig) {
    let Some(url) = config.rate_limiting.store.url.as_deref() else {
        return;
    };
    let timeout = Duration::from_millis(config.rate_limiting.store.timeout_ms);
    match RedisStore::new(url, timeout) {
        Ok(store) => match store.ping().await {
            Ok(()) => info!("Rate limit store reachable"),
            Err(e) => warn!(
                error = %e,
                fail_mode = ?config.rate_limiting.store.fail_mode,
                "Rate limit store unreachable at startup"
            ),
        },
        Err(e) => warn!(error = %e, "Rate limit store URL rejected"),
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
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
