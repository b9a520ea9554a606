//! HTTP server implementation.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::pipeline::RequestPipeline;
use crate::error::{BulwarkError, Result};

const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(300);

/// HTTP server that mounts the guard pipeline in front of a router.
pub struct HttpServer {
    /// Address to bind to
    addr: SocketAddr,
    pipeline: RequestPipeline,
    /// Application routes served behind the pipeline
    routes: Router,
    sweep_interval: Duration,
}

impl HttpServer {
    /// Create a server with only the built-in routes.
    pub fn new(addr: SocketAddr, pipeline: RequestPipeline) -> Self {
        Self {
            addr,
            pipeline,
            routes: Router::new(),
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Serve `routes` behind the pipeline alongside the built-in routes.
    pub fn with_routes(mut self, routes: Router) -> Self {
        self.routes = routes;
        self
    }

    /// How often idle limiter and DDoS state is swept.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// The full application: built-in routes plus `routes`, all guarded.
    pub fn router(&self) -> Router {
        let builtin = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .with_state(self.pipeline.clone());

        let app = builtin
            .merge(self.routes.clone())
            .fallback(not_found_handler);
        self.pipeline.wrap(app)
    }

    /// Start the server.
    ///
    /// Serves until `signal` resolves, then drains in-flight connections.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let app = self.router();
        let listener = TcpListener::bind(self.addr).await.map_err(|e| {
            error!(addr = %self.addr, error = %e, "Failed to bind");
            BulwarkError::Server(format!("failed to bind {}: {}", self.addr, e))
        })?;

        info!(addr = %self.addr, "Starting HTTP server with graceful shutdown");

        let sweeper = self.spawn_sweeper();
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await;
        sweeper.abort();

        served.map_err(|e| {
            error!(error = %e, "HTTP server failed");
            BulwarkError::Io(e)
        })
    }

    /// Periodically drop idle per-client state.
    fn spawn_sweeper(&self) -> JoinHandle<()> {
        let pipeline = self.pipeline.clone();
        let period = self.sweep_interval.max(Duration::from_secs(1));
        debug!(period_secs = period.as_secs(), "Starting idle state sweeper");

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                pipeline.sweep();
            }
        })
    }
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(pipeline): State<RequestPipeline>) -> impl IntoResponse {
    Json(pipeline.metrics().snapshot())
}

async fn not_found_handler() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Json(json!({ "error": "Not found" })))
}
