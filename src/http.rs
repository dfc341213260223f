//! HTTP server exposing the metrics endpoint.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::registry::MetricRegistry;

/// Content type of the text exposition produced by prometheus-client.
const OPENMETRICS_CONTENT_TYPE: &str =
    "application/openmetrics-text; version=1.0.0; charset=utf-8";

/// Build the router serving the metrics and health endpoints.
pub fn router(registry: Arc<MetricRegistry>, metrics_path: &str) -> Router {
    Router::new()
        .route(metrics_path, get(serve_metrics))
        .route("/health", get(serve_health))
        .layer(CorsLayer::permissive())
        .with_state(registry)
}

async fn serve_metrics(State(registry): State<Arc<MetricRegistry>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", OPENMETRICS_CONTENT_TYPE)],
        registry.render(),
    )
        .into_response()
}

async fn serve_health() -> Response {
    (StatusCode::OK, "healthy\n").into_response()
}

/// Metrics endpoint server with graceful shutdown.
pub struct HttpServer {
    registry: Arc<MetricRegistry>,
    listen_addr: SocketAddr,
    metrics_path: String,
}

impl HttpServer {
    pub fn new(
        registry: Arc<MetricRegistry>,
        listen_addr: SocketAddr,
        metrics_path: String,
    ) -> Self {
        Self {
            registry,
            listen_addr,
            metrics_path,
        }
    }

    /// Serve until the shutdown signal flips.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = router(self.registry, &self.metrics_path);

        let listener = tokio::net::TcpListener::bind(self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind to {}: {}", self.listen_addr, e))?;

        info!(
            "HTTP server listening on {} (metrics at {})",
            self.listen_addr, self.metrics_path
        );

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                loop {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                    if *shutdown.borrow() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
            .map_err(|e| anyhow::anyhow!("HTTP server error: {}", e))?;

        Ok(())
    }
}
