//! Metrics HTTP Server
//!
//! Provides HTTP endpoint for Prometheus metrics scraping

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::metrics::RelayMetrics;
use crate::Result;

/// HTTP server for serving Prometheus metrics
pub struct MetricsServer {
    metrics: Arc<RelayMetrics>,
    bind_addr: SocketAddr,
}

impl MetricsServer {
    pub fn new(metrics: Arc<RelayMetrics>, bind_addr: SocketAddr) -> Self {
        Self { metrics, bind_addr }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(export_metrics))
            .route("/health", get(health_check))
            .with_state(Arc::clone(&self.metrics))
    }

    /// Serve until `shutdown` fires.
    pub async fn start(self, shutdown: CancellationToken) -> Result<()> {
        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("Failed to bind metrics server to {}", self.bind_addr))?;
        info!(bind_addr = %self.bind_addr, "Metrics server started");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await
            .context("Metrics server failed")?;

        info!("Metrics server stopped");
        Ok(())
    }
}

async fn export_metrics(State(metrics): State<Arc<RelayMetrics>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        metrics.export_prometheus(),
    )
}

async fn health_check() -> &'static str {
    "OK"
}
