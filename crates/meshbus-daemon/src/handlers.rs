//! HTTP status surface and daemon lifecycle.

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use meshbus_core::{Bus, BusStats};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shared daemon state.
pub struct AppState {
    /// The running broker.
    pub bus: Bus,
    /// Daemon configuration.
    pub config: Config,
}

impl AppState {
    #[must_use]
    pub fn new(bus: Bus, config: Config) -> Self {
        Self { bus, config }
    }
}

/// Serve the status surface and metrics until ctrl-c, then shut the bus down.
///
/// # Errors
///
/// Returns an error if the status listener cannot be bound or fails.
pub async fn run_server(state: Arc<AppState>) -> Result<()> {
    let config = &state.config;
    let shutdown = CancellationToken::new();

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
        tokio::spawn(metrics::refresh_loop(
            state.bus.clone(),
            Duration::from_millis(config.metrics.refresh_interval_ms),
            shutdown.clone(),
        ));
    }

    tokio::spawn(wait_for_signal(shutdown.clone()));

    let served = if config.status.enabled {
        serve_status(Arc::clone(&state), shutdown.clone()).await
    } else {
        shutdown.cancelled().await;
        Ok(())
    };
    shutdown.cancel();

    state.bus.shutdown().await;
    info!("meshbusd stopped");
    served
}

async fn serve_status(state: Arc<AppState>, shutdown: CancellationToken) -> Result<()> {
    let addr = state.config.status_addr()?;
    let app = router(state);
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind status listener on {addr}"))?;

    info!("Status endpoint listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
        .context("Status server failed")
}

async fn wait_for_signal(shutdown: CancellationToken) {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(e) => error!("Failed to listen for shutdown signal: {}", e),
    }
    shutdown.cancel();
}

/// Routes of the status surface.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "guid": state.bus.guid().to_string(),
    }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> Json<BusStats> {
    Json(state.bus.stats())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshbus_transport::ChannelClient;

    #[tokio::test]
    async fn test_stats_handler_reports_bus_state() {
        let bus = Bus::builder().build().unwrap();
        let (client, _rx) = ChannelClient::new(bus.new_unique_name());
        bus.register_client(client).unwrap();

        let state = Arc::new(AppState::new(bus.clone(), Config::default()));
        let Json(stats) = stats_handler(State(Arc::clone(&state))).await;
        assert_eq!(stats.unique_names, 1);
        assert_eq!(stats.links, 0);

        let body = serde_json::to_value(&stats).unwrap();
        assert_eq!(body["unique_names"], 1);
        bus.shutdown().await;
    }
}
