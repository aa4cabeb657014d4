//! Metrics export for the daemon.
//!
//! The broker keeps no counters of its own; gauges are refreshed from
//! [`Bus::stats`] on a timer and exported in Prometheus format.

use meshbus_core::{Bus, BusStats};
use metrics::gauge;
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Metric names.
pub mod names {
    pub const UNIQUE_NAMES: &str = "meshbus_unique_names";
    pub const VIRTUAL_ENDPOINTS: &str = "meshbus_virtual_endpoints";
    pub const LINKS: &str = "meshbus_links";
    pub const SESSIONS: &str = "meshbus_sessions";
    pub const SESSION_ROUTES: &str = "meshbus_session_routes";
    pub const BINDINGS: &str = "meshbus_bindings";
    pub const ADVERTISED_NAMES: &str = "meshbus_advertised_names";
    pub const DISCOVERED_NAMES: &str = "meshbus_discovered_names";
}

/// Describe the exported metrics.
pub fn init_metrics() {
    metrics::describe_gauge!(names::UNIQUE_NAMES, "Clients attached to this daemon");
    metrics::describe_gauge!(
        names::VIRTUAL_ENDPOINTS,
        "Unique names living behind other daemons"
    );
    metrics::describe_gauge!(names::LINKS, "Open links to other daemons");
    metrics::describe_gauge!(names::SESSIONS, "Live session entries");
    metrics::describe_gauge!(names::SESSION_ROUTES, "Installed session routes");
    metrics::describe_gauge!(names::BINDINGS, "Bound session ports");
    metrics::describe_gauge!(
        names::ADVERTISED_NAMES,
        "Names advertised by local clients"
    );
    metrics::describe_gauge!(
        names::DISCOVERED_NAMES,
        "Advertised names seen on other daemons"
    );

    info!("Metrics initialized");
}

/// Start the Prometheus metrics server.
///
/// # Errors
///
/// Returns an error if the server cannot be started.
pub fn start_metrics_server(port: u16) -> Result<(), Box<dyn std::error::Error>> {
    let addr: SocketAddr = format!("0.0.0.0:{port}").parse()?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()?;

    info!("Metrics server listening on {}", addr);
    Ok(())
}

/// Publish a stats snapshot.
#[allow(clippy::cast_precision_loss)]
pub fn record_stats(stats: &BusStats) {
    gauge!(names::UNIQUE_NAMES).set(stats.unique_names as f64);
    gauge!(names::VIRTUAL_ENDPOINTS).set(stats.virtual_endpoints as f64);
    gauge!(names::LINKS).set(stats.links as f64);
    gauge!(names::SESSIONS).set(stats.sessions as f64);
    gauge!(names::SESSION_ROUTES).set(stats.session_routes as f64);
    gauge!(names::BINDINGS).set(stats.bindings as f64);
    gauge!(names::ADVERTISED_NAMES).set(stats.advertised_names as f64);
    gauge!(names::DISCOVERED_NAMES).set(stats.discovered_names as f64);
}

/// Refresh the gauges from `bus` every `interval` until `shutdown` fires.
pub async fn refresh_loop(bus: Bus, interval: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => record_stats(&bus.stats()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_stats_without_recorder() {
        // No recorder installed: recording is a no-op.
        record_stats(&BusStats {
            unique_names: 3,
            links: 1,
            ..BusStats::default()
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_refresh_loop_stops_on_shutdown() {
        let bus = Bus::builder().build().unwrap();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(refresh_loop(
            bus.clone(),
            Duration::from_millis(100),
            shutdown.clone(),
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        shutdown.cancel();
        task.await.unwrap();
        bus.shutdown().await;
    }
}
