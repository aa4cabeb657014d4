//! # meshbusd
//!
//! The meshbus daemon: name registry, session broker and message router.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! meshbusd
//!
//! # Run with a specific config file
//! meshbusd --config /path/to/meshbus.toml
//!
//! # Override settings from the environment
//! MESHBUS_STATUS__PORT=9000 MESHBUS_POLICY__EAVESDROP=true meshbusd
//! ```

mod config;
mod handlers;
mod metrics;

use anyhow::{Context, Result};
use handlers::AppState;
use meshbus_core::{Bus, EavesdropPolicy};
use meshbus_transport::{MemoryHub, MemoryTransport};
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshbus=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config()?;
    metrics::init_metrics();

    let hub = MemoryHub::new();
    let transport = MemoryTransport::new(&hub, &config.bus.mesh_name);
    let bus = Bus::builder()
        .config(config.bus_config()?)
        .transport(Arc::new(transport))
        .policy(Arc::new(EavesdropPolicy::new(config.policy.eavesdrop)))
        .build()
        .context("Failed to start the bus")?;

    tracing::info!(
        guid = %bus.guid(),
        controller = bus.controller_name(),
        "Starting meshbusd at {}{}",
        meshbus_transport::memory::ADDRESS_PREFIX,
        config.bus.mesh_name
    );

    handlers::run_server(Arc::new(AppState::new(bus, config))).await
}

/// `--config <path>` reads that file alone; otherwise the search path and environment apply.
fn load_config() -> Result<config::Config> {
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        if arg == "--config" {
            let path = args.next().context("--config needs a path")?;
            return config::Config::from_file(path);
        }
    }
    config::Config::load()
}
