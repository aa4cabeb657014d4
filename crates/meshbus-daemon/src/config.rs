//! Daemon configuration.
//!
//! Configuration can be loaded from:
//! - TOML configuration file (`meshbus.toml`, `/etc/meshbus/meshbus.toml`, `~/.config/meshbus/meshbus.toml`)
//! - Environment variables (`MESHBUS_*`, sections split by `__`, e.g. `MESHBUS_STATUS__PORT=9000`)

use anyhow::{Context, Result};
use meshbus_core::BusConfig;
use meshbus_protocol::Guid;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use uuid::Uuid;

const CONFIG_PATHS: [&str; 3] = [
    "meshbus.toml",
    "/etc/meshbus/meshbus.toml",
    "~/.config/meshbus/meshbus.toml",
];

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Broker tunables.
    #[serde(default)]
    pub bus: BusSection,

    /// HTTP status surface.
    #[serde(default)]
    pub status: StatusConfig,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Routing policy.
    #[serde(default)]
    pub policy: PolicyConfig,
}

/// Broker tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusSection {
    /// Fixed daemon GUID. A random one is used when unset.
    #[serde(default)]
    pub guid: Option<String>,

    /// Name of the in-process mesh address (`mem:<name>`) the daemon listens at.
    #[serde(default = "default_mesh_name")]
    pub mesh_name: String,

    /// How long a join waits for the session host to become reachable, in milliseconds.
    #[serde(default = "default_join_route_timeout")]
    pub join_route_timeout_ms: u64,

    /// How long a raw session waits for its stream, in milliseconds.
    #[serde(default = "default_session_fd_timeout")]
    pub session_fd_timeout_ms: u64,

    #[serde(default = "default_route_poll_interval")]
    pub route_poll_interval_ms: u64,

    #[serde(default = "default_fd_poll_interval")]
    pub fd_poll_interval_ms: u64,

    /// First port handed out for `SESSION_PORT_ANY`.
    #[serde(default = "default_first_dynamic_port")]
    pub first_dynamic_port: u16,
}

/// HTTP status surface configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusConfig {
    /// Serve `/health` and `/stats`.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_status_port")]
    pub port: u16,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often bus gauges are refreshed, in milliseconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

/// Routing policy configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Let match rules observe directed traffic.
    #[serde(default)]
    pub eavesdrop: bool,
}

fn default_mesh_name() -> String {
    "meshbusd".to_string()
}

fn default_join_route_timeout() -> u64 {
    10_000
}

fn default_session_fd_timeout() -> u64 {
    5_000
}

fn default_route_poll_interval() -> u64 {
    10
}

fn default_fd_poll_interval() -> u64 {
    5
}

fn default_first_dynamic_port() -> u16 {
    10_000
}

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_status_port() -> u16 {
    8080
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_refresh_interval() -> u64 {
    1_000
}

impl Default for BusSection {
    fn default() -> Self {
        Self {
            guid: None,
            mesh_name: default_mesh_name(),
            join_route_timeout_ms: default_join_route_timeout(),
            session_fd_timeout_ms: default_session_fd_timeout(),
            route_poll_interval_ms: default_route_poll_interval(),
            fd_poll_interval_ms: default_fd_poll_interval(),
            first_dynamic_port: default_first_dynamic_port(),
        }
    }
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            host: default_host(),
            port: default_status_port(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

impl Config {
    /// Load configuration from the first config file found, overridden by `MESHBUS_*` variables.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or an
    /// override has the wrong type.
    pub fn load() -> Result<Self> {
        let file = CONFIG_PATHS
            .iter()
            .map(|path| shellexpand::tilde(path).into_owned())
            .find(|path| Path::new(path).exists());

        let mut builder = ::config::Config::builder();
        if let Some(path) = &file {
            tracing::debug!(path = %path, "Loading config file");
            builder = builder.add_source(::config::File::new(path, ::config::FileFormat::Toml));
        }
        builder
            .add_source(
                ::config::Environment::with_prefix("MESHBUS")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Invalid configuration")
    }

    /// Load configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Socket address of the status surface.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn status_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.status.host, self.status.port)
            .parse()
            .with_context(|| format!("Invalid status address {}:{}", self.status.host, self.status.port))
    }

    /// Broker tunables as the core expects them.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured GUID is not a UUID.
    pub fn bus_config(&self) -> Result<BusConfig> {
        let guid = match &self.bus.guid {
            Some(guid) => Some(Guid::from_uuid(
                Uuid::parse_str(guid).with_context(|| format!("Invalid daemon GUID: {guid}"))?,
            )),
            None => None,
        };
        Ok(BusConfig {
            guid,
            join_route_timeout: Duration::from_millis(self.bus.join_route_timeout_ms),
            route_poll_interval: Duration::from_millis(self.bus.route_poll_interval_ms),
            session_fd_timeout: Duration::from_millis(self.bus.session_fd_timeout_ms),
            fd_poll_interval: Duration::from_millis(self.bus.fd_poll_interval_ms),
            first_dynamic_port: self.bus.first_dynamic_port,
        })
    }
}
