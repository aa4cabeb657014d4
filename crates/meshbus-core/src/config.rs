//! Tunables of the broker.

use meshbus_protocol::{Guid, SessionPort};
use std::time::Duration;

/// Bus configuration.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Daemon GUID. A random one is generated when unset.
    pub guid: Option<Guid>,
    /// How long a join waits for the host to become reachable over the new link.
    pub join_route_timeout: Duration,
    /// Pause between two reachability checks of a join.
    pub route_poll_interval: Duration,
    /// How long a raw session waits for its stream.
    pub session_fd_timeout: Duration,
    /// Pause between two stream checks.
    pub fd_poll_interval: Duration,
    /// First port tried when binding `SESSION_PORT_ANY`.
    pub first_dynamic_port: SessionPort,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            guid: None,
            join_route_timeout: Duration::from_secs(10),
            route_poll_interval: Duration::from_millis(10),
            session_fd_timeout: Duration::from_secs(5),
            fd_poll_interval: Duration::from_millis(5),
            first_dynamic_port: 10_000,
        }
    }
}
