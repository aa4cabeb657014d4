//! Ordered set of transports.
//!
//! Transports are consulted in the order they were added: the first one that
//! handles an address is the one used to connect to it.

use crate::traits::{DaemonHandler, Transport, TransportError};
use meshbus_protocol::{SessionOpts, TransportMask};
use std::sync::Arc;
use tracing::{info, warn};

/// The transports of one daemon, in priority order.
#[derive(Clone, Default)]
pub struct TransportList {
    transports: Vec<Arc<dyn Transport>>,
}

impl TransportList {
    /// Create a list from transports in priority order (first = highest).
    #[must_use]
    pub fn new(transports: Vec<Arc<dyn Transport>>) -> Self {
        Self { transports }
    }

    /// Add a transport at the lowest priority.
    pub fn add_transport(&mut self, transport: Arc<dyn Transport>) {
        self.transports.push(transport);
    }

    /// Transport names in priority order.
    #[must_use]
    pub fn transport_names(&self) -> Vec<&'static str> {
        self.transports.iter().map(|t| t.name()).collect()
    }

    /// Number of transports.
    #[must_use]
    pub fn len(&self) -> usize {
        self.transports.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transports.is_empty()
    }

    /// First healthy transport able to handle `bus_addr`.
    #[must_use]
    pub fn for_address(&self, bus_addr: &str) -> Option<Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.is_healthy() && t.handles(bus_addr))
            .cloned()
    }

    /// Transports whose bit is set in `mask`.
    pub fn matching(&self, mask: TransportMask) -> impl Iterator<Item = &Arc<dyn Transport>> {
        self.transports.iter().filter(move |t| t.mask() & mask != 0)
    }

    /// Listen addresses of every transport matching the requested options.
    #[must_use]
    pub fn listen_addresses(&self, opts: &SessionOpts) -> Vec<String> {
        self.matching(opts.transports)
            .flat_map(|t| t.listen_addresses(opts))
            .collect()
    }

    /// Start every transport.
    ///
    /// # Errors
    ///
    /// Returns the first start failure.
    pub fn start_all(&self, handler: &Arc<dyn DaemonHandler>) -> Result<(), TransportError> {
        for transport in &self.transports {
            transport.start(Arc::clone(handler))?;
            info!(transport = transport.name(), "Transport started");
        }
        Ok(())
    }

    /// Stop every transport.
    pub fn stop_all(&self) {
        for transport in &self.transports {
            if !transport.is_healthy() {
                warn!(transport = transport.name(), "Stopping unhealthy transport");
            }
            transport.stop();
        }
    }
}

impl std::fmt::Debug for TransportList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.transport_names()).finish()
    }
}
