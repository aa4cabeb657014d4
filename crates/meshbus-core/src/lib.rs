//! # meshbus-core
//!
//! The broker half of a meshbus daemon: who is on the bus, which sessions
//! exist, which names are advertised, and where each message goes.
//!
//! - **Names** - unique names of local clients, well-known aliases, and the
//!   virtual endpoints standing in for clients of other daemons
//! - **Sessions** - binding ports, joining across daemons, multipoint
//!   fan-out and raw stream hand-off
//! - **Discovery** - advertising names and reporting names found on the mesh
//! - **Router** - delivery of unicast, session multicast and broadcast traffic
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Clients   │────▶│     Bus     │◀───▶│  Transports │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!                            │                   │
//!                            ▼                   ▼
//!                     ┌─────────────┐     ┌─────────────┐
//!                     │   Router    │────▶│  Bus links  │
//!                     └─────────────┘     └─────────────┘
//! ```

pub mod bus;
pub mod config;
mod discovery;
pub mod endpoint;
pub mod error;
mod exchange;
mod join;
mod name_map;
pub mod policy;
mod registry;
mod router;
pub mod rules;
mod session;
mod session_map;

pub use bus::{Bus, BusBuilder, BusStats, SessionSnapshot};
pub use config::BusConfig;
pub use endpoint::EndpointKind;
pub use error::BusError;
pub use name_map::TTL_INFINITE;
pub use policy::{AllowAll, EavesdropPolicy, Policy, ServiceLauncher};
pub use rules::MatchRule;
