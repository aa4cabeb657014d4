//! # meshbus-transport
//!
//! The seams between the meshbus broker and the things it routes to.
//!
//! - [`ClientConnection`] - an application attached to this daemon
//! - [`BusLink`] - a link to another daemon
//! - [`Transport`] - creates links and announces names
//! - [`DaemonHandler`] - how transports report back to the broker
//!
//! Two implementations ship with the crate: [`MemoryTransport`], an
//! in-process mesh where several daemons share one [`MemoryHub`], and
//! [`ChannelClient`], a client whose messages land on an mpsc receiver.
//!
//! ```rust,ignore
//! use meshbus_transport::{MemoryHub, MemoryTransport, TransportList};
//!
//! let hub = MemoryHub::new();
//! let transports = TransportList::new(vec![Arc::new(MemoryTransport::new(&hub, "alpha"))]);
//! ```

pub mod channel;
pub mod list;
pub mod memory;
pub mod traits;

pub use channel::ChannelClient;
pub use list::TransportList;
pub use memory::{MemoryHub, MemoryLink, MemoryTransport};
pub use traits::{
    BusLink, ClientConnection, DaemonHandler, RawStream, Sink, Transport, TransportError,
};
