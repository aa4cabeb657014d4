//! # meshbus-protocol
//!
//! Value types shared by every meshbus crate.
//!
//! - [`Message`] - routed bus message with a typed [`Body`]
//! - [`SessionOpts`] / [`ReplyCode`] - session negotiation and bus-method outcomes
//! - [`DaemonCall`] / [`DaemonReply`] - calls exchanged between daemons
//! - [`Guid`] and name validation
//! - [`codec`] - length-prefixed MessagePack framing
//!
//! ## Example
//!
//! ```rust
//! use meshbus_protocol::{codec, Message};
//!
//! let msg = Message::detach_session(":1a2b3c4d.1", 42, ":1a2b3c4d.7");
//! let encoded = codec::encode(&msg).unwrap();
//! assert_eq!(codec::decode(&encoded).unwrap(), msg);
//! ```

pub mod calls;
pub mod codec;
pub mod message;
pub mod names;
pub mod session;

pub use calls::{
    AttachSessionReply, AttachSessionRequest, DaemonCall, DaemonReply, GetSessionInfoReply,
    GetSessionInfoRequest,
};
pub use codec::{decode, encode, ProtocolError};
pub use message::{
    error_names, members, Body, Message, MessageKind, NameEntry, BUS_INTERFACE, DAEMON_INTERFACE,
};
pub use names::Guid;
pub use session::{
    proximity, transport, ReplyCode, SessionId, SessionOpts, SessionPort, TrafficType,
    TransportMask, SESSION_PORT_ANY,
};
