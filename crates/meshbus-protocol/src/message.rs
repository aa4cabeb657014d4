//! Routed bus messages.
//!
//! A [`Message`] carries the routing header the broker acts on (kind, flags,
//! sender, destination, session id) plus a typed [`Body`]. Application
//! payloads travel as opaque bytes; the broker's own signals use dedicated
//! body variants.

use crate::session::{SessionId, TransportMask};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, Ordering};

/// Interface of the daemon-to-daemon signals.
pub const DAEMON_INTERFACE: &str = "org.meshbus.Daemon";

/// Interface of the signals the broker emits to its clients.
pub const BUS_INTERFACE: &str = "org.meshbus.Bus";

/// Member names of broker signals.
pub mod members {
    pub const EXCHANGE_NAMES: &str = "ExchangeNames";
    pub const NAME_CHANGED: &str = "NameChanged";
    pub const DETACH_SESSION: &str = "DetachSession";
    pub const FOUND_ADVERTISED_NAME: &str = "FoundAdvertisedName";
    pub const LOST_ADVERTISED_NAME: &str = "LostAdvertisedName";
    pub const SESSION_LOST: &str = "SessionLost";
}

/// Error names used in synthesized error replies.
pub mod error_names {
    pub const BLOCKED: &str = "org.meshbus.Error.Blocked";
    pub const SERVICE_UNKNOWN: &str = "org.meshbus.Error.ServiceUnknown";
    pub const ACCESS_DENIED: &str = "org.meshbus.Error.AccessDenied";
}

static SERIAL_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Allocate a message serial number. Never returns zero.
#[must_use]
pub fn next_serial() -> u32 {
    loop {
        let serial = SERIAL_COUNTER.fetch_add(1, Ordering::Relaxed);
        if serial != 0 {
            return serial;
        }
    }
}

/// Message kind identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum MessageKind {
    MethodCall = 0x01,
    MethodReturn = 0x02,
    Error = 0x03,
    Signal = 0x04,
}

impl From<MessageKind> for u8 {
    fn from(kind: MessageKind) -> u8 {
        kind as u8
    }
}

impl TryFrom<u8> for MessageKind {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, <Self as TryFrom<u8>>::Error> {
        match value {
            0x01 => Ok(MessageKind::MethodCall),
            0x02 => Ok(MessageKind::MethodReturn),
            0x03 => Ok(MessageKind::Error),
            0x04 => Ok(MessageKind::Signal),
            _ => Err("Invalid message kind"),
        }
    }
}

/// One unique name and the well-known names it owns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameEntry {
    /// Unique name.
    pub unique_name: String,
    /// Well-known names owned by `unique_name`.
    pub aliases: Vec<String>,
}

impl NameEntry {
    /// Create a name entry.
    #[must_use]
    pub fn new(unique_name: impl Into<String>, aliases: Vec<String>) -> Self {
        Self {
            unique_name: unique_name.into(),
            aliases,
        }
    }
}

/// Message body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    /// No arguments.
    Empty,

    /// Opaque application payload.
    Bytes {
        #[serde(with = "serde_bytes")]
        data: Vec<u8>,
    },

    /// Full name table of the sending daemon.
    ExchangeNames { names: Vec<NameEntry> },

    /// Ownership change of a single name. Empty strings mean "no owner".
    NameChanged {
        alias: String,
        old_owner: String,
        new_owner: String,
    },

    /// `src` left session `session_id`.
    DetachSession { session_id: SessionId, src: String },

    /// A name matching `prefix` was found.
    FoundAdvertisedName {
        name: String,
        transport: TransportMask,
        prefix: String,
    },

    /// A previously found name is gone.
    LostAdvertisedName { name: String, transport: TransportMask },

    /// The receiver's session ended.
    SessionLost { session_id: SessionId },

    /// Error description.
    Error { description: String },
}

/// A routed bus message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Serial number, unique per sender.
    pub serial: u32,
    /// Message kind.
    pub kind: MessageKind,
    /// Sender does not want a reply.
    #[serde(default)]
    pub no_reply_expected: bool,
    /// Start the destination if it is not running.
    #[serde(default)]
    pub auto_start: bool,
    /// Broadcast beyond this daemon.
    #[serde(default)]
    pub global_broadcast: bool,
    /// Unique name of the sender.
    pub sender: String,
    /// Destination name. Empty for broadcast and session multicast.
    #[serde(default)]
    pub destination: String,
    /// Session the message belongs to, zero for none.
    #[serde(default)]
    pub session_id: SessionId,
    /// Interface name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<String>,
    /// Member name.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub member: Option<String>,
    /// Error name for error replies.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_name: Option<String>,
    /// Serial of the call this replies to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_serial: Option<u32>,
    /// Arguments.
    pub body: Body,
}

impl Message {
    fn with_kind(kind: MessageKind, sender: impl Into<String>, destination: impl Into<String>) -> Self {
        Self {
            serial: next_serial(),
            kind,
            no_reply_expected: false,
            auto_start: false,
            global_broadcast: false,
            sender: sender.into(),
            destination: destination.into(),
            session_id: 0,
            interface: None,
            member: None,
            error_name: None,
            reply_serial: None,
            body: Body::Empty,
        }
    }

    /// Create a method call.
    #[must_use]
    pub fn method_call(
        sender: impl Into<String>,
        destination: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_kind(MessageKind::MethodCall, sender, destination);
        msg.interface = Some(interface.into());
        msg.member = Some(member.into());
        msg
    }

    /// Create a signal. An empty destination makes it a broadcast.
    #[must_use]
    pub fn signal(
        sender: impl Into<String>,
        destination: impl Into<String>,
        interface: impl Into<String>,
        member: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_kind(MessageKind::Signal, sender, destination);
        msg.interface = Some(interface.into());
        msg.member = Some(member.into());
        msg.no_reply_expected = true;
        msg
    }

    /// Create the reply to this call.
    #[must_use]
    pub fn method_return(&self, sender: impl Into<String>) -> Self {
        let mut msg = Self::with_kind(MessageKind::MethodReturn, sender, self.sender.clone());
        msg.reply_serial = Some(self.serial);
        msg.session_id = self.session_id;
        msg.no_reply_expected = true;
        msg
    }

    /// Create an error reply to this call.
    #[must_use]
    pub fn error_reply(
        &self,
        sender: impl Into<String>,
        error_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        let mut msg = Self::with_kind(MessageKind::Error, sender, self.sender.clone());
        msg.reply_serial = Some(self.serial);
        msg.session_id = self.session_id;
        msg.no_reply_expected = true;
        msg.error_name = Some(error_name.into());
        msg.body = Body::Error {
            description: description.into(),
        };
        msg
    }

    /// Set the body.
    #[must_use]
    pub fn with_body(mut self, body: Body) -> Self {
        self.body = body;
        self
    }

    /// Set an opaque payload.
    #[must_use]
    pub fn with_payload(self, data: impl Into<Vec<u8>>) -> Self {
        self.with_body(Body::Bytes { data: data.into() })
    }

    /// Tag the message with a session.
    #[must_use]
    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = session_id;
        self
    }

    /// Ask for the destination to be started if absent.
    #[must_use]
    pub fn with_auto_start(mut self) -> Self {
        self.auto_start = true;
        self
    }

    /// Mark the message for delivery to every connected daemon.
    #[must_use]
    pub fn with_global_broadcast(mut self) -> Self {
        self.global_broadcast = true;
        self
    }

    /// Mark a method call as not expecting a reply.
    #[must_use]
    pub fn without_reply(mut self) -> Self {
        self.no_reply_expected = true;
        self
    }

    /// Whether the sender waits for a reply.
    #[must_use]
    pub fn is_reply_expected(&self) -> bool {
        self.kind == MessageKind::MethodCall && !self.no_reply_expected
    }

    /// Whether the message is a broadcast or session multicast.
    #[must_use]
    pub fn is_untargeted(&self) -> bool {
        self.destination.is_empty()
    }

    /// Full name table of a daemon.
    #[must_use]
    pub fn exchange_names(sender: impl Into<String>, names: Vec<NameEntry>) -> Self {
        Self::signal(sender, "", DAEMON_INTERFACE, members::EXCHANGE_NAMES)
            .with_body(Body::ExchangeNames { names })
    }

    /// Ownership change of `alias`.
    #[must_use]
    pub fn name_changed(
        sender: impl Into<String>,
        alias: impl Into<String>,
        old_owner: impl Into<String>,
        new_owner: impl Into<String>,
    ) -> Self {
        Self::signal(sender, "", DAEMON_INTERFACE, members::NAME_CHANGED).with_body(Body::NameChanged {
            alias: alias.into(),
            old_owner: old_owner.into(),
            new_owner: new_owner.into(),
        })
    }

    /// `src` left `session_id`.
    #[must_use]
    pub fn detach_session(sender: impl Into<String>, session_id: SessionId, src: impl Into<String>) -> Self {
        Self::signal(sender, "", DAEMON_INTERFACE, members::DETACH_SESSION).with_body(
            Body::DetachSession {
                session_id,
                src: src.into(),
            },
        )
    }

    /// Tell `destination` that `name` matching `prefix` was found.
    #[must_use]
    pub fn found_advertised_name(
        sender: impl Into<String>,
        destination: impl Into<String>,
        name: impl Into<String>,
        transport: TransportMask,
        prefix: impl Into<String>,
    ) -> Self {
        Self::signal(sender, destination, BUS_INTERFACE, members::FOUND_ADVERTISED_NAME).with_body(
            Body::FoundAdvertisedName {
                name: name.into(),
                transport,
                prefix: prefix.into(),
            },
        )
    }

    /// Tell `destination` that `name` is gone.
    #[must_use]
    pub fn lost_advertised_name(
        sender: impl Into<String>,
        destination: impl Into<String>,
        name: impl Into<String>,
        transport: TransportMask,
    ) -> Self {
        Self::signal(sender, destination, BUS_INTERFACE, members::LOST_ADVERTISED_NAME).with_body(
            Body::LostAdvertisedName {
                name: name.into(),
                transport,
            },
        )
    }

    /// Tell `destination` that its session ended.
    #[must_use]
    pub fn session_lost(
        sender: impl Into<String>,
        destination: impl Into<String>,
        session_id: SessionId,
    ) -> Self {
        Self::signal(sender, destination, BUS_INTERFACE, members::SESSION_LOST)
            .with_body(Body::SessionLost { session_id })
    }
}
