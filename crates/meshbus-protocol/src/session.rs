//! Session option types and bus-method reply codes.

use serde::{Deserialize, Serialize};

/// Identifier of a live session. Zero never names a live session.
pub type SessionId = u32;

/// Port a session host binds to accept joiners.
pub type SessionPort = u16;

/// Wildcard port: ask the broker to pick a free one.
pub const SESSION_PORT_ANY: SessionPort = 0;

/// Bit set of transports.
pub type TransportMask = u16;

/// Transport bits.
pub mod transport {
    use super::TransportMask;

    pub const NONE: TransportMask = 0x0000;
    pub const LOCAL: TransportMask = 0x0001;
    pub const BLUETOOTH: TransportMask = 0x0002;
    pub const WLAN: TransportMask = 0x0004;
    pub const WWAN: TransportMask = 0x0008;
    pub const LAN: TransportMask = 0x0010;
    pub const ANY: TransportMask = 0xFFFF;
}

/// Proximity bits.
pub mod proximity {
    pub const PHYSICAL: u8 = 0x01;
    pub const NETWORK: u8 = 0x02;
    pub const ANY: u8 = 0xFF;
}

/// Kind of traffic a session carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum TrafficType {
    /// Framed bus messages.
    Messages = 0x01,
    /// Unreliable raw byte stream.
    RawUnreliable = 0x02,
    /// Reliable raw byte stream.
    RawReliable = 0x04,
}

impl From<TrafficType> for u8 {
    fn from(t: TrafficType) -> u8 {
        t as u8
    }
}

impl TryFrom<u8> for TrafficType {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(TrafficType::Messages),
            0x02 => Ok(TrafficType::RawUnreliable),
            0x04 => Ok(TrafficType::RawReliable),
            _ => Err("Invalid traffic type"),
        }
    }
}

/// Negotiated session options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionOpts {
    /// Traffic carried by the session.
    pub traffic: TrafficType,
    /// Whether more than two parties may join.
    pub is_multipoint: bool,
    /// Allowed proximity bits.
    pub proximity: u8,
    /// Allowed transports.
    pub transports: TransportMask,
}

impl SessionOpts {
    /// Create session options.
    #[must_use]
    pub fn new(
        traffic: TrafficType,
        is_multipoint: bool,
        proximity: u8,
        transports: TransportMask,
    ) -> Self {
        Self {
            traffic,
            is_multipoint,
            proximity,
            transports,
        }
    }

    /// Point-to-point message session over any transport.
    #[must_use]
    pub fn messages() -> Self {
        Self::new(TrafficType::Messages, false, proximity::ANY, transport::ANY)
    }

    /// Multipoint message session over any transport.
    #[must_use]
    pub fn multipoint() -> Self {
        Self::new(TrafficType::Messages, true, proximity::ANY, transport::ANY)
    }

    /// Point-to-point reliable raw session over any transport.
    #[must_use]
    pub fn raw_reliable() -> Self {
        Self::new(TrafficType::RawReliable, false, proximity::ANY, transport::ANY)
    }

    /// Restrict the allowed transports.
    #[must_use]
    pub fn with_transports(mut self, transports: TransportMask) -> Self {
        self.transports = transports;
        self
    }

    /// Whether a host may bind a port with these options.
    ///
    /// Unreliable raw traffic is not supported and raw streams cannot be
    /// shared between more than two parties.
    #[must_use]
    pub fn is_bindable(&self) -> bool {
        match self.traffic {
            TrafficType::Messages => true,
            TrafficType::RawReliable => !self.is_multipoint,
            TrafficType::RawUnreliable => false,
        }
    }

    /// Whether a joiner asking for `other` may join a session offered with these options.
    #[must_use]
    pub fn is_compatible(&self, other: &SessionOpts) -> bool {
        self.traffic == other.traffic
            && (self.proximity & other.proximity) != 0
            && (self.transports & other.transports) != 0
    }
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self::messages()
    }
}

/// Reply code of a bus method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum ReplyCode {
    Success = 1,
    NoSession = 2,
    Unreachable = 3,
    ConnectFailed = 4,
    Rejected = 5,
    BadSessionOpts = 6,
    AlreadyJoined = 7,
    AlreadyExists = 8,
    Failed = 10,
    AlreadyAdvertising = 11,
    AlreadyDiscovering = 12,
}

impl ReplyCode {
    /// Whether the call succeeded.
    #[must_use]
    pub fn is_success(self) -> bool {
        self == ReplyCode::Success
    }
}

impl From<ReplyCode> for u32 {
    fn from(code: ReplyCode) -> u32 {
        code as u32
    }
}

impl TryFrom<u32> for ReplyCode {
    type Error = &'static str;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(ReplyCode::Success),
            2 => Ok(ReplyCode::NoSession),
            3 => Ok(ReplyCode::Unreachable),
            4 => Ok(ReplyCode::ConnectFailed),
            5 => Ok(ReplyCode::Rejected),
            6 => Ok(ReplyCode::BadSessionOpts),
            7 => Ok(ReplyCode::AlreadyJoined),
            8 => Ok(ReplyCode::AlreadyExists),
            10 => Ok(ReplyCode::Failed),
            11 => Ok(ReplyCode::AlreadyAdvertising),
            12 => Ok(ReplyCode::AlreadyDiscovering),
            _ => Err("Invalid reply code"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bindable_options() {
        assert!(SessionOpts::messages().is_bindable());
        assert!(SessionOpts::multipoint().is_bindable());
        assert!(SessionOpts::raw_reliable().is_bindable());

        let mut raw_mp = SessionOpts::raw_reliable();
        raw_mp.is_multipoint = true;
        assert!(!raw_mp.is_bindable());

        let unreliable = SessionOpts::new(TrafficType::RawUnreliable, false, proximity::ANY, transport::ANY);
        assert!(!unreliable.is_bindable());
    }

    #[test]
    fn test_compatibility() {
        let offered = SessionOpts::messages().with_transports(transport::LAN | transport::WLAN);
        assert!(offered.is_compatible(&SessionOpts::messages()));
        assert!(offered.is_compatible(&SessionOpts::messages().with_transports(transport::WLAN)));
        assert!(!offered.is_compatible(&SessionOpts::messages().with_transports(transport::BLUETOOTH)));
        assert!(!offered.is_compatible(&SessionOpts::raw_reliable()));

        let mut physical = SessionOpts::messages();
        physical.proximity = proximity::PHYSICAL;
        let mut network = SessionOpts::messages();
        network.proximity = proximity::NETWORK;
        assert!(!physical.is_compatible(&network));
    }

    #[test]
    fn test_traffic_conversion() {
        assert_eq!(TrafficType::try_from(0x04), Ok(TrafficType::RawReliable));
        assert!(TrafficType::try_from(0x03).is_err());
    }

    #[test]
    fn test_reply_code_conversion() {
        assert_eq!(ReplyCode::try_from(7), Ok(ReplyCode::AlreadyJoined));
        assert_eq!(u32::from(ReplyCode::Failed), 10);
        assert!(ReplyCode::try_from(9).is_err());
        assert!(ReplyCode::Success.is_success());
    }
}
