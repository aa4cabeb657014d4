//! Daemon-to-daemon method calls.
//!
//! These calls travel only over bus-to-bus links and are answered by the
//! daemon at the other end of the link.

use crate::session::{ReplyCode, SessionId, SessionOpts, SessionPort};
use serde::{Deserialize, Serialize};

/// Request to attach `src` to the session `session_host` offers on `session_port`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachSessionRequest {
    /// Port the session host bound.
    pub session_port: SessionPort,
    /// Unique name of the joiner.
    pub src: String,
    /// Name of the session creator.
    pub session_host: String,
    /// Party the attach is aimed at: the creator, or an existing multipoint member.
    pub dest: String,
    /// Link the request travels over, as named on both of its ends.
    pub src_b2b: String,
    /// Controller name of the daemon the request is sent to.
    pub remote_controller: String,
    /// Existing session id for secondary multipoint attaches, zero otherwise.
    pub session_id: SessionId,
    /// Address used to reach the creator's daemon. Empty when forwarding over an existing session link.
    pub bus_addr: String,
    /// Options requested by the joiner.
    pub opts: SessionOpts,
}

/// Answer to [`AttachSessionRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachSessionReply {
    /// Outcome.
    pub code: ReplyCode,
    /// Session id, zero on failure.
    pub session_id: SessionId,
    /// Negotiated options.
    pub opts: SessionOpts,
    /// Session members as known by the answering party.
    pub members: Vec<String>,
}

impl AttachSessionReply {
    /// Failed attach with no session.
    #[must_use]
    pub fn failed(code: ReplyCode, opts: SessionOpts) -> Self {
        Self {
            code,
            session_id: 0,
            opts,
            members: Vec::new(),
        }
    }
}

/// Request for the addresses a session creator can be reached at.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSessionInfoRequest {
    /// Name of the session creator.
    pub creator: String,
    /// Port the creator bound.
    pub session_port: SessionPort,
    /// Options requested by the joiner.
    pub opts: SessionOpts,
}

/// Answer to [`GetSessionInfoRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetSessionInfoReply {
    /// `Success` when at least one address is known, `NoSession` otherwise.
    pub code: ReplyCode,
    /// Listen addresses, best first.
    pub bus_addrs: Vec<String>,
}

/// A call sent to the daemon at the other end of a link.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "call", rename_all = "snake_case")]
pub enum DaemonCall {
    AttachSession(AttachSessionRequest),
    GetSessionInfo(GetSessionInfoRequest),
}

/// Answer to a [`DaemonCall`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "snake_case")]
pub enum DaemonReply {
    AttachSession(AttachSessionReply),
    GetSessionInfo(GetSessionInfoReply),
}
