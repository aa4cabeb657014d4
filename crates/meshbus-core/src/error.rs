//! Errors of the broker internals.
//!
//! Bus methods answer with a [`ReplyCode`](meshbus_protocol::ReplyCode);
//! `BusError` is what the helpers underneath them return.

use meshbus_protocol::SessionId;
use meshbus_transport::TransportError;
use thiserror::Error;

/// Broker errors.
#[derive(Debug, Error)]
pub enum BusError {
    /// No endpoint is registered under the name.
    #[error("No endpoint named {0}")]
    NoEndpoint(String),

    /// The endpoint exists but no link currently reaches it.
    #[error("No route to {0}")]
    NoRoute(String),

    /// The session id is zero or unknown.
    #[error("No session {0}")]
    NoSession(SessionId),

    /// The policy refused the delivery.
    #[error("Policy violation: {0}")]
    PolicyViolation(String),

    /// The name is already registered.
    #[error("Name already in use: {0}")]
    NameInUse(String),

    /// The name is not a legal bus name, or not one this daemon may register.
    #[error("Invalid name: {0}")]
    InvalidName(String),

    /// The bus is shutting down.
    #[error("Bus is shutting down")]
    ShuttingDown,

    /// Starting a service for an auto-start message failed.
    #[error("Service start failed: {0}")]
    ServiceStart(String),

    /// Transport error.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

impl BusError {
    /// Whether the error only means the target endpoint is going away.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(self, BusError::Transport(e) if e.is_closing())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closing_is_recognised() {
        assert!(BusError::from(TransportError::Closing).is_closing());
        assert!(!BusError::NoRoute(":a.2".into()).is_closing());
        assert!(!BusError::from(TransportError::SendFailed("x".into())).is_closing());
    }
}
