//! Delivery policy and service launching seams.

use crate::error::BusError;
use async_trait::async_trait;
use meshbus_protocol::Message;

/// Decides whether a message may travel from a sender to a receiver.
///
/// Every method has a permissive default so implementations only override
/// the checks they care about.
pub trait Policy: Send + Sync {
    /// Whether `sender` may send `msg`.
    fn ok_to_send(&self, _msg: &Message, _sender: &str) -> bool {
        true
    }

    /// Whether `receiver` may receive `msg`.
    fn ok_to_receive(&self, _msg: &Message, _receiver: &str) -> bool {
        true
    }

    /// Whether eavesdropping is enabled at all.
    fn eavesdrop_enabled(&self) -> bool {
        false
    }

    /// Whether `receiver` may observe `msg` sent by `sender` to someone else.
    fn ok_to_eavesdrop(&self, _msg: &Message, _sender: &str, _receiver: &str) -> bool {
        false
    }
}

/// Allows everything, never eavesdrops.
#[derive(Debug, Clone, Copy, Default)]
pub struct AllowAll;

impl Policy for AllowAll {}

/// Allows everything and lets match rules observe directed traffic when enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct EavesdropPolicy {
    enabled: bool,
}

impl EavesdropPolicy {
    /// Create the policy.
    #[must_use]
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl Policy for EavesdropPolicy {
    fn eavesdrop_enabled(&self) -> bool {
        self.enabled
    }

    fn ok_to_eavesdrop(&self, _msg: &Message, _sender: &str, _receiver: &str) -> bool {
        self.enabled
    }
}

/// Starts the owner of a well-known name on demand.
#[async_trait]
pub trait ServiceLauncher: Send + Sync {
    /// Start the service that will own `name`, returning once it is registered.
    ///
    /// # Errors
    ///
    /// Returns an error if no service provides `name` or it failed to start.
    async fn start_service(&self, name: &str) -> Result<(), BusError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let msg = Message::signal(":a.2", "", "org.test", "Ping");
        assert!(AllowAll.ok_to_send(&msg, ":a.2"));
        assert!(AllowAll.ok_to_receive(&msg, ":b.2"));
        assert!(!AllowAll.eavesdrop_enabled());

        let eavesdrop = EavesdropPolicy::new(true);
        assert!(eavesdrop.eavesdrop_enabled());
        assert!(eavesdrop.ok_to_eavesdrop(&msg, ":a.2", ":b.2"));
        assert!(!EavesdropPolicy::default().ok_to_eavesdrop(&msg, ":a.2", ":b.2"));
    }
}
