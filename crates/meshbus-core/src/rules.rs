//! Broadcast match rules.

use meshbus_protocol::{Message, MessageKind};

/// Selects messages by kind, sender, interface and member.
///
/// Unset fields match anything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MatchRule {
    pub kind: Option<MessageKind>,
    pub sender: Option<String>,
    pub interface: Option<String>,
    pub member: Option<String>,
}

impl MatchRule {
    /// Rule matching every message.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rule matching every signal.
    #[must_use]
    pub fn signals() -> Self {
        Self {
            kind: Some(MessageKind::Signal),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = Some(sender.into());
        self
    }

    #[must_use]
    pub fn with_interface(mut self, interface: impl Into<String>) -> Self {
        self.interface = Some(interface.into());
        self
    }

    #[must_use]
    pub fn with_member(mut self, member: impl Into<String>) -> Self {
        self.member = Some(member.into());
        self
    }

    /// Whether `msg` is selected by this rule.
    #[must_use]
    pub fn matches(&self, msg: &Message) -> bool {
        self.kind.map_or(true, |k| k == msg.kind)
            && self.sender.as_deref().map_or(true, |s| s == msg.sender)
            && matches_opt(self.interface.as_deref(), msg.interface.as_deref())
            && matches_opt(self.member.as_deref(), msg.member.as_deref())
    }
}

fn matches_opt(want: Option<&str>, have: Option<&str>) -> bool {
    match want {
        None => true,
        Some(want) => have == Some(want),
    }
}
