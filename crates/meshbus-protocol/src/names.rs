//! Bus name rules and daemon identity.
//!
//! Every daemon carries a [`Guid`]. The first eight hex digits of that GUID
//! (its *short* form) prefix every unique name the daemon hands out, so a
//! unique name always reveals which daemon owns it: `:1a2b3c4d.7` belongs
//! to the daemon whose GUID starts with `1a2b3c4d`, and `.1` is reserved for
//! the daemon's own controller endpoint.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length of any bus name.
pub const MAX_NAME_LEN: usize = 255;

/// Length of the short GUID form used in unique names.
pub const SHORT_GUID_LEN: usize = 8;

/// Globally unique daemon identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Guid(Uuid);

impl Guid {
    /// Generate a fresh random GUID.
    #[must_use]
    pub fn new_random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// The short form embedded in unique names.
    #[must_use]
    pub fn short_string(&self) -> String {
        let mut s = self.0.simple().to_string();
        s.truncate(SHORT_GUID_LEN);
        s
    }

    /// Unique name of the controller endpoint of the daemon with this GUID.
    #[must_use]
    pub fn controller_name(&self) -> String {
        format!(":{}.1", self.short_string())
    }

    /// Whether `name` is a unique name handed out by the daemon with this GUID.
    #[must_use]
    pub fn owns(&self, name: &str) -> bool {
        name.strip_prefix(':')
            .is_some_and(|rest| rest.starts_with(&self.short_string()))
    }
}

impl fmt::Display for Guid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.simple())
    }
}

impl FromStr for Guid {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Whether `name` names a bus controller endpoint (`:<guid>.1`).
#[must_use]
pub fn is_controller_name(name: &str) -> bool {
    name.starts_with(':') && name.ends_with(".1") && name.find('.') == Some(name.len() - 2)
}

fn is_element_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '-'
}

/// Check a unique name: `:` followed by two or more dot separated,
/// non-empty elements made of `[A-Za-z0-9_-]`.
#[must_use]
pub fn is_legal_unique_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN {
        return false;
    }
    let Some(rest) = name.strip_prefix(':') else {
        return false;
    };
    let mut elements = 0;
    for element in rest.split('.') {
        if element.is_empty() || !element.chars().all(is_element_char) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}

/// Check a well-known name: two or more dot separated elements made of
/// `[A-Za-z0-9_-]`, none of them starting with a digit.
#[must_use]
pub fn is_legal_bus_name(name: &str) -> bool {
    if name.len() > MAX_NAME_LEN || name.starts_with(':') {
        return false;
    }
    let mut elements = 0;
    for element in name.split('.') {
        let Some(first) = element.chars().next() else {
            return false;
        };
        if first.is_ascii_digit() || !element.chars().all(is_element_char) {
            return false;
        }
        elements += 1;
    }
    elements >= 2
}
