//! Endpoint kinds known to the name table.
//!
//! Every name the daemon can deliver to maps to exactly one [`Endpoint`]:
//! the daemon's own controller, a directly attached client, a link to
//! another daemon, or a virtual endpoint standing in for a name that lives
//! behind one or more of those links.

use meshbus_protocol::SessionId;
use meshbus_transport::{BusLink, ClientConnection};
use std::sync::Arc;

/// Kind of an endpoint, without its payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointKind {
    /// The daemon's own controller endpoint.
    Local,
    /// A client attached to this daemon.
    Client,
    /// A link to another daemon.
    BusToBus,
    /// A name attached to another daemon.
    Virtual,
}

/// A registered endpoint.
pub(crate) enum Endpoint {
    Local,
    Client(Arc<dyn ClientConnection>),
    BusToBus(LinkEntry),
    Virtual(VirtualEndpoint),
}

impl Endpoint {
    pub(crate) fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Local => EndpointKind::Local,
            Endpoint::Client(_) => EndpointKind::Client,
            Endpoint::BusToBus(_) => EndpointKind::BusToBus,
            Endpoint::Virtual(_) => EndpointKind::Virtual,
        }
    }

    /// Whether messages from other daemons may be delivered here.
    pub(crate) fn allows_remote_messages(&self) -> bool {
        match self {
            Endpoint::Client(client) => client.allows_remote_messages(),
            _ => true,
        }
    }
}

/// A bus-to-bus link with its session reference count.
pub(crate) struct LinkEntry {
    pub(crate) link: Arc<dyn BusLink>,
    pub(crate) refs: usize,
}

impl LinkEntry {
    pub(crate) fn new(link: Arc<dyn BusLink>) -> Self {
        Self { link, refs: 0 }
    }
}

/// Stand-in for a unique name attached to another daemon.
///
/// Tracks the links the name is reachable through, in the order they were
/// learned, and which link each session routed to the name uses. Every
/// session entry holds one reference on its link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct VirtualEndpoint {
    links: Vec<String>,
    session_links: Vec<(SessionId, String)>,
}

impl VirtualEndpoint {
    pub(crate) fn new(link: impl Into<String>) -> Self {
        Self {
            links: vec![link.into()],
            session_links: Vec::new(),
        }
    }

    /// Add a link to the reachable set. Returns `true` if it was not there yet.
    pub(crate) fn add_link(&mut self, link: &str) -> bool {
        if self.can_use_route(link) {
            return false;
        }
        self.links.push(link.to_string());
        true
    }

    /// Remove a link from the reachable set along with the session routes using it.
    ///
    /// Returns the ids of the sessions that lost their route (one per
    /// reference held on the link) and whether the name is now unreachable.
    pub(crate) fn remove_link(&mut self, link: &str) -> (Vec<SessionId>, bool) {
        self.links.retain(|l| l != link);
        let mut dropped = Vec::new();
        self.session_links.retain(|(id, l)| {
            if l == link {
                dropped.push(*id);
                false
            } else {
                true
            }
        });
        (dropped, self.links.is_empty())
    }

    /// Whether the name is reachable through `link`.
    pub(crate) fn can_use_route(&self, link: &str) -> bool {
        self.links.iter().any(|l| l == link)
    }

    /// Link carrying `session_id`, or the first reachable link.
    pub(crate) fn link_for_session(&self, session_id: SessionId) -> Option<&str> {
        self.session_links
            .iter()
            .find(|(id, _)| *id == session_id && session_id != 0)
            .map(|(_, link)| link.as_str())
            .or_else(|| self.links.first().map(String::as_str))
    }

    /// Links to try for a message of `session_id`, preferred first.
    pub(crate) fn candidate_links(&self, session_id: SessionId) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        if session_id != 0 {
            out.extend(
                self.session_links
                    .iter()
                    .filter(|(id, _)| *id == session_id)
                    .map(|(_, link)| link.as_str()),
            );
        }
        for link in &self.links {
            if !out.contains(&link.as_str()) {
                out.push(link);
            }
        }
        out
    }

    /// Route `session_id` over `link`. Fails if the name is not reachable through it.
    pub(crate) fn add_session_ref(&mut self, session_id: SessionId, link: &str) -> bool {
        if !self.can_use_route(link) {
            return false;
        }
        self.session_links.push((session_id, link.to_string()));
        true
    }

    /// Route `session_id` over the first reachable link.
    pub(crate) fn add_session_ref_any(&mut self, session_id: SessionId) -> Option<String> {
        let link = self.links.first()?.clone();
        self.session_links.push((session_id, link.clone()));
        Some(link)
    }

    /// Drop one route of `session_id`, returning the link it used.
    pub(crate) fn remove_session_ref(&mut self, session_id: SessionId) -> Option<String> {
        let pos = self.session_links.iter().position(|(id, _)| *id == session_id)?;
        Some(self.session_links.remove(pos).1)
    }

    /// Sessions routed over `link`.
    pub(crate) fn session_ids_for(&self, link: &str) -> Vec<SessionId> {
        let mut ids: Vec<_> = self
            .session_links
            .iter()
            .filter(|(_, l)| l == link)
            .map(|(id, _)| *id)
            .collect();
        ids.dedup();
        ids
    }

    /// Every link still referenced by a session route.
    pub(crate) fn session_refs(&self) -> impl Iterator<Item = &str> {
        self.session_links.iter().map(|(_, link)| link.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reachable_set() {
        let mut vep = VirtualEndpoint::new(":aaaaaaaa.5");
        assert!(vep.can_use_route(":aaaaaaaa.5"));
        assert!(!vep.add_link(":aaaaaaaa.5"));
        assert!(vep.add_link(":cccccccc.3"));
        assert_eq!(vep.candidate_links(0), vec![":aaaaaaaa.5", ":cccccccc.3"]);

        let (dropped, empty) = vep.remove_link(":aaaaaaaa.5");
        assert!(dropped.is_empty());
        assert!(!empty);
        let (_, empty) = vep.remove_link(":cccccccc.3");
        assert!(empty);
    }

    #[test]
    fn test_session_routes_prefer_their_link() {
        let mut vep = VirtualEndpoint::new(":aaaaaaaa.5");
        vep.add_link(":cccccccc.3");

        assert!(vep.add_session_ref(7, ":cccccccc.3"));
        assert!(!vep.add_session_ref(8, ":dddddddd.9"));
        assert_eq!(vep.link_for_session(7), Some(":cccccccc.3"));
        assert_eq!(vep.link_for_session(9), Some(":aaaaaaaa.5"));
        assert_eq!(vep.candidate_links(7), vec![":cccccccc.3", ":aaaaaaaa.5"]);
        assert_eq!(vep.session_ids_for(":cccccccc.3"), vec![7]);

        assert_eq!(vep.remove_session_ref(7), Some(":cccccccc.3".to_string()));
        assert_eq!(vep.remove_session_ref(7), None);
    }

    #[test]
    fn test_removing_link_drops_its_session_refs() {
        let mut vep = VirtualEndpoint::new(":aaaaaaaa.5");
        assert_eq!(vep.add_session_ref_any(3), Some(":aaaaaaaa.5".to_string()));
        vep.add_session_ref(4, ":aaaaaaaa.5");

        let (dropped, empty) = vep.remove_link(":aaaaaaaa.5");
        assert_eq!(dropped, vec![3, 4]);
        assert!(empty);
        assert_eq!(vep.session_refs().count(), 0);
        assert_eq!(vep.link_for_session(3), None);
    }
}
