//! Name and endpoint registry.
//!
//! The [`NameTable`] owns every endpoint the daemon can deliver to, keyed by
//! unique name, plus the well-known aliases pointing at them and the session
//! cast table used for session multicast. Other components refer to
//! endpoints by name only and resolve them again whenever they need one.

use crate::endpoint::{Endpoint, EndpointKind, LinkEntry, VirtualEndpoint};
use crate::error::BusError;
use meshbus_protocol::{Guid, Message, NameEntry, SessionId, SessionOpts};
use meshbus_transport::{BusLink, ClientConnection};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// One direction of a session route: messages of session `id` sent by
/// `src` go to `dest`, over link `b2b` when `dest` is remote.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct SessionCast {
    pub(crate) id: SessionId,
    pub(crate) src: String,
    pub(crate) b2b: Option<String>,
    pub(crate) dest: String,
}

/// Names, endpoints, aliases and session routes.
pub(crate) struct NameTable {
    endpoints: BTreeMap<String, Endpoint>,
    aliases: BTreeMap<String, String>,
    virtual_aliases: BTreeMap<String, String>,
    links: Vec<String>,
    casts: BTreeSet<SessionCast>,
}

impl NameTable {
    /// Create a table holding the daemon's controller endpoint.
    pub(crate) fn new(controller: &str) -> Self {
        let mut endpoints = BTreeMap::new();
        endpoints.insert(controller.to_string(), Endpoint::Local);
        Self {
            endpoints,
            aliases: BTreeMap::new(),
            virtual_aliases: BTreeMap::new(),
            links: Vec::new(),
            casts: BTreeSet::new(),
        }
    }

    pub(crate) fn endpoint(&self, name: &str) -> Option<&Endpoint> {
        self.endpoints.get(name)
    }

    pub(crate) fn kind(&self, name: &str) -> Option<EndpointKind> {
        self.endpoints.get(name).map(Endpoint::kind)
    }

    pub(crate) fn contains(&self, name: &str) -> bool {
        self.endpoints.contains_key(name)
    }

    /// Unique name `name` stands for: itself, or the owner of the alias.
    pub(crate) fn resolve(&self, name: &str) -> Option<&str> {
        if name.starts_with(':') {
            self.endpoints.get_key_value(name).map(|(k, _)| k.as_str())
        } else {
            self.aliases
                .get(name)
                .or_else(|| self.virtual_aliases.get(name))
                .map(String::as_str)
        }
    }

    /// Whether `name` resolves to an endpoint attached to this daemon.
    #[cfg(test)]
    pub(crate) fn is_local(&self, name: &str) -> bool {
        self.resolve(name)
            .and_then(|n| self.endpoints.get(n))
            .is_some_and(|ep| matches!(ep, Endpoint::Local | Endpoint::Client(_)))
    }

    pub(crate) fn client(&self, name: &str) -> Option<Arc<dyn ClientConnection>> {
        match self.endpoints.get(name) {
            Some(Endpoint::Client(client)) => Some(Arc::clone(client)),
            _ => None,
        }
    }

    pub(crate) fn allows_remote_messages(&self, name: &str) -> bool {
        self.endpoints
            .get(name)
            .map_or(true, Endpoint::allows_remote_messages)
    }

    pub(crate) fn insert_client(&mut self, client: Arc<dyn ClientConnection>) -> Result<(), BusError> {
        let name = client.unique_name().to_string();
        if self.endpoints.contains_key(&name) {
            return Err(BusError::NameInUse(name));
        }
        debug!(endpoint = %name, "Registering client");
        self.endpoints.insert(name, Endpoint::Client(client));
        Ok(())
    }

    /// Remove a client. Returns the aliases it owned, or `None` if `name` is not a client.
    pub(crate) fn remove_client(&mut self, name: &str) -> Option<Vec<String>> {
        if !matches!(self.endpoints.get(name), Some(Endpoint::Client(_))) {
            return None;
        }
        self.endpoints.remove(name);
        let owned = self.aliases_of(name);
        for alias in &owned {
            self.aliases.remove(alias);
        }
        debug!(endpoint = %name, aliases = owned.len(), "Client removed");
        Some(owned)
    }

    // Aliases

    pub(crate) fn alias_owner(&self, alias: &str) -> Option<&str> {
        self.aliases.get(alias).map(String::as_str)
    }

    pub(crate) fn set_alias(&mut self, alias: &str, owner: &str) {
        self.aliases.insert(alias.to_string(), owner.to_string());
    }

    pub(crate) fn remove_alias(&mut self, alias: &str) -> Option<String> {
        self.aliases.remove(alias)
    }

    /// Local aliases owned by `owner`.
    pub(crate) fn aliases_of(&self, owner: &str) -> Vec<String> {
        self.aliases
            .iter()
            .filter(|(_, o)| o.as_str() == owner)
            .map(|(alias, _)| alias.clone())
            .collect()
    }

    /// Point a remote alias at `owner`, or drop it. Returns whether anything changed.
    pub(crate) fn set_virtual_alias(&mut self, alias: &str, owner: Option<&str>) -> bool {
        match owner {
            Some(owner) => {
                let previous = self
                    .virtual_aliases
                    .insert(alias.to_string(), owner.to_string());
                previous.as_deref() != Some(owner)
            }
            None => self.virtual_aliases.remove(alias).is_some(),
        }
    }

    // Links

    pub(crate) fn add_link(&mut self, link: Arc<dyn BusLink>) -> bool {
        let name = link.unique_name().to_string();
        if self.endpoints.contains_key(&name) {
            warn!(link = %name, "Link name already registered");
            return false;
        }
        self.links.push(name.clone());
        self.endpoints.insert(name, Endpoint::BusToBus(LinkEntry::new(link)));
        true
    }

    /// Unregister a link and every session route using it.
    pub(crate) fn remove_link(&mut self, name: &str) -> Option<Arc<dyn BusLink>> {
        let Some(Endpoint::BusToBus(entry)) = self.endpoints.get(name) else {
            return None;
        };
        let link = Arc::clone(&entry.link);
        self.endpoints.remove(name);
        self.links.retain(|l| l != name);
        self.casts.retain(|c| c.b2b.as_deref() != Some(name));
        Some(link)
    }

    pub(crate) fn link(&self, name: &str) -> Option<&Arc<dyn BusLink>> {
        match self.endpoints.get(name) {
            Some(Endpoint::BusToBus(entry)) => Some(&entry.link),
            _ => None,
        }
    }

    /// Links in the order they came up.
    pub(crate) fn links(&self) -> impl Iterator<Item = &Arc<dyn BusLink>> {
        self.links.iter().filter_map(|name| self.link(name))
    }

    pub(crate) fn link_names(&self) -> Vec<String> {
        self.links.clone()
    }

    #[cfg(test)]
    pub(crate) fn link_refs(&self, name: &str) -> Option<usize> {
        match self.endpoints.get(name) {
            Some(Endpoint::BusToBus(entry)) => Some(entry.refs),
            _ => None,
        }
    }

    pub(crate) fn add_link_ref(&mut self, name: &str) -> bool {
        match self.endpoints.get_mut(name) {
            Some(Endpoint::BusToBus(entry)) => {
                entry.refs += 1;
                trace!(link = %name, refs = entry.refs, "Link reference added");
                true
            }
            _ => false,
        }
    }

    /// Drop a reference on a link, closing it when none remain.
    pub(crate) fn release_link_ref(&mut self, name: &str) {
        if let Some(Endpoint::BusToBus(entry)) = self.endpoints.get_mut(name) {
            entry.refs = entry.refs.saturating_sub(1);
            trace!(link = %name, refs = entry.refs, "Link reference released");
            if entry.refs == 0 {
                debug!(link = %name, "Closing unreferenced link");
                entry.link.close();
            }
        }
    }

    // Virtual endpoints

    /// Make `name` reachable through `link`. Returns whether anything changed.
    pub(crate) fn add_virtual(&mut self, name: &str, link: &str) -> bool {
        match self.endpoints.get_mut(name) {
            Some(Endpoint::Virtual(vep)) => vep.add_link(link),
            Some(_) => {
                warn!(endpoint = %name, "Refusing to shadow a non-virtual endpoint");
                false
            }
            None => {
                debug!(endpoint = %name, link = %link, "Adding virtual endpoint");
                self.endpoints
                    .insert(name.to_string(), Endpoint::Virtual(VirtualEndpoint::new(link)));
                true
            }
        }
    }

    pub(crate) fn virtual_endpoint(&self, name: &str) -> Option<&VirtualEndpoint> {
        match self.endpoints.get(name) {
            Some(Endpoint::Virtual(vep)) => Some(vep),
            _ => None,
        }
    }

    fn virtual_mut(&mut self, name: &str) -> Option<&mut VirtualEndpoint> {
        match self.endpoints.get_mut(name) {
            Some(Endpoint::Virtual(vep)) => Some(vep),
            _ => None,
        }
    }

    pub(crate) fn is_virtual(&self, name: &str) -> bool {
        self.virtual_endpoint(name).is_some()
    }

    pub(crate) fn virtual_names(&self) -> Vec<String> {
        self.endpoints
            .iter()
            .filter(|(_, ep)| matches!(ep, Endpoint::Virtual(_)))
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Drop `link` from the reachable set of `name`.
    ///
    /// Returns `Some(true)` when the name is no longer reachable at all and
    /// `None` when `name` is not a virtual endpoint.
    pub(crate) fn remove_virtual_link(&mut self, name: &str, link: &str) -> Option<bool> {
        let (dropped, empty) = self.virtual_mut(name)?.remove_link(link);
        for _ in dropped {
            self.release_link_ref(link);
        }
        Some(empty)
    }

    /// Remove a virtual endpoint with its aliases and session references.
    pub(crate) fn remove_virtual(&mut self, name: &str) -> bool {
        if !self.is_virtual(name) {
            return false;
        }
        let Some(Endpoint::Virtual(vep)) = self.endpoints.remove(name) else {
            return false;
        };
        for link in vep.session_refs() {
            self.release_link_ref(link);
        }
        self.virtual_aliases.retain(|_, owner| owner != name);
        debug!(endpoint = %name, "Virtual endpoint removed");
        true
    }

    // Delivery

    /// Push `msg` to the endpoint registered as `name`.
    pub(crate) fn push(&self, name: &str, msg: Message, session_id: SessionId) -> Result<(), BusError> {
        match self.endpoints.get(name) {
            None => Err(BusError::NoEndpoint(name.to_string())),
            Some(Endpoint::Local) => {
                trace!(serial = msg.serial, "Message consumed by controller");
                Ok(())
            }
            Some(Endpoint::Client(client)) => Ok(client.push(msg)?),
            Some(Endpoint::BusToBus(entry)) => Ok(entry.link.push(msg)?),
            Some(Endpoint::Virtual(vep)) => {
                for link_name in vep.candidate_links(session_id) {
                    let Some(link) = self.link(link_name) else {
                        continue;
                    };
                    if link.is_closing() {
                        continue;
                    }
                    return Ok(link.push(msg)?);
                }
                Err(BusError::NoRoute(name.to_string()))
            }
        }
    }

    /// Push `msg` to every link accepted by `filter`.
    pub(crate) fn push_to_links(&self, msg: &Message, filter: impl Fn(&dyn BusLink) -> bool) {
        for link in self.links() {
            if !filter(link.as_ref()) {
                continue;
            }
            if let Err(e) = link.push(msg.clone()) {
                if e.is_closing() {
                    debug!(link = %link.unique_name(), "Link closing, signal dropped");
                } else {
                    warn!(link = %link.unique_name(), error = %e, "Failed to push to link");
                }
            }
        }
    }

    // Session routes

    /// Route messages of session `id` from `src` to `dest`.
    ///
    /// A remote `dest` is reached over `b2b` when given, otherwise over its
    /// first reachable link when `opts_hint` is given. Returns the link used.
    pub(crate) fn add_session_route(
        &mut self,
        src: &str,
        id: SessionId,
        dest: &str,
        b2b: Option<&str>,
        opts_hint: Option<&SessionOpts>,
    ) -> Result<Option<String>, BusError> {
        if id == 0 {
            return Err(BusError::NoSession(id));
        }
        let mut link = b2b.map(str::to_string);
        if let Some(vep) = self.virtual_mut(dest) {
            match (b2b, opts_hint) {
                (Some(b2b), _) => {
                    if !vep.add_session_ref(id, b2b) {
                        return Err(BusError::NoRoute(dest.to_string()));
                    }
                }
                (None, Some(_)) => {
                    link = Some(
                        vep.add_session_ref_any(id)
                            .ok_or_else(|| BusError::NoRoute(dest.to_string()))?,
                    );
                }
                (None, None) => return Err(BusError::NoSession(id)),
            }
            if let Some(link) = &link {
                let link = link.clone();
                self.add_link_ref(&link);
            }
        }
        trace!(session_id = id, src, dest, link = ?link, "Adding session route");
        self.casts.insert(SessionCast {
            id,
            src: src.to_string(),
            b2b: link.clone(),
            dest: dest.to_string(),
        });
        Ok(link)
    }

    /// Remove the single route of session `id` from `src` to `dest`.
    pub(crate) fn remove_session_route(&mut self, src: &str, id: SessionId, dest: &str) {
        if id == 0 {
            return;
        }
        let mut b2b = None;
        if let Some(vep) = self.virtual_mut(dest) {
            b2b = vep.link_for_session(id).map(str::to_string);
            if let Some(link) = vep.remove_session_ref(id) {
                self.release_link_ref(&link);
            }
        }
        let key = SessionCast {
            id,
            src: src.to_string(),
            b2b,
            dest: dest.to_string(),
        };
        if !self.casts.remove(&key) {
            self.casts
                .retain(|c| !(c.id == id && c.src == src && c.dest == dest));
        }
    }

    /// Remove every route of session `id` (all sessions when zero) sent by
    /// or aimed at `name`. Returns whether any route was removed.
    pub(crate) fn remove_session_routes(&mut self, name: &str, id: SessionId) -> bool {
        let doomed: Vec<SessionCast> = self
            .casts
            .iter()
            .filter(|c| (id == 0 || c.id == id) && (c.src == name || c.dest == name))
            .cloned()
            .collect();
        for cast in &doomed {
            self.casts.remove(cast);
            if let Some(vep) = self.virtual_mut(&cast.dest) {
                if let Some(link) = vep.remove_session_ref(cast.id) {
                    self.release_link_ref(&link);
                }
            }
        }
        if !doomed.is_empty() {
            debug!(endpoint = %name, session_id = id, routes = doomed.len(), "Session routes removed");
        }
        !doomed.is_empty()
    }

    /// Routes of session `id` leaving `src`, grouped by link.
    pub(crate) fn session_casts<'a>(
        &'a self,
        id: SessionId,
        src: &'a str,
    ) -> impl Iterator<Item = &'a SessionCast> + 'a {
        self.casts
            .iter()
            .filter(move |c| c.id == id && c.src == src)
    }

    // Name exchange

    /// Every name and alias known here, minus those owned by `exclude`.
    pub(crate) fn name_entries(&self, exclude: &Guid) -> Vec<NameEntry> {
        self.endpoints
            .iter()
            .filter(|(name, ep)| !matches!(ep, Endpoint::BusToBus(_)) && !exclude.owns(name))
            .map(|(name, _)| {
                let mut aliases: Vec<String> = self
                    .aliases
                    .iter()
                    .chain(self.virtual_aliases.iter())
                    .filter(|(_, owner)| *owner == name)
                    .map(|(alias, _)| alias.clone())
                    .collect();
                aliases.sort();
                NameEntry::new(name.clone(), aliases)
            })
            .collect()
    }

    /// Drop everything, returning the links that were registered.
    pub(crate) fn clear(&mut self) -> Vec<Arc<dyn BusLink>> {
        let links: Vec<_> = self.links().cloned().collect();
        self.endpoints.retain(|_, ep| matches!(ep, Endpoint::Local));
        self.aliases.clear();
        self.virtual_aliases.clear();
        self.links.clear();
        self.casts.clear();
        links
    }

    // Counters

    pub(crate) fn count(&self, kind: EndpointKind) -> usize {
        self.endpoints.values().filter(|ep| ep.kind() == kind).count()
    }

    pub(crate) fn cast_count(&self) -> usize {
        self.casts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use meshbus_protocol::{DaemonCall, DaemonReply};
    use meshbus_transport::{ChannelClient, RawStream, Sink, TransportError};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct TestLink {
        name: String,
        guid: Guid,
        closed: AtomicBool,
        sent: Mutex<Vec<Message>>,
    }

    impl TestLink {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                guid: Guid::new_random(),
                closed: AtomicBool::new(false),
                sent: Mutex::new(Vec::new()),
            })
        }
    }

    impl Sink for TestLink {
        fn push(&self, msg: Message) -> Result<(), TransportError> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(TransportError::Closing);
            }
            self.sent.lock().unwrap().push(msg);
            Ok(())
        }
    }

    #[async_trait]
    impl BusLink for TestLink {
        fn unique_name(&self) -> &str {
            &self.name
        }

        fn remote_guid(&self) -> Guid {
            self.guid
        }

        fn is_closing(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        async fn call(&self, _call: DaemonCall) -> Result<DaemonReply, TransportError> {
            Err(TransportError::Unsupported("test link"))
        }

        async fn detach_stream(&self) -> Result<RawStream, TransportError> {
            Err(TransportError::Unsupported("test link"))
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn table() -> NameTable {
        NameTable::new(":aaaaaaaa.1")
    }

    #[test]
    fn test_resolve_names_and_aliases() {
        let mut names = table();
        let (client, _rx) = ChannelClient::new(":aaaaaaaa.2");
        names.insert_client(client.clone()).unwrap();
        assert!(matches!(
            names.insert_client(client),
            Err(BusError::NameInUse(_))
        ));

        names.set_alias("org.example.Chat", ":aaaaaaaa.2");
        assert_eq!(names.resolve("org.example.Chat"), Some(":aaaaaaaa.2"));
        assert_eq!(names.resolve(":aaaaaaaa.2"), Some(":aaaaaaaa.2"));
        assert_eq!(names.resolve(":aaaaaaaa.9"), None);
        assert!(names.is_local("org.example.Chat"));
        assert!(names.is_local(":aaaaaaaa.1"));

        let removed = names.remove_client(":aaaaaaaa.2").unwrap();
        assert_eq!(removed, vec!["org.example.Chat".to_string()]);
        assert_eq!(names.resolve("org.example.Chat"), None);
        assert!(names.remove_client(":aaaaaaaa.1").is_none());
    }

    #[test]
    fn test_virtual_endpoints_follow_links() {
        let mut names = table();
        let link = TestLink::new(":bbbbbbbb.4");
        assert!(names.add_link(link.clone()));
        assert!(names.add_virtual(":bbbbbbbb.2", ":bbbbbbbb.4"));
        assert!(!names.add_virtual(":bbbbbbbb.2", ":bbbbbbbb.4"));
        assert!(names.set_virtual_alias("org.example.Remote", Some(":bbbbbbbb.2")));
        assert!(!names.set_virtual_alias("org.example.Remote", Some(":bbbbbbbb.2")));
        assert_eq!(names.resolve("org.example.Remote"), Some(":bbbbbbbb.2"));
        assert_eq!(names.kind(":bbbbbbbb.2"), Some(EndpointKind::Virtual));

        names
            .push(":bbbbbbbb.2", Message::session_lost(":aaaaaaaa.1", ":bbbbbbbb.2", 3), 0)
            .unwrap();
        assert_eq!(link.sent.lock().unwrap().len(), 1);

        assert_eq!(names.remove_virtual_link(":bbbbbbbb.2", ":bbbbbbbb.4"), Some(true));
        assert!(names.remove_virtual(":bbbbbbbb.2"));
        assert_eq!(names.resolve("org.example.Remote"), None);
    }

    #[test]
    fn test_session_routes_count_link_refs() {
        let mut names = table();
        let link = TestLink::new(":bbbbbbbb.4");
        names.add_link(link.clone());
        names.add_virtual(":bbbbbbbb.2", ":bbbbbbbb.4");
        let (client, _rx) = ChannelClient::new(":aaaaaaaa.2");
        names.insert_client(client).unwrap();

        assert!(matches!(
            names.add_session_route(":aaaaaaaa.2", 0, ":bbbbbbbb.2", Some(":bbbbbbbb.4"), None),
            Err(BusError::NoSession(0))
        ));
        let used = names
            .add_session_route(":aaaaaaaa.2", 9, ":bbbbbbbb.2", Some(":bbbbbbbb.4"), None)
            .unwrap();
        assert_eq!(used.as_deref(), Some(":bbbbbbbb.4"));
        names
            .add_session_route(":bbbbbbbb.2", 9, ":aaaaaaaa.2", None, None)
            .unwrap();
        assert_eq!(names.link_refs(":bbbbbbbb.4"), Some(1));
        assert_eq!(names.session_casts(9, ":aaaaaaaa.2").count(), 1);

        assert!(names.remove_session_routes(":aaaaaaaa.2", 9));
        assert_eq!(names.cast_count(), 0);
        assert_eq!(names.link_refs(":bbbbbbbb.4"), Some(0));
        assert!(link.is_closing());
        assert!(!names.remove_session_routes(":aaaaaaaa.2", 9));
    }

    #[test]
    fn test_route_to_unreachable_link_fails() {
        let mut names = table();
        names.add_link(TestLink::new(":bbbbbbbb.4"));
        names.add_virtual(":bbbbbbbb.2", ":bbbbbbbb.4");
        assert!(matches!(
            names.add_session_route(":aaaaaaaa.2", 5, ":bbbbbbbb.2", Some(":cccccccc.3"), None),
            Err(BusError::NoRoute(_))
        ));
        let hinted = SessionOpts::messages();
        let used = names
            .add_session_route(":aaaaaaaa.2", 5, ":bbbbbbbb.2", None, Some(&hinted))
            .unwrap();
        assert_eq!(used.as_deref(), Some(":bbbbbbbb.4"));
    }

    #[test]
    fn test_name_entries_skip_remote_daemon() {
        let mut names = table();
        let link = TestLink::new(":bbbbbbbb.4");
        let remote = link.guid;
        names.add_link(link);
        let remote_name = format!(":{}.2", remote.short_string());
        names.add_virtual(&remote_name, ":bbbbbbbb.4");
        names.add_virtual(":cccccccc.2", ":bbbbbbbb.4");
        names.set_virtual_alias("org.example.C", Some(":cccccccc.2"));

        let entries = names.name_entries(&remote);
        let listed: Vec<_> = entries.iter().map(|e| e.unique_name.as_str()).collect();
        assert!(listed.contains(&":aaaaaaaa.1"));
        assert!(listed.contains(&":cccccccc.2"));
        assert!(!listed.contains(&remote_name.as_str()));
        assert!(!listed.contains(&":bbbbbbbb.4"));
        let c = entries.iter().find(|e| e.unique_name == ":cccccccc.2").unwrap();
        assert_eq!(c.aliases, vec!["org.example.C".to_string()]);
    }

    #[test]
    fn test_removing_link_drops_casts() {
        let mut names = table();
        names.add_link(TestLink::new(":bbbbbbbb.4"));
        names.add_virtual(":bbbbbbbb.2", ":bbbbbbbb.4");
        names
            .add_session_route(":aaaaaaaa.2", 5, ":bbbbbbbb.2", Some(":bbbbbbbb.4"), None)
            .unwrap();
        assert!(names.remove_link(":bbbbbbbb.4").is_some());
        assert_eq!(names.cast_count(), 0);
        assert!(names.links().next().is_none());
        assert!(names.remove_link(":bbbbbbbb.4").is_none());
    }
}
