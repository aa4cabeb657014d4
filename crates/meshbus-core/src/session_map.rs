//! Session bindings and memberships.
//!
//! Each local party of a session holds its own [`SessionEntry`], keyed by
//! owner name, session id and port. An entry with id zero is the port
//! reservation made by `BindSessionPort`; entries with a nonzero id are live
//! sessions.

use meshbus_protocol::{SessionId, SessionOpts, SessionPort};
use meshbus_transport::RawStream;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Session state held for one local party.
#[derive(Debug)]
pub(crate) struct SessionEntry {
    pub(crate) endpoint_name: String,
    pub(crate) id: SessionId,
    /// Unique name of the creator, cleared once the creator is gone.
    pub(crate) session_host: String,
    pub(crate) session_port: SessionPort,
    pub(crate) opts: SessionOpts,
    /// Joiners, in join order. The creator is not listed.
    pub(crate) members: Vec<String>,
    /// Raw stream waiting to be collected with `GetSessionFd`.
    pub(crate) fd: Option<RawStream>,
    /// Link whose stream becomes `fd` once the attach completes.
    pub(crate) streaming_link: Option<String>,
}

impl SessionEntry {
    /// Port reservation of `host`.
    pub(crate) fn placeholder(host: &str, port: SessionPort, opts: SessionOpts) -> Self {
        Self {
            endpoint_name: host.to_string(),
            id: 0,
            session_host: host.to_string(),
            session_port: port,
            opts,
            members: Vec::new(),
            fd: None,
            streaming_link: None,
        }
    }

    /// The same session as seen by `owner`, without any stream.
    pub(crate) fn copy_for(&self, owner: &str) -> Self {
        Self {
            endpoint_name: owner.to_string(),
            id: self.id,
            session_host: self.session_host.clone(),
            session_port: self.session_port,
            opts: self.opts,
            members: self.members.clone(),
            fd: None,
            streaming_link: None,
        }
    }

    /// Whether the session is down to its last party and holds no stream.
    fn is_orphaned(&self) -> bool {
        self.fd.is_none()
            && self.streaming_link.is_none()
            && (self.members.is_empty()
                || (self.members.len() == 1 && self.session_host.is_empty()))
    }

    fn key(&self) -> (String, SessionId, SessionPort) {
        (self.endpoint_name.clone(), self.id, self.session_port)
    }
}

/// Parties told that their session is gone: `(owner, session id)`.
pub(crate) type LostSessions = Vec<(String, SessionId)>;

#[derive(Debug, Default)]
pub(crate) struct SessionMap {
    entries: BTreeMap<(String, SessionId, SessionPort), SessionEntry>,
}

impl SessionMap {
    pub(crate) fn insert(&mut self, entry: SessionEntry) {
        debug!(
            endpoint = %entry.endpoint_name,
            session_id = entry.id,
            port = entry.session_port,
            "Session entry stored"
        );
        self.entries.insert(entry.key(), entry);
    }

    fn range(
        &self,
        owner: &str,
        id: SessionId,
    ) -> impl Iterator<Item = (&(String, SessionId, SessionPort), &SessionEntry)> {
        self.entries.range(
            (owner.to_string(), id, SessionPort::MIN)..=(owner.to_string(), id, SessionPort::MAX),
        )
    }

    pub(crate) fn get(&self, owner: &str, id: SessionId) -> Option<&SessionEntry> {
        self.range(owner, id).map(|(_, e)| e).next()
    }

    pub(crate) fn get_mut(&mut self, owner: &str, id: SessionId) -> Option<&mut SessionEntry> {
        let key = self.range(owner, id).map(|(k, _)| k.clone()).next()?;
        self.entries.get_mut(&key)
    }

    pub(crate) fn remove(&mut self, owner: &str, id: SessionId) -> Option<SessionEntry> {
        let key = self.range(owner, id).map(|(k, _)| k.clone()).next()?;
        self.entries.remove(&key)
    }

    pub(crate) fn placeholder(&self, host: &str, port: SessionPort) -> Option<&SessionEntry> {
        self.entries.get(&(host.to_string(), 0, port))
    }

    pub(crate) fn remove_placeholder(&mut self, host: &str, port: SessionPort) -> Option<SessionEntry> {
        self.entries.remove(&(host.to_string(), 0, port))
    }

    /// Every entry of `owner`, placeholders first.
    pub(crate) fn entries_of<'a>(&'a self, owner: &'a str) -> impl Iterator<Item = &'a SessionEntry> + 'a {
        self.entries
            .range((owner.to_string(), 0, SessionPort::MIN)..)
            .take_while(move |((o, _, _), _)| o == owner)
            .map(|(_, e)| e)
    }

    /// Live sessions `host` created on `port`.
    pub(crate) fn live_hosted<'a>(
        &'a self,
        host: &'a str,
        port: SessionPort,
    ) -> impl Iterator<Item = &'a SessionEntry> + 'a {
        self.entries_of(host)
            .filter(move |e| e.id != 0 && e.session_port == port && e.session_host == host)
    }

    /// Whether `owner` already uses `port` in any of its entries.
    pub(crate) fn port_in_use(&self, owner: &str, port: SessionPort) -> bool {
        self.entries_of(owner).any(|e| e.session_port == port)
    }

    /// Whether any live entry carries `id`.
    pub(crate) fn id_in_use(&self, id: SessionId) -> bool {
        self.entries.values().any(|e| e.id == id)
    }

    /// Record `member` in every local entry of the session `owner` holds as
    /// `id`. Entries of another host that happen to carry the same id are
    /// left alone. Returns the members as `owner` now sees them.
    pub(crate) fn add_member(&mut self, id: SessionId, member: &str, owner: &str) -> Vec<String> {
        let Some(host) = self.get(owner, id).filter(|_| id != 0).map(|e| e.session_host.clone()) else {
            return Vec::new();
        };
        for entry in self
            .entries
            .values_mut()
            .filter(|e| e.id == id && e.session_host == host)
        {
            if !entry.members.iter().any(|m| m == member) {
                entry.members.push(member.to_string());
            }
        }
        self.get(owner, id).map(|e| e.members.clone()).unwrap_or_default()
    }

    /// `name` leaves session `id`.
    ///
    /// Its own entry is erased; in the entries of the other parties it is
    /// dropped as creator or member. Entries left with a single party are
    /// erased and reported.
    pub(crate) fn remove_session_refs(&mut self, name: &str, id: SessionId) -> LostSessions {
        if id == 0 {
            return Vec::new();
        }
        self.remove_party(name, Some(id))
    }

    /// `name` is gone for good: erase its entries and drop it from every session.
    pub(crate) fn remove_departed(&mut self, name: &str) -> LostSessions {
        self.remove_party(name, None)
    }

    fn remove_party(&mut self, name: &str, only: Option<SessionId>) -> LostSessions {
        let applies = |id: SessionId| id != 0 && only.map_or(true, |o| o == id);
        let mut lost = Vec::new();
        let keys: Vec<_> = self.entries.keys().cloned().collect();
        for key in keys {
            if key.0 == name {
                if only.is_none() || applies(key.1) {
                    if let Some(entry) = self.entries.remove(&key) {
                        shutdown_fd(&entry);
                    }
                }
                continue;
            }
            if !applies(key.1) {
                continue;
            }
            let Some(entry) = self.entries.get_mut(&key) else {
                continue;
            };
            let mut changed = false;
            if entry.session_host == name {
                entry.session_host.clear();
                changed = true;
            } else if let Some(pos) = entry.members.iter().position(|m| m == name) {
                entry.members.remove(pos);
                changed = true;
            }
            if changed && entry.is_orphaned() {
                debug!(endpoint = %key.0, session_id = key.1, departed = %name, "Session lost");
                lost.push((key.0.clone(), key.1));
                self.entries.remove(&key);
            }
        }
        lost
    }

    /// Number of live entries.
    pub(crate) fn live_count(&self) -> usize {
        self.entries.keys().filter(|k| k.1 != 0).count()
    }

    /// Number of port reservations.
    pub(crate) fn binding_count(&self) -> usize {
        self.entries.keys().filter(|k| k.1 == 0).count()
    }

    /// Drop every entry, closing pending streams.
    pub(crate) fn clear(&mut self) {
        for entry in self.entries.values() {
            shutdown_fd(entry);
        }
        self.entries.clear();
    }
}

pub(crate) fn shutdown_fd(entry: &SessionEntry) {
    if let Some(fd) = &entry.fd {
        if let Err(e) = fd.shutdown() {
            warn!(endpoint = %entry.endpoint_name, session_id = entry.id, error = %e, "Failed to shut down session stream");
        }
    }
}
