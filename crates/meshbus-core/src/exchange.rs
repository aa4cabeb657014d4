//! Name propagation between daemons.
//!
//! When a link comes up each side sends the other every name it knows
//! (`ExchangeNames`). Later changes travel as `NameChanged` signals. A
//! daemon that learns something new passes it on to every link leading to a
//! different daemon, so names spread across the whole mesh. Losing a link is
//! the final reconciliation: every name reachable only through it goes away.

use crate::bus::{BusInner, Deferred, Locked};
use crate::discovery::LOCAL_ADDRESS;
use meshbus_protocol::names::{is_controller_name, is_legal_unique_name};
use meshbus_protocol::{Body, Message, MessageKind, NameEntry, DAEMON_INTERFACE};
use meshbus_transport::BusLink;
use std::sync::Arc;
use tracing::{debug, info, trace, warn};

impl BusInner {
    /// A message arrived over `link_name`.
    pub(crate) fn deliver(&self, link_name: &str, msg: Message) {
        if msg.kind == MessageKind::Signal && msg.interface.as_deref() == Some(DAEMON_INTERFACE) {
            let sender = msg.sender;
            match msg.body {
                Body::ExchangeNames { names } => {
                    self.exchange_names_received(link_name, &sender, names);
                }
                Body::NameChanged {
                    alias,
                    old_owner,
                    new_owner,
                } => self.name_changed_received(link_name, &sender, &alias, &old_owner, &new_owner),
                Body::DetachSession { session_id, src } => {
                    self.detach_received(link_name, session_id, &src);
                }
                other => {
                    warn!(link = %link_name, member = ?msg.member, body = ?other, "Unexpected daemon signal");
                }
            }
            return;
        }
        if let Err(e) = self.route(msg, link_name) {
            debug!(link = %link_name, error = %e, "Routing of remote message failed");
        }
    }

    /// A link is up: register it and send our names across.
    pub(crate) fn link_established(&self, link: Arc<dyn BusLink>) {
        let name = link.unique_name().to_string();
        let mut names = self.write_names();
        if !names.add_link(Arc::clone(&link)) {
            return;
        }
        names.add_virtual(&link.remote_controller_name(), &name);

        let entries = names.name_entries(&link.remote_guid());
        info!(link = %name, remote = %link.remote_guid(), names = entries.len(), "Link established");
        if let Err(e) = link.push(Message::exchange_names(&self.controller, entries)) {
            warn!(link = %name, error = %e, "Failed to send ExchangeNames");
        }
    }

    pub(crate) fn exchange_names_received(&self, link_name: &str, sender: &str, entries: Vec<NameEntry>) {
        let mut names = self.write_names();
        let Some(from_guid) = names.link(link_name).map(|link| link.remote_guid()) else {
            warn!(link = %link_name, "ExchangeNames over unknown link");
            return;
        };

        let mut changed = false;
        for entry in entries {
            if !is_legal_unique_name(&entry.unique_name) {
                warn!(name = %entry.unique_name, "Skipping illegal unique name");
                continue;
            }
            if self.guid.owns(&entry.unique_name) || entry.unique_name == sender {
                continue;
            }
            changed |= names.add_virtual(&entry.unique_name, link_name);
            if !names.is_virtual(&entry.unique_name) {
                continue;
            }
            for alias in &entry.aliases {
                changed |= names.set_virtual_alias(alias, Some(&entry.unique_name));
            }
        }

        if changed {
            let forward = Message::exchange_names(&self.controller, names.name_entries(&from_guid));
            trace!(link = %link_name, "Forwarding names learned over link");
            names.push_to_links(&forward, |link| link.remote_guid() != from_guid);
        }
    }

    pub(crate) fn name_changed_received(
        &self,
        link_name: &str,
        sender: &str,
        alias: &str,
        old_owner: &str,
        new_owner: &str,
    ) {
        if (!old_owner.is_empty() && self.guid.owns(old_owner))
            || (!new_owner.is_empty() && self.guid.owns(new_owner))
        {
            debug!(alias, old_owner, new_owner, "Ignoring NameChanged about our own names");
            return;
        }

        let mut deferred = Vec::new();
        {
            let mut l = self.lock();
            let Some(from_guid) = l.names.link(link_name).map(|link| link.remote_guid()) else {
                return;
            };
            let changed = if alias.starts_with(':') {
                if new_owner.is_empty() {
                    let reachable = l
                        .names
                        .virtual_endpoint(old_owner)
                        .is_some_and(|vep| vep.can_use_route(link_name));
                    if l.names.remove_virtual_link(old_owner, link_name) == Some(true) {
                        self.remove_virtual_endpoint(&mut l, old_owner, &mut deferred);
                    }
                    reachable
                } else {
                    l.names.add_virtual(alias, link_name)
                }
            } else {
                if !l.names.is_virtual(sender) {
                    warn!(sender, alias, "NameChanged from unknown controller");
                    return;
                }
                let owner = (!new_owner.is_empty() && l.names.is_virtual(new_owner)).then_some(new_owner);
                l.names.set_virtual_alias(alias, owner)
            };

            if changed {
                debug!(alias, old_owner, new_owner, "Forwarding NameChanged");
                let forward = Message::name_changed(&self.controller, alias, old_owner, new_owner);
                l.names
                    .push_to_links(&forward, |link| link.remote_guid() != from_guid);
            }
        }
        self.apply(deferred);
    }

    /// The link named `link_name` is gone.
    pub(crate) fn link_lost(&self, link_name: &str) {
        let mut deferred = Vec::new();
        {
            let mut l = self.lock();
            if l.names.link(link_name).is_none() {
                return;
            }
            for name in l.names.virtual_names() {
                let ids = l
                    .names
                    .virtual_endpoint(&name)
                    .map(|vep| vep.session_ids_for(link_name))
                    .unwrap_or_default();
                for id in ids {
                    let lost = l.state.sessions.remove_session_refs(&name, id);
                    self.notify_lost(&l.names, &lost);
                    l.names.remove_session_routes(&name, id);
                }
                if l.names.remove_virtual_link(&name, link_name) == Some(true) {
                    self.remove_virtual_endpoint(&mut l, &name, &mut deferred);
                    let gone = Message::name_changed(&self.controller, &name, &name, "");
                    l.names.push_to_links(&gone, |link| link.unique_name() != link_name);
                }
            }
            l.names.remove_link(link_name);
        }
        self.apply(deferred);
        info!(link = %link_name, "Link lost");
    }

    /// Drop a remote name and everything hanging off it.
    pub(crate) fn remove_virtual_endpoint(&self, l: &mut Locked<'_>, name: &str, deferred: &mut Vec<Deferred>) {
        if !l.names.remove_virtual(name) {
            return;
        }
        l.names.remove_session_routes(name, 0);
        self.name_owner_changed(l, name, Some(name), None, deferred);
    }

    /// React to `alias` moving from `old_owner` to `new_owner`.
    pub(crate) fn name_owner_changed(
        &self,
        l: &mut Locked<'_>,
        alias: &str,
        old_owner: Option<&str>,
        new_owner: Option<&str>,
        deferred: &mut Vec<Deferred>,
    ) {
        let Some(owner) = old_owner.or(new_owner) else {
            return;
        };
        if is_controller_name(owner) {
            return;
        }
        let unique = alias.starts_with(':');

        if unique && new_owner.is_none() {
            let lost = l.state.sessions.remove_departed(alias);
            self.notify_lost(&l.names, &lost);
        }

        if !self.guid.owns(owner) {
            return;
        }

        let changed = Message::name_changed(
            &self.controller,
            alias,
            old_owner.unwrap_or_default(),
            new_owner.unwrap_or_default(),
        );
        l.names.push_to_links(&changed, |_| true);

        if new_owner.is_some() {
            return;
        }
        if !unique {
            if l.state.name_map.seen_at(alias, LOCAL_ADDRESS) {
                deferred.push(Deferred::LocalNames {
                    names: vec![alias.to_string()],
                    ttl: 0,
                });
            }
            return;
        }

        for (name, mask) in l.state.advertise.owned_by(alias) {
            self.withdraw_advertisement(l, alias, &name, mask, deferred);
        }
        for prefix in l.state.discover.owned_by(alias) {
            self.withdraw_find(l, alias, &prefix, deferred);
        }
        if self.rules.remove(alias).is_some() {
            debug!(endpoint = %alias, "Match rules dropped");
        }
    }
}
