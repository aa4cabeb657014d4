//! Session ports, leaving and raw stream hand-off.

use crate::bus::{BusInner, SessionState};
use crate::endpoint::EndpointKind;
use crate::registry::NameTable;
use crate::session_map::{LostSessions, SessionEntry};
use meshbus_protocol::{
    AttachSessionReply, DaemonCall, DaemonReply, GetSessionInfoReply, GetSessionInfoRequest,
    Message, ReplyCode, SessionId, SessionOpts, SessionPort, TrafficType, SESSION_PORT_ANY,
};
use meshbus_transport::RawStream;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Answer to `call` when the daemon cannot serve it at all.
pub(crate) fn refused(call: &DaemonCall) -> DaemonReply {
    match call {
        DaemonCall::AttachSession(req) => {
            DaemonReply::AttachSession(AttachSessionReply::failed(ReplyCode::Failed, req.opts))
        }
        DaemonCall::GetSessionInfo(_) => DaemonReply::GetSessionInfo(GetSessionInfoReply {
            code: ReplyCode::Failed,
            bus_addrs: Vec::new(),
        }),
    }
}

/// A random session id no local entry uses yet.
pub(crate) fn new_session_id(state: &SessionState) -> SessionId {
    loop {
        let id: SessionId = rand::random();
        if id != 0 && !state.sessions.id_in_use(id) {
            return id;
        }
    }
}

impl BusInner {
    /// Send `SessionLost` to every local party in `lost`.
    pub(crate) fn notify_lost(&self, names: &NameTable, lost: &LostSessions) {
        for (owner, id) in lost {
            debug!(endpoint = %owner, session_id = id, "Sending SessionLost");
            let msg = Message::session_lost(&self.controller, owner, *id);
            if let Err(e) = names.push(owner, msg, 0) {
                debug!(endpoint = %owner, error = %e, "SessionLost not delivered");
            }
        }
    }

    pub(crate) fn bind_session_port(
        &self,
        owner: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> (ReplyCode, SessionPort) {
        if !opts.is_bindable() {
            return (ReplyCode::BadSessionOpts, port);
        }
        let mut l = self.lock();
        if l.names.kind(owner) != Some(EndpointKind::Client) {
            return (ReplyCode::Failed, port);
        }
        let sessions = &mut l.state.sessions;
        let port = if port == SESSION_PORT_ANY {
            match (self.config.first_dynamic_port..=SessionPort::MAX)
                .find(|p| !sessions.port_in_use(owner, *p))
            {
                Some(p) => p,
                None => return (ReplyCode::Failed, port),
            }
        } else if sessions.port_in_use(owner, port) {
            return (ReplyCode::AlreadyExists, port);
        } else {
            port
        };
        sessions.insert(SessionEntry::placeholder(owner, port, opts));
        info!(endpoint = %owner, port, "Session port bound");
        (ReplyCode::Success, port)
    }

    pub(crate) fn unbind_session_port(&self, owner: &str, port: SessionPort) -> ReplyCode {
        let mut l = self.lock();
        match l.state.sessions.remove_placeholder(owner, port) {
            Some(_) => {
                debug!(endpoint = %owner, port, "Session port unbound");
                ReplyCode::Success
            }
            None => ReplyCode::Failed,
        }
    }

    pub(crate) fn leave_session(&self, owner: &str, id: SessionId) -> ReplyCode {
        let mut l = self.lock();
        if id == 0 {
            return ReplyCode::NoSession;
        }
        if l.state.sessions.get(owner, id).is_none() {
            return ReplyCode::NoSession;
        }

        let lost = l.state.sessions.remove_session_refs(owner, id);
        self.notify_lost(&l.names, &lost);

        // Tell the other daemons before the routes go, as dropping the last
        // route may close the link.
        let detach = Message::detach_session(&self.controller, id, owner);
        l.names.push_to_links(&detach, |_| true);
        l.names.remove_session_routes(owner, id);
        info!(endpoint = %owner, session_id = id, "Left session");
        ReplyCode::Success
    }

    /// `src` left session `id` on another daemon.
    pub(crate) fn detach_received(&self, link_name: &str, id: SessionId, src: &str) {
        let mut l = self.lock();
        let Some(from_guid) = l.names.link(link_name).map(|link| link.remote_guid()) else {
            return;
        };
        let lost = l.state.sessions.remove_session_refs(src, id);
        self.notify_lost(&l.names, &lost);

        let routed = l.names.session_casts(id, src).next().is_some();
        if !routed && lost.is_empty() {
            return;
        }
        // Pass it on before the routes go, as dropping them may close links.
        let detach = Message::detach_session(&self.controller, id, src);
        l.names
            .push_to_links(&detach, |link| link.remote_guid() != from_guid);
        l.names.remove_session_routes(src, id);
        debug!(session_id = id, src, "Session routes detached");
    }

    /// Hand the raw stream of session `id` to `owner`, waiting for the
    /// attach to deliver it. The entry is removed once collected.
    pub(crate) async fn get_session_fd(
        &self,
        owner: &str,
        id: SessionId,
    ) -> (ReplyCode, Option<RawStream>) {
        let deadline = Instant::now() + self.config.session_fd_timeout;
        loop {
            {
                let mut l = self.lock();
                let Some(entry) = l.state.sessions.get_mut(owner, id) else {
                    return (ReplyCode::NoSession, None);
                };
                if entry.opts.traffic == TrafficType::Messages {
                    return (ReplyCode::BadSessionOpts, None);
                }
                if let Some(fd) = entry.fd.take() {
                    l.state.sessions.remove(owner, id);
                    debug!(endpoint = %owner, session_id = id, "Session stream handed over");
                    return (ReplyCode::Success, Some(fd));
                }
            }
            if Instant::now() >= deadline {
                warn!(endpoint = %owner, session_id = id, "Session stream never arrived");
                return (ReplyCode::NoSession, None);
            }
            sleep(self.config.fd_poll_interval).await;
        }
    }

    /// Bus addresses the creator `host` accepts joiners on.
    ///
    /// A creator on another daemon is asked over its first reachable link,
    /// unless that is the link the question came in on.
    pub(crate) async fn session_info(
        &self,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
        arrival: Option<&str>,
    ) -> (ReplyCode, Vec<String>) {
        let link = {
            let names = self.read_names();
            let Some(resolved) = names.resolve(host) else {
                return (ReplyCode::NoSession, Vec::new());
            };
            match names.kind(resolved) {
                Some(EndpointKind::Client | EndpointKind::Local) => {
                    let addrs = self.transports.listen_addresses(&opts);
                    let code = if addrs.is_empty() {
                        ReplyCode::NoSession
                    } else {
                        ReplyCode::Success
                    };
                    return (code, addrs);
                }
                Some(EndpointKind::Virtual) => names
                    .virtual_endpoint(resolved)
                    .and_then(|vep| vep.link_for_session(0))
                    .filter(|name| Some(*name) != arrival)
                    .and_then(|name| names.link(name))
                    .cloned(),
                _ => None,
            }
        };
        let Some(link) = link else {
            return (ReplyCode::NoSession, Vec::new());
        };

        let call = DaemonCall::GetSessionInfo(GetSessionInfoRequest {
            creator: host.to_string(),
            session_port: port,
            opts,
        });
        match link.call(call).await {
            Ok(DaemonReply::GetSessionInfo(reply)) => (reply.code, reply.bus_addrs),
            Ok(other) => {
                warn!(reply = ?other, "Unexpected reply to GetSessionInfo");
                (ReplyCode::Failed, Vec::new())
            }
            Err(e) => {
                warn!(link = %link.unique_name(), error = %e, "GetSessionInfo failed");
                (ReplyCode::Failed, Vec::new())
            }
        }
    }
}
