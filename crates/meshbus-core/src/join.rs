//! Joining sessions.
//!
//! A join against a local creator is settled entirely here. Against a remote
//! creator the joiner's daemon finds an address for it, connects, and sends
//! `AttachSession` over the new link; the creator's daemon answers, or passes
//! the request on when the destination lives further away. Multipoint joins
//! then attach the joiner to every other member.
//!
//! Both locks are released around every await: accept round trips, connects,
//! calls and the reachability polls all run unlocked and re-validate what
//! they need afterwards.

use crate::bus::{BusInner, Locked};
use crate::endpoint::EndpointKind;
use crate::session::{new_session_id, refused};
use crate::session_map::{shutdown_fd, SessionEntry};
use meshbus_protocol::names::is_legal_unique_name;
use meshbus_protocol::{
    AttachSessionReply, AttachSessionRequest, DaemonCall, DaemonReply, GetSessionInfoReply,
    Message, ReplyCode, SessionId, SessionOpts, SessionPort, TrafficType,
};
use meshbus_transport::{BusLink, ClientConnection, RawStream};
use std::sync::Arc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

/// Outcome of a join: reply code, session id and the session's options.
pub(crate) type JoinResult = (ReplyCode, SessionId, SessionOpts);

/// How a multipoint member is reached from here.
enum Reach {
    Local,
    Remote(Arc<dyn BusLink>),
    Unknown,
}

/// What an attach for a local destination joins.
struct AttachTarget {
    dest: String,
    id: SessionId,
    opts: SessionOpts,
    /// Set when a new session is created; the creator must accept it.
    creator: Option<Arc<dyn ClientConnection>>,
    existing: bool,
}

fn is_raw(opts: &SessionOpts) -> bool {
    opts.traffic != TrafficType::Messages
}

impl BusInner {
    pub(crate) async fn join_session(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> JoinResult {
        let target = {
            let names = self.read_names();
            if names.kind(joiner) != Some(EndpointKind::Client) {
                return (ReplyCode::Failed, 0, opts);
            }
            names.resolve(host).map(|n| (n.to_string(), names.kind(n)))
        };
        let result = match target {
            Some((host, Some(EndpointKind::Client | EndpointKind::Local))) => {
                self.join_local(joiner, &host, port, opts).await
            }
            _ => self.join_remote(joiner, host, port, opts).await,
        };
        info!(joiner, host, port, code = ?result.0, session_id = result.1, "JoinSession");
        result
    }

    async fn join_local(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> JoinResult {
        let (id, session_opts, creator, existing) = {
            let l = self.lock();
            let Some(placeholder) = l.state.sessions.placeholder(host, port) else {
                return (ReplyCode::NoSession, 0, opts);
            };
            let offered = placeholder.opts;
            let live = l
                .state
                .sessions
                .live_hosted(host, port)
                .next()
                .map(|e| (e.id, e.members.iter().any(|m| m == joiner)));
            let (id, existing) = match live {
                Some((_, true)) => return (ReplyCode::AlreadyJoined, 0, opts),
                Some((id, false)) if offered.is_multipoint => (id, true),
                Some(_) => {
                    debug!(host, port, "Point-to-point session already joined");
                    return (ReplyCode::Failed, 0, opts);
                }
                None => (new_session_id(&l.state), false),
            };
            if !offered.is_compatible(&opts) {
                return (ReplyCode::BadSessionOpts, 0, opts);
            }
            let Some(creator) = l.names.client(host) else {
                return (ReplyCode::NoSession, 0, opts);
            };
            (id, offered, creator, existing)
        };

        match creator.accept_session(port, id, joiner, &session_opts).await {
            Ok(true) => {}
            Ok(false) => return (ReplyCode::Rejected, 0, opts),
            Err(e) => {
                warn!(host, error = %e, "Accept round trip failed");
                return (ReplyCode::Failed, 0, opts);
            }
        }

        let members = {
            let mut l = self.lock();
            if !l.names.contains(joiner) || !l.names.contains(host) {
                return (ReplyCode::Failed, 0, opts);
            }
            if existing && l.state.sessions.get(host, id).is_none() {
                debug!(host, session_id = id, "Session ended while the creator was asked");
                return (ReplyCode::Failed, 0, opts);
            }
            if !existing && l.state.sessions.id_in_use(id) {
                warn!(host, session_id = id, "Session id taken while the creator was asked");
                return (ReplyCode::Failed, 0, opts);
            }
            if !is_raw(&session_opts) {
                if let Err(e) = l.names.add_session_route(joiner, id, host, None, None) {
                    warn!(error = %e, "Session route to host failed");
                    return (ReplyCode::Failed, 0, opts);
                }
                if let Err(e) = l.names.add_session_route(host, id, joiner, None, None) {
                    warn!(error = %e, "Session route to joiner failed");
                    l.names.remove_session_route(joiner, id, host);
                    return (ReplyCode::Failed, 0, opts);
                }
            }

            if !existing {
                let sessions = &l.state.sessions;
                let taken = !session_opts.is_multipoint && sessions.live_hosted(host, port).next().is_some();
                let entry = sessions
                    .placeholder(host, port)
                    .filter(|_| !taken)
                    .map(|p| p.copy_for(host));
                let Some(mut entry) = entry else {
                    self.abandon_join(&mut l, joiner, host, id, false);
                    return (ReplyCode::Failed, 0, opts);
                };
                entry.id = id;
                l.state.sessions.insert(entry);
            }
            let members = l.state.sessions.add_member(id, joiner, host);

            let Some(mut joined) = l.state.sessions.get(host, id).map(|e| e.copy_for(joiner)) else {
                self.abandon_join(&mut l, joiner, host, id, !existing);
                return (ReplyCode::Failed, 0, opts);
            };
            if is_raw(&session_opts) {
                match RawStream::pair() {
                    Ok((host_end, joiner_end)) => {
                        if let Some(entry) = l.state.sessions.get_mut(host, id) {
                            entry.fd = Some(host_end);
                        }
                        joined.fd = Some(joiner_end);
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to create session stream pair");
                        self.abandon_join(&mut l, joiner, host, id, !existing);
                        return (ReplyCode::Failed, 0, opts);
                    }
                }
            }
            l.state.sessions.insert(joined);
            members
        };

        if session_opts.is_multipoint {
            self.attach_members(joiner, host, port, id, session_opts, &members, None)
                .await;
        }
        (ReplyCode::Success, id, session_opts)
    }

    /// Undo what a failed local join of `joiner` installed for session `id`.
    ///
    /// `created` is set when the creator's entry was made for this join and
    /// goes with it; otherwise `joiner` is only dropped from the members.
    fn abandon_join(&self, l: &mut Locked<'_>, joiner: &str, host: &str, id: SessionId, created: bool) {
        l.names.remove_session_routes(joiner, id);
        if created {
            if let Some(entry) = l.state.sessions.remove(host, id) {
                shutdown_fd(&entry);
            }
        }
        let lost = l.state.sessions.remove_session_refs(joiner, id);
        self.notify_lost(&l.names, &lost);
    }

    async fn join_remote(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> JoinResult {
        let mut addrs = {
            let l = self.lock();
            l.state.name_map.addresses(host, opts.transports)
        };
        if addrs.is_empty() {
            let (code, found) = self.session_info(host, port, opts, None).await;
            if code.is_success() {
                addrs = found;
            }
        }
        if addrs.is_empty() {
            debug!(host, "No address known for session host");
            return (ReplyCode::Unreachable, 0, opts);
        }

        let mut connected = None;
        for addr in &addrs {
            let Some(transport) = self.transports.for_address(addr) else {
                debug!(bus_addr = %addr, "No transport for address");
                continue;
            };
            match transport.connect(addr).await {
                Ok(link) => {
                    connected = Some((addr.clone(), link));
                    break;
                }
                Err(e) => warn!(bus_addr = %addr, error = %e, "Connect failed"),
            }
        }
        let Some((bus_addr, link)) = connected else {
            return (ReplyCode::ConnectFailed, 0, opts);
        };

        let link_name = link.unique_name().to_string();
        if !self.write_names().add_link_ref(&link_name) {
            return (ReplyCode::Failed, 0, opts);
        }
        let result = self
            .attach_over(joiner, host, port, opts, &bus_addr, &link)
            .await;
        self.write_names().release_link_ref(&link_name);
        result
    }

    async fn attach_over(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
        bus_addr: &str,
        link: &Arc<dyn BusLink>,
    ) -> JoinResult {
        let link_name = link.unique_name().to_string();
        let req = AttachSessionRequest {
            session_port: port,
            src: joiner.to_string(),
            session_host: host.to_string(),
            dest: host.to_string(),
            src_b2b: link_name.clone(),
            remote_controller: link.remote_controller_name(),
            session_id: 0,
            bus_addr: bus_addr.to_string(),
            opts,
        };
        let reply = match link.call(DaemonCall::AttachSession(req)).await {
            Ok(DaemonReply::AttachSession(reply)) => reply,
            Ok(other) => {
                warn!(reply = ?other, "Unexpected reply to AttachSession");
                return (ReplyCode::Failed, 0, opts);
            }
            Err(e) => {
                warn!(link = %link_name, error = %e, "AttachSession failed");
                return (ReplyCode::Failed, 0, opts);
            }
        };
        if !reply.code.is_success() {
            return (reply.code, 0, opts);
        }
        let id = reply.session_id;
        let session_opts = reply.opts;

        let Some(vhost) = self.wait_reachable(host, &link_name).await else {
            warn!(host, link = %link_name, "Session host never became reachable");
            self.detach_over(link, joiner, id);
            return (ReplyCode::Failed, 0, opts);
        };

        {
            let mut l = self.lock();
            if !l.names.contains(joiner) {
                self.detach_over(link, joiner, id);
                return (ReplyCode::Failed, 0, opts);
            }
            if !is_raw(&session_opts) {
                let routed = l
                    .names
                    .add_session_route(joiner, id, &vhost, Some(&link_name), None)
                    .and_then(|_| l.names.add_session_route(&vhost, id, joiner, None, None));
                if let Err(e) = routed {
                    warn!(error = %e, "Session routes to remote host failed");
                    l.names.remove_session_routes(joiner, id);
                    self.detach_over(link, joiner, id);
                    return (ReplyCode::Failed, 0, opts);
                }
            }
            l.state.sessions.insert(SessionEntry {
                endpoint_name: joiner.to_string(),
                id,
                session_host: vhost,
                session_port: port,
                opts: session_opts,
                members: reply.members.clone(),
                fd: None,
                streaming_link: is_raw(&session_opts).then(|| link_name.clone()),
            });
            l.state.sessions.add_member(id, joiner, joiner);
        }

        if is_raw(&session_opts) {
            let stream = link.detach_stream().await;
            let mut l = self.lock();
            let stored = match (stream, l.state.sessions.get_mut(joiner, id)) {
                (Ok(stream), Some(entry)) => {
                    entry.fd = Some(stream);
                    entry.streaming_link = None;
                    true
                }
                (Ok(stream), None) => {
                    let _ = stream.shutdown();
                    false
                }
                (Err(e), _) => {
                    warn!(link = %link_name, error = %e, "Failed to detach session stream");
                    false
                }
            };
            if !stored {
                l.state.sessions.remove(joiner, id);
                return (ReplyCode::Failed, 0, opts);
            }
        } else if session_opts.is_multipoint {
            self.attach_members(joiner, host, port, id, session_opts, &reply.members, Some(link))
                .await;
        }
        (ReplyCode::Success, id, session_opts)
    }

    /// Tell the daemon across `link` that `joiner` is not part of session `id`
    /// after all, so it drops what its side of the attach installed.
    fn detach_over(&self, link: &Arc<dyn BusLink>, joiner: &str, id: SessionId) {
        let detach = Message::detach_session(&self.controller, id, joiner);
        if let Err(e) = link.push(detach) {
            debug!(link = %link.unique_name(), error = %e, "DetachSession not sent");
        }
    }

    /// Attach `joiner` to every other member of multipoint session `id`.
    ///
    /// Members on other daemons are sent `AttachSession` over `via` when the
    /// creator is remote, or over the link carrying the session otherwise.
    /// Failures are logged and skipped.
    #[allow(clippy::too_many_arguments)]
    async fn attach_members(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        id: SessionId,
        opts: SessionOpts,
        members: &[String],
        via: Option<&Arc<dyn BusLink>>,
    ) {
        for member in members.iter().filter(|m| m.as_str() != joiner) {
            let reach = {
                let names = self.read_names();
                match names.kind(member) {
                    Some(EndpointKind::Client) => Reach::Local,
                    Some(EndpointKind::Virtual) => match via {
                        Some(link) => Reach::Remote(Arc::clone(link)),
                        None => names
                            .virtual_endpoint(member)
                            .and_then(|vep| vep.link_for_session(id))
                            .and_then(|name| names.link(name))
                            .map_or(Reach::Unknown, |link| Reach::Remote(Arc::clone(link))),
                    },
                    _ => Reach::Unknown,
                }
            };

            let b2b = match reach {
                Reach::Unknown => {
                    warn!(member = %member, session_id = id, "Multipoint member unreachable");
                    continue;
                }
                Reach::Local => None,
                Reach::Remote(link) => {
                    let req = AttachSessionRequest {
                        session_port: port,
                        src: joiner.to_string(),
                        session_host: host.to_string(),
                        dest: member.clone(),
                        src_b2b: link.unique_name().to_string(),
                        remote_controller: link.remote_controller_name(),
                        session_id: id,
                        bus_addr: String::new(),
                        opts,
                    };
                    match link.call(DaemonCall::AttachSession(req)).await {
                        Ok(DaemonReply::AttachSession(reply))
                            if reply.code.is_success() && reply.session_id == id => {}
                        Ok(other) => {
                            warn!(member = %member, reply = ?other, "Multipoint attach refused");
                            continue;
                        }
                        Err(e) => {
                            warn!(member = %member, error = %e, "Multipoint attach failed");
                            continue;
                        }
                    }
                    Some(link.unique_name().to_string())
                }
            };

            let mut l = self.lock();
            if let Err(e) = l.names.add_session_route(joiner, id, member, b2b.as_deref(), None) {
                warn!(member = %member, error = %e, "Route to multipoint member failed");
                continue;
            }
            if let Err(e) = l.names.add_session_route(member, id, joiner, None, None) {
                warn!(member = %member, error = %e, "Route from multipoint member failed");
                l.names.remove_session_route(joiner, id, member);
                continue;
            }
            l.state.sessions.add_member(id, member, joiner);
        }
    }

    /// Wait until `name` is reachable through the link `link_name`.
    ///
    /// Returns the unique name `name` resolves to, or `None` when the link
    /// goes away or the join timeout passes.
    async fn wait_reachable(&self, name: &str, link_name: &str) -> Option<String> {
        let deadline = Instant::now() + self.config.join_route_timeout;
        loop {
            {
                let names = self.read_names();
                names.link(link_name)?;
                if let Some(resolved) = names.resolve(name) {
                    if names
                        .virtual_endpoint(resolved)
                        .is_some_and(|vep| vep.can_use_route(link_name))
                    {
                        return Some(resolved.to_string());
                    }
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            sleep(self.config.route_poll_interval).await;
        }
    }

    /// A call arrived over `link_name`.
    pub(crate) async fn handle_call(&self, link_name: &str, call: DaemonCall) -> DaemonReply {
        match call {
            DaemonCall::AttachSession(req) => {
                let (Some(bus), false) = (self.arc(), self.shutdown.is_cancelled()) else {
                    return refused(&DaemonCall::AttachSession(req));
                };
                let opts = req.opts;
                let cancel = self.shutdown.clone();
                let link = link_name.to_string();
                let handle = self.tasks.spawn(async move {
                    tokio::select! {
                        reply = bus.attach_session(&link, req) => reply,
                        () = cancel.cancelled() => AttachSessionReply::failed(ReplyCode::Failed, opts),
                    }
                });
                let reply = handle.await.unwrap_or_else(|e| {
                    warn!(error = %e, "Attach task failed");
                    AttachSessionReply::failed(ReplyCode::Failed, opts)
                });
                DaemonReply::AttachSession(reply)
            }
            DaemonCall::GetSessionInfo(req) => {
                let (code, bus_addrs) = self
                    .session_info(&req.creator, req.session_port, req.opts, Some(link_name))
                    .await;
                DaemonReply::GetSessionInfo(GetSessionInfoReply { code, bus_addrs })
            }
        }
    }

    async fn attach_session(&self, link_name: &str, req: AttachSessionRequest) -> AttachSessionReply {
        let dest_local = {
            let mut names = self.write_names();
            if is_legal_unique_name(&req.src)
                && !self.guid.owns(&req.src)
                && names.link(&req.src_b2b).is_some()
            {
                names.add_virtual(&req.src, &req.src_b2b);
            }
            names
                .resolve(&req.dest)
                .is_some_and(|n| names.kind(n) == Some(EndpointKind::Client))
        };
        let reply = if dest_local {
            self.attach_local(&req).await
        } else {
            self.attach_forward(&req).await
        };
        info!(
            link = %link_name,
            src = %req.src,
            dest = %req.dest,
            port = req.session_port,
            code = ?reply.code,
            session_id = reply.session_id,
            "AttachSession"
        );
        reply
    }

    /// Find what the attach joins, checking the joiner may join it.
    fn attach_target(&self, req: &AttachSessionRequest) -> Result<AttachTarget, ReplyCode> {
        let l = self.lock();
        let names = &l.names;
        let sessions = &l.state.sessions;
        let dest = names.resolve(&req.dest).ok_or(ReplyCode::NoSession)?.to_string();
        let host = names
            .resolve(&req.session_host)
            .ok_or(ReplyCode::NoSession)?
            .to_string();
        if !names.is_virtual(&req.src) || names.link(&req.src_b2b).is_none() {
            warn!(src = %req.src, link = %req.src_b2b, "Attach from unknown joiner");
            return Err(ReplyCode::Failed);
        }

        if dest != host {
            // Another member of a multipoint session.
            let entry = sessions
                .get(&dest, req.session_id)
                .filter(|e| req.session_id != 0 && e.session_port == req.session_port)
                .filter(|e| e.session_host == host && e.opts.is_multipoint)
                .ok_or(ReplyCode::NoSession)?;
            if entry.members.iter().any(|m| *m == req.src) {
                return Err(ReplyCode::AlreadyJoined);
            }
            return Ok(AttachTarget {
                dest,
                id: entry.id,
                opts: entry.opts,
                creator: None,
                existing: true,
            });
        }

        let placeholder = sessions
            .placeholder(&dest, req.session_port)
            .ok_or(ReplyCode::NoSession)?;
        let offered = placeholder.opts;
        let live = sessions
            .live_hosted(&dest, req.session_port)
            .next()
            .map(|e| (e.id, e.members.iter().any(|m| *m == req.src)));
        let (id, existing) = match live {
            Some((_, true)) => return Err(ReplyCode::AlreadyJoined),
            Some((id, false)) if offered.is_multipoint => (id, true),
            Some(_) => return Err(ReplyCode::Failed),
            None => (new_session_id(&l.state), false),
        };
        if !offered.is_compatible(&req.opts) {
            return Err(ReplyCode::BadSessionOpts);
        }
        let creator = names.client(&dest).ok_or(ReplyCode::NoSession)?;
        Ok(AttachTarget {
            dest,
            id,
            opts: offered,
            creator: Some(creator),
            existing,
        })
    }

    /// Attach `req.src` to a session of a client of this daemon.
    async fn attach_local(&self, req: &AttachSessionRequest) -> AttachSessionReply {
        let target = match self.attach_target(req) {
            Ok(target) => target,
            Err(code) => return AttachSessionReply::failed(code, req.opts),
        };
        let AttachTarget {
            dest,
            id,
            opts,
            creator,
            existing,
        } = target;

        if let Some(creator) = &creator {
            match creator.accept_session(req.session_port, id, &req.src, &opts).await {
                Ok(true) => {}
                Ok(false) => return AttachSessionReply::failed(ReplyCode::Rejected, req.opts),
                Err(e) => {
                    warn!(creator = %dest, error = %e, "Accept round trip failed");
                    return AttachSessionReply::failed(ReplyCode::Failed, req.opts);
                }
            }
        }

        let (members, stream_link) = {
            let mut l = self.lock();
            if !l.names.contains(&dest) || !l.names.is_virtual(&req.src) {
                return AttachSessionReply::failed(ReplyCode::Failed, req.opts);
            }
            if !is_raw(&opts) {
                if let Err(e) = l.names.add_session_route(&dest, id, &req.src, Some(&req.src_b2b), None) {
                    warn!(error = %e, "Session route to remote joiner failed");
                    return AttachSessionReply::failed(ReplyCode::Failed, req.opts);
                }
                if let Err(e) = l.names.add_session_route(&req.src, id, &dest, None, None) {
                    warn!(error = %e, "Session route from remote joiner failed");
                    l.names.remove_session_route(&dest, id, &req.src);
                    return AttachSessionReply::failed(ReplyCode::Failed, req.opts);
                }
            }

            let sessions = &mut l.state.sessions;
            let stream_link = (is_raw(&opts) && !existing).then(|| req.src_b2b.clone());
            if !existing {
                let taken = sessions.id_in_use(id)
                    || (!opts.is_multipoint
                        && sessions.live_hosted(&dest, req.session_port).next().is_some());
                let entry = sessions
                    .placeholder(&dest, req.session_port)
                    .filter(|_| !taken)
                    .map(|p| p.copy_for(&dest));
                let Some(mut entry) = entry else {
                    l.names.remove_session_routes(&req.src, id);
                    return AttachSessionReply::failed(ReplyCode::Failed, req.opts);
                };
                entry.id = id;
                entry.streaming_link = stream_link.clone();
                sessions.insert(entry);
            }
            (sessions.add_member(id, &req.src, &dest), stream_link)
        };

        if let Some(stream_link) = stream_link {
            self.collect_stream(&stream_link, &dest, id).await;
        }

        AttachSessionReply {
            code: ReplyCode::Success,
            session_id: id,
            opts,
            members,
        }
    }

    /// Take over the byte stream of `stream_link` as the raw stream of `owner`'s session.
    ///
    /// The answer to the attach still reaches the joiner: the link only
    /// closes once both ends have detached.
    async fn collect_stream(&self, stream_link: &str, owner: &str, id: SessionId) {
        let link = self.read_names().link(stream_link).cloned();
        let Some(link) = link else {
            warn!(link = %stream_link, "Streaming link vanished");
            return;
        };
        match link.detach_stream().await {
            Ok(stream) => {
                let mut l = self.lock();
                match l.state.sessions.get_mut(owner, id) {
                    Some(entry) => {
                        entry.fd = Some(stream);
                        entry.streaming_link = None;
                    }
                    None => {
                        let _ = stream.shutdown();
                    }
                }
            }
            Err(e) => warn!(link = %stream_link, error = %e, "Failed to detach session stream"),
        }
    }

    /// Pass an attach on towards a destination on another daemon.
    async fn attach_forward(&self, req: &AttachSessionRequest) -> AttachSessionReply {
        let failed = |code| AttachSessionReply::failed(code, req.opts);
        let known = {
            let names = self.read_names();
            if req.session_id != 0 && req.bus_addr.is_empty() {
                names
                    .resolve(&req.dest)
                    .and_then(|n| names.virtual_endpoint(n))
                    .and_then(|vep| vep.link_for_session(req.session_id))
                    .and_then(|name| names.link(name))
                    .cloned()
            } else {
                None
            }
        };
        let link = match known {
            Some(link) => link,
            None if !req.bus_addr.is_empty() => {
                let Some(transport) = self.transports.for_address(&req.bus_addr) else {
                    return failed(ReplyCode::NoSession);
                };
                match transport.connect(&req.bus_addr).await {
                    Ok(link) => link,
                    Err(e) => {
                        warn!(bus_addr = %req.bus_addr, error = %e, "Connect for forwarded attach failed");
                        return failed(ReplyCode::ConnectFailed);
                    }
                }
            }
            None => return failed(ReplyCode::NoSession),
        };

        let link_name = link.unique_name().to_string();
        if !self.write_names().add_link_ref(&link_name) {
            return failed(ReplyCode::Failed);
        }
        let reply = self.forward_over(req, &link).await;
        self.write_names().release_link_ref(&link_name);
        reply
    }

    async fn forward_over(&self, req: &AttachSessionRequest, link: &Arc<dyn BusLink>) -> AttachSessionReply {
        let failed = |code| AttachSessionReply::failed(code, req.opts);
        let link_name = link.unique_name().to_string();
        let forward = AttachSessionRequest {
            src_b2b: link_name.clone(),
            remote_controller: link.remote_controller_name(),
            ..req.clone()
        };
        debug!(dest = %req.dest, link = %link_name, "Forwarding AttachSession");
        let reply = match link.call(DaemonCall::AttachSession(forward)).await {
            Ok(DaemonReply::AttachSession(reply)) => reply,
            Ok(other) => {
                warn!(reply = ?other, "Unexpected reply to forwarded AttachSession");
                return failed(ReplyCode::Failed);
            }
            Err(e) => {
                warn!(link = %link_name, error = %e, "Forwarded AttachSession failed");
                return failed(ReplyCode::Failed);
            }
        };
        if !reply.code.is_success() || is_raw(&reply.opts) {
            return reply;
        }

        let Some(dest) = self.wait_reachable(&req.dest, &link_name).await else {
            warn!(dest = %req.dest, "Attach destination never became reachable");
            return failed(ReplyCode::Failed);
        };
        let id = reply.session_id;
        let mut l = self.lock();
        if !l.names.is_virtual(&req.src) {
            return failed(ReplyCode::Failed);
        }
        if let Err(e) = l.names.add_session_route(&dest, id, &req.src, Some(&req.src_b2b), None) {
            warn!(error = %e, "Forward route to joiner failed");
            return failed(ReplyCode::Failed);
        }
        if let Err(e) = l.names.add_session_route(&req.src, id, &dest, Some(&link_name), None) {
            warn!(error = %e, "Forward route to destination failed");
            l.names.remove_session_route(&dest, id, &req.src);
            return failed(ReplyCode::Failed);
        }
        reply
    }
}

#[cfg(test)]
mod tests {
    use crate::Bus;
    use async_trait::async_trait;
    use meshbus_protocol::{Message, ReplyCode, SessionId, SessionOpts, SessionPort};
    use meshbus_transport::{ChannelClient, ClientConnection, Sink, TransportError};
    use std::io::{Read, Write};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    fn client(bus: &Bus) -> Arc<ChannelClient> {
        let (client, _rx) = ChannelClient::new(bus.new_unique_name());
        bus.register_client(client.clone()).unwrap();
        client
    }

    /// Creator that leaves its session while being asked about a joiner.
    struct LeavingHost {
        name: String,
        bus: Bus,
        leave: AtomicBool,
    }

    impl Sink for LeavingHost {
        fn push(&self, _msg: Message) -> Result<(), TransportError> {
            Ok(())
        }
    }

    #[async_trait]
    impl ClientConnection for LeavingHost {
        fn unique_name(&self) -> &str {
            &self.name
        }

        async fn accept_session(
            &self,
            _port: SessionPort,
            session_id: SessionId,
            _joiner: &str,
            _opts: &SessionOpts,
        ) -> Result<bool, TransportError> {
            if self.leave.load(Ordering::Relaxed) {
                assert_eq!(self.bus.leave_session(&self.name, session_id), ReplyCode::Success);
            }
            Ok(true)
        }
    }

    #[tokio::test]
    async fn test_point_to_point_join() {
        let bus = Bus::builder().build().unwrap();
        let host = client(&bus);
        let first = client(&bus);
        let second = client(&bus);
        bus.bind_session_port(host.unique_name(), 42, SessionOpts::messages());

        let (code, id, opts) = bus
            .join_session(first.unique_name(), host.unique_name(), 42, SessionOpts::messages())
            .await;
        assert_eq!(code, ReplyCode::Success);
        assert_ne!(id, 0);
        assert_eq!(opts, SessionOpts::messages());

        let hosted = bus.session(host.unique_name(), id).unwrap();
        assert_eq!(hosted.members, vec![first.unique_name().to_string()]);
        assert_eq!(bus.session(first.unique_name(), id).unwrap().host, host.unique_name());

        let (code, _, _) = bus
            .join_session(first.unique_name(), host.unique_name(), 42, SessionOpts::messages())
            .await;
        assert_eq!(code, ReplyCode::AlreadyJoined);
        let (code, _, _) = bus
            .join_session(second.unique_name(), host.unique_name(), 42, SessionOpts::messages())
            .await;
        assert_eq!(code, ReplyCode::Failed);
    }

    #[tokio::test]
    async fn test_join_refusals() {
        let bus = Bus::builder().build().unwrap();
        let host = client(&bus);
        let joiner = client(&bus);
        bus.bind_session_port(host.unique_name(), 42, SessionOpts::messages());

        let (j, h) = (joiner.unique_name(), host.unique_name());
        let (code, _, _) = bus.join_session(j, h, 43, SessionOpts::messages()).await;
        assert_eq!(code, ReplyCode::NoSession);
        let (code, _, _) = bus.join_session(j, h, 42, SessionOpts::raw_reliable()).await;
        assert_eq!(code, ReplyCode::BadSessionOpts);

        host.set_accept_sessions(false);
        let (code, _, _) = bus.join_session(j, h, 42, SessionOpts::messages()).await;
        assert_eq!(code, ReplyCode::Rejected);
        assert_eq!(bus.stats().sessions, 0);

        let (code, _, _) = bus
            .join_session(":nobody.9", host.unique_name(), 42, SessionOpts::messages())
            .await;
        assert_eq!(code, ReplyCode::Failed);
    }

    #[tokio::test]
    async fn test_multipoint_join_shares_the_session() {
        let bus = Bus::builder().build().unwrap();
        let host = client(&bus);
        let a = client(&bus);
        let b = client(&bus);
        bus.bind_session_port(host.unique_name(), 9, SessionOpts::multipoint());

        let (code, id_a, _) = bus
            .join_session(a.unique_name(), host.unique_name(), 9, SessionOpts::multipoint())
            .await;
        assert_eq!(code, ReplyCode::Success);
        let (code, id_b, _) = bus
            .join_session(b.unique_name(), host.unique_name(), 9, SessionOpts::multipoint())
            .await;
        assert_eq!(code, ReplyCode::Success);
        assert_eq!(id_a, id_b);

        let expected = vec![a.unique_name().to_string(), b.unique_name().to_string()];
        assert_eq!(bus.session(host.unique_name(), id_a).unwrap().members, expected);
        assert_eq!(bus.session(a.unique_name(), id_a).unwrap().members, expected);
        assert_eq!(bus.session(b.unique_name(), id_a).unwrap().members, expected);
    }

    #[tokio::test]
    async fn test_creator_leaving_during_accept_leaves_no_routes() {
        let bus = Bus::builder().build().unwrap();
        let host = Arc::new(LeavingHost {
            name: bus.new_unique_name(),
            bus: bus.clone(),
            leave: AtomicBool::new(false),
        });
        bus.register_client(host.clone()).unwrap();
        let first = client(&bus);
        let second = client(&bus);
        bus.bind_session_port(&host.name, 9, SessionOpts::multipoint());

        let (code, id, _) = bus
            .join_session(first.unique_name(), &host.name, 9, SessionOpts::multipoint())
            .await;
        assert_eq!(code, ReplyCode::Success);
        assert_eq!(bus.stats().session_routes, 2);

        host.leave.store(true, Ordering::Relaxed);
        let (code, _, _) = bus
            .join_session(second.unique_name(), &host.name, 9, SessionOpts::multipoint())
            .await;
        assert_eq!(code, ReplyCode::Failed);
        assert!(bus.session(second.unique_name(), id).is_none());
        assert!(bus.session(first.unique_name(), id).is_none());

        let stats = bus.stats();
        assert_eq!(stats.sessions, 0);
        assert_eq!(stats.session_routes, 0);
        assert_eq!(stats.bindings, 1);
    }

    #[tokio::test]
    async fn test_raw_session_hands_over_streams() {
        let bus = Bus::builder().build().unwrap();
        let host = client(&bus);
        let joiner = client(&bus);
        bus.bind_session_port(host.unique_name(), 7, SessionOpts::raw_reliable());

        let (code, id, _) = bus
            .join_session(joiner.unique_name(), host.unique_name(), 7, SessionOpts::raw_reliable())
            .await;
        assert_eq!(code, ReplyCode::Success);
        assert_eq!(bus.stats().session_routes, 0);

        let (code, host_end) = bus.get_session_fd(host.unique_name(), id).await;
        assert_eq!(code, ReplyCode::Success);
        let (code, joiner_end) = bus.get_session_fd(joiner.unique_name(), id).await;
        assert_eq!(code, ReplyCode::Success);

        let (mut host_end, mut joiner_end) = (host_end.unwrap(), joiner_end.unwrap());
        joiner_end.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        host_end.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");

        assert!(bus.session(host.unique_name(), id).is_none());
        assert_eq!(
            bus.get_session_fd(host.unique_name(), id).await.0,
            ReplyCode::NoSession
        );
    }

    #[tokio::test]
    async fn test_message_session_has_no_stream() {
        let bus = Bus::builder().build().unwrap();
        let host = client(&bus);
        let joiner = client(&bus);
        bus.bind_session_port(host.unique_name(), 42, SessionOpts::messages());
        let (_, id, _) = bus
            .join_session(joiner.unique_name(), host.unique_name(), 42, SessionOpts::messages())
            .await;
        let (code, fd) = bus.get_session_fd(joiner.unique_name(), id).await;
        assert_eq!(code, ReplyCode::BadSessionOpts);
        assert!(fd.is_none());
    }
}
