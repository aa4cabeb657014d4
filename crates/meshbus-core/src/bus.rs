//! The bus handle.
//!
//! [`Bus`] ties the name table, the session map, the discovery tables and
//! the router together. State lives behind two locks, always taken in the
//! same order: the name table first, then the session state. Neither is ever
//! held across an `.await`; work that calls back into a transport is
//! collected as [`Deferred`] operations and run once both are released.

use crate::config::BusConfig;
use crate::discovery;
use crate::endpoint::EndpointKind;
use crate::error::BusError;
use crate::name_map::{AdvertiseMap, DiscoverMap, NameMap};
use crate::policy::{AllowAll, Policy, ServiceLauncher};
use crate::registry::NameTable;
use crate::rules::MatchRule;
use crate::session_map::SessionMap;
use async_trait::async_trait;
use dashmap::DashMap;
use meshbus_protocol::names::{is_legal_bus_name, is_legal_unique_name};
use meshbus_protocol::{
    transport, DaemonCall, DaemonReply, Guid, Message, ReplyCode, SessionId, SessionOpts,
    SessionPort, TransportMask,
};
use meshbus_transport::{
    BusLink, ClientConnection, DaemonHandler, RawStream, Transport, TransportList,
};
use serde::Serialize;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak,
};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

/// State guarded by the session lock.
#[derive(Default)]
pub(crate) struct SessionState {
    pub(crate) sessions: SessionMap,
    pub(crate) advertise: AdvertiseMap,
    pub(crate) discover: DiscoverMap,
    pub(crate) name_map: NameMap,
}

/// Both locks, taken in order.
pub(crate) struct Locked<'a> {
    pub(crate) names: RwLockWriteGuard<'a, NameTable>,
    pub(crate) state: MutexGuard<'a, SessionState>,
}

/// Transport work postponed until the locks are released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Deferred {
    Advertise { name: String, mask: TransportMask },
    CancelAdvertise { name: String, mask: TransportMask },
    Discover(String),
    CancelDiscover(String),
    LocalNames { names: Vec<String>, ttl: u8 },
}

pub(crate) struct BusInner {
    pub(crate) guid: Guid,
    pub(crate) controller: String,
    pub(crate) config: BusConfig,
    pub(crate) transports: TransportList,
    pub(crate) policy: Arc<dyn Policy>,
    pub(crate) launcher: Option<Arc<dyn ServiceLauncher>>,
    names: RwLock<NameTable>,
    state: Mutex<SessionState>,
    pub(crate) rules: DashMap<String, Vec<MatchRule>>,
    next_name: Arc<AtomicU32>,
    pub(crate) reaper_wake: Arc<Notify>,
    pub(crate) tasks: TaskTracker,
    pub(crate) shutdown: CancellationToken,
    me: Weak<BusInner>,
}

impl BusInner {
    pub(crate) fn lock(&self) -> Locked<'_> {
        let names = self.names.write().unwrap_or_else(PoisonError::into_inner);
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        Locked { names, state }
    }

    pub(crate) fn read_names(&self) -> RwLockReadGuard<'_, NameTable> {
        self.names.read().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn write_names(&self) -> RwLockWriteGuard<'_, NameTable> {
        self.names.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// A strong handle on this bus, unless it is being dropped.
    pub(crate) fn arc(&self) -> Option<Arc<BusInner>> {
        self.me.upgrade()
    }

    fn allocate_unique_name(&self) -> String {
        unique_name(&self.guid, &self.next_name)
    }

    /// Run transport work collected under the locks.
    pub(crate) fn apply(&self, ops: Vec<Deferred>) {
        for op in ops {
            debug!(op = ?op, "Applying deferred transport operation");
            match op {
                Deferred::Advertise { name, mask } => {
                    for t in self.transports.matching(mask) {
                        t.enable_advertisement(&name);
                    }
                }
                Deferred::CancelAdvertise { name, mask } => {
                    for t in self.transports.matching(mask) {
                        t.disable_advertisement(&name);
                    }
                }
                Deferred::Discover(prefix) => {
                    for t in self.transports.matching(transport::ANY) {
                        t.enable_discovery(&prefix);
                    }
                }
                Deferred::CancelDiscover(prefix) => {
                    for t in self.transports.matching(transport::ANY) {
                        t.disable_discovery(&prefix);
                    }
                }
                Deferred::LocalNames { names, ttl } => {
                    self.found_names(
                        discovery::LOCAL_ADDRESS,
                        &self.guid,
                        transport::LOCAL,
                        Some(names),
                        ttl,
                    );
                }
            }
        }
    }

    fn register_client(&self, client: Arc<dyn ClientConnection>) -> Result<(), BusError> {
        if self.shutdown.is_cancelled() {
            return Err(BusError::ShuttingDown);
        }
        let name = client.unique_name().to_string();
        if !is_legal_unique_name(&name) || !self.guid.owns(&name) {
            return Err(BusError::InvalidName(name));
        }
        let mut deferred = Vec::new();
        {
            let mut l = self.lock();
            l.names.insert_client(client)?;
            self.name_owner_changed(&mut l, &name, None, Some(&name), &mut deferred);
        }
        self.apply(deferred);
        info!(endpoint = %name, "Client registered");
        Ok(())
    }

    fn unregister_client(&self, name: &str) -> bool {
        let mut deferred = Vec::new();
        {
            let mut l = self.lock();
            let Some(aliases) = l.names.remove_client(name) else {
                return false;
            };
            for alias in &aliases {
                self.name_owner_changed(&mut l, alias, Some(name), None, &mut deferred);
            }
            l.names.remove_session_routes(name, 0);
            self.name_owner_changed(&mut l, name, Some(name), None, &mut deferred);
        }
        self.apply(deferred);
        info!(endpoint = %name, "Client unregistered");
        true
    }

    fn request_name(&self, owner: &str, alias: &str) -> ReplyCode {
        if !is_legal_bus_name(alias) {
            return ReplyCode::Failed;
        }
        let mut deferred = Vec::new();
        let code = {
            let mut l = self.lock();
            if l.names.kind(owner) != Some(EndpointKind::Client) {
                return ReplyCode::Failed;
            }
            match l.names.alias_owner(alias) {
                Some(current) if current == owner => ReplyCode::Success,
                Some(_) => ReplyCode::AlreadyExists,
                None => {
                    l.names.set_alias(alias, owner);
                    self.name_owner_changed(&mut l, alias, None, Some(owner), &mut deferred);
                    ReplyCode::Success
                }
            }
        };
        self.apply(deferred);
        debug!(alias, owner, code = ?code, "Name requested");
        code
    }

    fn release_name(&self, owner: &str, alias: &str) -> ReplyCode {
        let mut deferred = Vec::new();
        {
            let mut l = self.lock();
            if l.names.alias_owner(alias) != Some(owner) {
                return ReplyCode::Failed;
            }
            l.names.remove_alias(alias);
            self.name_owner_changed(&mut l, alias, Some(owner), None, &mut deferred);
        }
        self.apply(deferred);
        debug!(alias, owner, "Name released");
        ReplyCode::Success
    }

    fn stats(&self) -> BusStats {
        let l = self.lock();
        BusStats {
            unique_names: l.names.count(EndpointKind::Client),
            virtual_endpoints: l.names.count(EndpointKind::Virtual),
            links: l.names.count(EndpointKind::BusToBus),
            session_routes: l.names.cast_count(),
            sessions: l.state.sessions.live_count(),
            bindings: l.state.sessions.binding_count(),
            advertised_names: l.state.advertise.len(),
            discovered_names: l.state.name_map.len(),
        }
    }
}

fn unique_name(guid: &Guid, counter: &AtomicU32) -> String {
    let n = counter.fetch_add(1, Ordering::Relaxed);
    format!(":{}.{}", guid.short_string(), n)
}

/// How transports reach the bus. Holds the bus weakly so a transport never
/// keeps it alive.
struct Handler {
    guid: Guid,
    next_name: Arc<AtomicU32>,
    inner: Weak<BusInner>,
}

#[async_trait]
impl DaemonHandler for Handler {
    fn guid(&self) -> Guid {
        self.guid
    }

    fn allocate_unique_name(&self) -> String {
        unique_name(&self.guid, &self.next_name)
    }

    fn link_established(&self, link: Arc<dyn BusLink>) {
        if let Some(bus) = self.inner.upgrade() {
            bus.link_established(link);
        }
    }

    fn link_lost(&self, link_name: &str) {
        if let Some(bus) = self.inner.upgrade() {
            bus.link_lost(link_name);
        }
    }

    fn deliver(&self, link_name: &str, msg: Message) {
        if let Some(bus) = self.inner.upgrade() {
            bus.deliver(link_name, msg);
        }
    }

    async fn handle_call(&self, link_name: &str, call: DaemonCall) -> DaemonReply {
        match self.inner.upgrade() {
            Some(bus) => bus.handle_call(link_name, call).await,
            None => crate::session::refused(&call),
        }
    }

    fn found_names(
        &self,
        bus_addr: &str,
        guid: &Guid,
        mask: TransportMask,
        names: Option<Vec<String>>,
        ttl: u8,
    ) {
        if let Some(bus) = self.inner.upgrade() {
            bus.found_names(bus_addr, guid, mask, names, ttl);
        }
    }

    fn bus_connection_lost(&self, bus_addr: &str) {
        if let Some(bus) = self.inner.upgrade() {
            bus.bus_connection_lost(bus_addr);
        }
    }
}

/// Counters describing the current state of a bus.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Clients attached to this daemon.
    pub unique_names: usize,
    /// Names attached to other daemons.
    pub virtual_endpoints: usize,
    /// Links to other daemons.
    pub links: usize,
    /// Installed session routes.
    pub session_routes: usize,
    /// Live session entries.
    pub sessions: usize,
    /// Bound session ports.
    pub bindings: usize,
    /// Names advertised by local clients.
    pub advertised_names: usize,
    /// Names seen on other daemons.
    pub discovered_names: usize,
}

/// A live session as seen by one of its local parties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub id: SessionId,
    /// Creator, empty once it left.
    pub host: String,
    pub port: SessionPort,
    pub opts: SessionOpts,
    pub members: Vec<String>,
}

/// Builds a [`Bus`].
#[derive(Default)]
pub struct BusBuilder {
    config: BusConfig,
    transports: TransportList,
    policy: Option<Arc<dyn Policy>>,
    launcher: Option<Arc<dyn ServiceLauncher>>,
}

impl BusBuilder {
    #[must_use]
    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Add a transport at the lowest priority.
    #[must_use]
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.add_transport(transport);
        self
    }

    #[must_use]
    pub fn policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = Some(policy);
        self
    }

    #[must_use]
    pub fn launcher(mut self, launcher: Arc<dyn ServiceLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    /// Start the transports and the name reaper.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns an error if a transport fails to start.
    pub fn build(self) -> Result<Bus, BusError> {
        let guid = self.config.guid.unwrap_or_else(Guid::new_random);
        let controller = guid.controller_name();
        info!("Creating bus {} with config: {:?}", guid, self.config);

        let next_name = Arc::new(AtomicU32::new(2));
        let policy = self.policy.unwrap_or_else(|| Arc::new(AllowAll));
        let inner = Arc::new_cyclic(|me| BusInner {
            guid,
            names: RwLock::new(NameTable::new(&controller)),
            controller,
            config: self.config,
            transports: self.transports,
            policy,
            launcher: self.launcher,
            state: Mutex::new(SessionState::default()),
            rules: DashMap::new(),
            next_name: Arc::clone(&next_name),
            reaper_wake: Arc::new(Notify::new()),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            me: me.clone(),
        });

        let handler: Arc<dyn DaemonHandler> = Arc::new(Handler {
            guid,
            next_name,
            inner: Arc::downgrade(&inner),
        });
        inner.transports.start_all(&handler)?;
        inner.tasks.spawn(discovery::run_reaper(
            Arc::downgrade(&inner),
            Arc::clone(&inner.reaper_wake),
            inner.shutdown.clone(),
        ));

        Ok(Bus { inner })
    }
}

/// Handle on a running bus. Cheap to clone.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    #[must_use]
    pub fn builder() -> BusBuilder {
        BusBuilder::default()
    }

    #[must_use]
    pub fn guid(&self) -> Guid {
        self.inner.guid
    }

    /// Unique name of the daemon's own endpoint (`:<short-guid>.1`).
    #[must_use]
    pub fn controller_name(&self) -> &str {
        &self.inner.controller
    }

    /// Hand out a fresh unique name for a client about to register.
    #[must_use]
    pub fn new_unique_name(&self) -> String {
        self.inner.allocate_unique_name()
    }

    // Clients and names

    /// Attach a client under its unique name.
    ///
    /// # Errors
    ///
    /// Fails if the name was not handed out by this bus or is already
    /// registered, and with [`BusError::ShuttingDown`] once shutdown began.
    pub fn register_client(&self, client: Arc<dyn ClientConnection>) -> Result<(), BusError> {
        self.inner.register_client(client)
    }

    /// Detach a client, releasing its names, sessions, advertisements and rules.
    pub fn unregister_client(&self, name: &str) -> bool {
        self.inner.unregister_client(name)
    }

    /// Make `owner` the primary owner of `alias`.
    pub fn request_name(&self, owner: &str, alias: &str) -> ReplyCode {
        self.inner.request_name(owner, alias)
    }

    pub fn release_name(&self, owner: &str, alias: &str) -> ReplyCode {
        self.inner.release_name(owner, alias)
    }

    // Sessions

    /// Reserve `port` for sessions hosted by `owner`. `SESSION_PORT_ANY` picks a free one.
    pub fn bind_session_port(
        &self,
        owner: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> (ReplyCode, SessionPort) {
        self.inner.bind_session_port(owner, port, opts)
    }

    pub fn unbind_session_port(&self, owner: &str, port: SessionPort) -> ReplyCode {
        self.inner.unbind_session_port(owner, port)
    }

    /// Join the session `host` offers on `port`.
    ///
    /// Runs on its own task so a slow peer never blocks the caller's
    /// connection; shutdown aborts it with `Failed`.
    pub async fn join_session(
        &self,
        joiner: &str,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> (ReplyCode, SessionId, SessionOpts) {
        if self.inner.shutdown.is_cancelled() {
            return (ReplyCode::Failed, 0, opts);
        }
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.shutdown.clone();
        let joiner = joiner.to_string();
        let host = host.to_string();
        let handle = self.inner.tasks.spawn(async move {
            tokio::select! {
                result = inner.join_session(&joiner, &host, port, opts) => result,
                () = cancel.cancelled() => {
                    debug!(joiner = %joiner, host = %host, "Join aborted by shutdown");
                    (ReplyCode::Failed, 0, opts)
                }
            }
        });
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "Join task failed");
                (ReplyCode::Failed, 0, opts)
            }
        }
    }

    pub fn leave_session(&self, owner: &str, id: SessionId) -> ReplyCode {
        self.inner.leave_session(owner, id)
    }

    /// Collect the byte stream of raw session `id`, waiting for it if needed.
    pub async fn get_session_fd(&self, owner: &str, id: SessionId) -> (ReplyCode, Option<RawStream>) {
        self.inner.get_session_fd(owner, id).await
    }

    /// Addresses the creator of `host`'s session on `port` can be reached at.
    pub async fn get_session_info(
        &self,
        host: &str,
        port: SessionPort,
        opts: SessionOpts,
    ) -> (ReplyCode, Vec<String>) {
        self.inner.session_info(host, port, opts, None).await
    }

    /// The session `id` as seen by `owner`.
    #[must_use]
    pub fn session(&self, owner: &str, id: SessionId) -> Option<SessionSnapshot> {
        let l = self.inner.lock();
        l.state.sessions.get(owner, id).map(|e| SessionSnapshot {
            id: e.id,
            host: e.session_host.clone(),
            port: e.session_port,
            opts: e.opts,
            members: e.members.clone(),
        })
    }

    // Discovery

    pub fn advertise_name(&self, owner: &str, name: &str, mask: TransportMask) -> ReplyCode {
        self.inner.advertise_name(owner, name, mask)
    }

    pub fn cancel_advertise_name(&self, owner: &str, name: &str, mask: TransportMask) -> ReplyCode {
        self.inner.cancel_advertise_name(owner, name, mask)
    }

    /// Start looking for names starting with `prefix`. Matches are reported
    /// to `owner` as `FoundAdvertisedName` signals.
    pub fn find_advertised_name(&self, owner: &str, prefix: &str) -> ReplyCode {
        self.inner.find_advertised_name(owner, prefix)
    }

    pub fn cancel_find_advertised_name(&self, owner: &str, prefix: &str) -> ReplyCode {
        self.inner.cancel_find_advertised_name(owner, prefix)
    }

    // Routing

    /// Deliver broadcasts matching `rule` to `owner`.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::NoEndpoint`] if `owner` is not registered.
    pub fn add_match(&self, owner: &str, rule: MatchRule) -> Result<(), BusError> {
        if !self.inner.read_names().contains(owner) {
            return Err(BusError::NoEndpoint(owner.to_string()));
        }
        self.inner.rules.entry(owner.to_string()).or_default().push(rule);
        Ok(())
    }

    /// Remove one rule equal to `rule`.
    pub fn remove_match(&self, owner: &str, rule: &MatchRule) -> bool {
        let Some(mut rules) = self.inner.rules.get_mut(owner) else {
            return false;
        };
        let Some(pos) = rules.iter().position(|r| r == rule) else {
            return false;
        };
        rules.remove(pos);
        true
    }

    /// Route a message sent by the endpoint `from`.
    ///
    /// # Errors
    ///
    /// Returns the first delivery failure that is not a closing endpoint.
    pub fn push_message(&self, from: &str, msg: Message) -> Result<(), BusError> {
        self.inner.route(msg, from)
    }

    // Links and lifecycle

    /// Open (or reuse) a link to the daemon at `bus_addr` and keep it open.
    ///
    /// Returns the link name.
    ///
    /// # Errors
    ///
    /// Fails if no transport handles the address or the connect fails.
    pub async fn connect(&self, bus_addr: &str) -> Result<String, BusError> {
        let transport = self
            .inner
            .transports
            .for_address(bus_addr)
            .ok_or_else(|| BusError::NoRoute(bus_addr.to_string()))?;
        let link = transport.connect(bus_addr).await?;
        let name = link.unique_name().to_string();
        if !self.inner.write_names().add_link_ref(&name) {
            return Err(BusError::NoRoute(bus_addr.to_string()));
        }
        info!(link = %name, bus_addr, "Connected");
        Ok(name)
    }

    #[must_use]
    pub fn stats(&self) -> BusStats {
        self.inner.stats()
    }

    /// Stop every in-flight join and attach, stop the transports and clear all state.
    pub async fn shutdown(&self) {
        info!(guid = %self.inner.guid, "Shutting down bus");
        self.inner.shutdown.cancel();
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
        self.inner.transports.stop_all();

        let links = {
            let mut l = self.inner.lock();
            l.state.sessions.clear();
            *l.state = SessionState::default();
            l.names.clear()
        };
        for link in links {
            link.close();
        }
        self.inner.rules.clear();
        debug!("Bus shut down");
    }

    // Introspection

    #[must_use]
    pub fn endpoint_kind(&self, name: &str) -> Option<EndpointKind> {
        let names = self.inner.read_names();
        names.resolve(name).and_then(|n| names.kind(n))
    }

    /// Unique name `name` resolves to.
    #[must_use]
    pub fn name_owner(&self, name: &str) -> Option<String> {
        self.inner.read_names().resolve(name).map(str::to_string)
    }

    #[must_use]
    pub fn link_names(&self) -> Vec<String> {
        self.inner.read_names().link_names()
    }
}
