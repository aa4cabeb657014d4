//! In-process mesh transport.
//!
//! Several daemons living in one process register with a shared
//! [`MemoryHub`] under `mem:<name>` addresses. Links between them are pairs
//! of channel-backed halves: messages pushed on one half are encoded with
//! the wire codec and decoded by a receiver task on the other side, so each
//! daemon sees messages in the order they were pushed and never re-enters
//! itself from inside `push`. Daemon calls travel on the same channel,
//! which keeps a call ordered behind the signals pushed before it.
//!
//! Advertisements are delivered to every other daemon on the hub.

use crate::traits::{BusLink, DaemonHandler, RawStream, Sink, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use meshbus_protocol::{
    codec, transport, DaemonCall, DaemonReply, Guid, Message, SessionOpts, TransportMask,
};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Address prefix understood by the memory transport.
pub const ADDRESS_PREFIX: &str = "mem:";

/// TTL announced with advertisements (255 = never expires).
pub const DEFAULT_ADVERTISE_TTL: u8 = 255;

enum LinkItem {
    Frame(Bytes),
    Call(DaemonCall, oneshot::Sender<DaemonReply>),
}

struct LinkShared {
    closed: CancellationToken,
    detached: AtomicU8,
}

/// One half of an in-process link.
pub struct MemoryLink {
    name: String,
    remote_guid: Guid,
    peer: mpsc::UnboundedSender<LinkItem>,
    shared: Arc<LinkShared>,
    stream: Mutex<Option<RawStream>>,
    hub: Weak<MemoryHub>,
    key: (String, String),
}

impl MemoryLink {
    fn close_link(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        debug!(link = %self.name, "Closing memory link");
        self.shared.closed.cancel();
        if let Some(hub) = self.hub.upgrade() {
            hub.remove_link(&self.key);
        }
    }
}

impl Sink for MemoryLink {
    fn push(&self, msg: Message) -> Result<(), TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closing);
        }
        let frame = codec::encode(&msg)?;
        trace!(link = %self.name, bytes = frame.len(), "Pushing frame");
        self.peer
            .send(LinkItem::Frame(frame))
            .map_err(|_| TransportError::Closing)
    }
}

#[async_trait]
impl BusLink for MemoryLink {
    fn unique_name(&self) -> &str {
        &self.name
    }

    fn remote_guid(&self) -> Guid {
        self.remote_guid
    }

    fn is_closing(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    async fn call(&self, call: DaemonCall) -> Result<DaemonReply, TransportError> {
        if self.shared.closed.is_cancelled() {
            return Err(TransportError::Closing);
        }
        let (tx, rx) = oneshot::channel();
        self.peer
            .send(LinkItem::Call(call, tx))
            .map_err(|_| TransportError::Closing)?;

        tokio::select! {
            reply = rx => reply.map_err(|_| TransportError::CallFailed("link dropped the call".into())),
            () = self.shared.closed.cancelled() => Err(TransportError::Closing),
        }
    }

    async fn detach_stream(&self) -> Result<RawStream, TransportError> {
        let stream = lock(&self.stream)
            .take()
            .ok_or(TransportError::Unsupported("stream already detached"))?;

        // The link goes away once both ends own their stream.
        if self.shared.detached.fetch_add(1, Ordering::AcqRel) + 1 >= 2 {
            self.close_link();
        }
        Ok(stream)
    }

    fn close(&self) {
        self.close_link();
    }
}

struct LinkPair {
    first: Arc<MemoryLink>,
    second: Arc<MemoryLink>,
}

impl LinkPair {
    fn half_for(&self, address: &str) -> Arc<MemoryLink> {
        if self.first.key.0 == address {
            Arc::clone(&self.first)
        } else {
            Arc::clone(&self.second)
        }
    }
}

struct HubDaemon {
    guid: Guid,
    mask: TransportMask,
    ttl: u8,
    handler: Arc<dyn DaemonHandler>,
    advertised: BTreeSet<String>,
    discovering: BTreeSet<String>,
}

#[derive(Default)]
struct HubState {
    daemons: HashMap<String, HubDaemon>,
    links: HashMap<(String, String), LinkPair>,
}

/// Registry shared by every daemon of one in-process mesh.
#[derive(Default)]
pub struct MemoryHub {
    state: Mutex<HubState>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn link_key(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl MemoryHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Addresses of the registered daemons.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        let mut addrs: Vec<_> = lock(&self.state).daemons.keys().cloned().collect();
        addrs.sort();
        addrs
    }

    /// Number of open links.
    #[must_use]
    pub fn link_count(&self) -> usize {
        lock(&self.state).links.len()
    }

    /// Cut the link between the daemons at `a` and `b`, as a failing network
    /// would. Both ends see the link as lost. Returns whether a link existed.
    pub fn disconnect(&self, a: &str, b: &str) -> bool {
        let half = lock(&self.state)
            .links
            .get(&link_key(a, b))
            .map(|pair| Arc::clone(&pair.first));
        match half {
            Some(half) => {
                half.close_link();
                true
            }
            None => false,
        }
    }

    fn remove_link(&self, key: &(String, String)) {
        lock(&self.state).links.remove(&link_key(&key.0, &key.1));
    }

    /// Handlers of every daemon except the one at `address`.
    fn others(state: &HubState, address: &str) -> Vec<Arc<dyn DaemonHandler>> {
        state
            .daemons
            .iter()
            .filter(|(addr, _)| addr.as_str() != address)
            .map(|(_, d)| Arc::clone(&d.handler))
            .collect()
    }
}

/// Memory transport of one daemon.
pub struct MemoryTransport {
    hub: Arc<MemoryHub>,
    address: String,
    mask: TransportMask,
    ttl: u8,
}

impl MemoryTransport {
    /// Create a transport listening at `mem:<name>` on `hub`.
    #[must_use]
    pub fn new(hub: &Arc<MemoryHub>, name: &str) -> Self {
        Self {
            hub: Arc::clone(hub),
            address: format!("{ADDRESS_PREFIX}{name}"),
            mask: transport::LAN,
            ttl: DEFAULT_ADVERTISE_TTL,
        }
    }

    /// Announce this transport under a different transport bit.
    #[must_use]
    pub fn with_mask(mut self, mask: TransportMask) -> Self {
        self.mask = mask;
        self
    }

    /// Announce names with a finite TTL in seconds.
    #[must_use]
    pub fn with_advertise_ttl(mut self, ttl: u8) -> Self {
        self.ttl = ttl;
        self
    }

    /// Address this transport listens at.
    #[must_use]
    pub fn address(&self) -> &str {
        &self.address
    }

    fn announce(&self, names: Vec<String>, ttl: u8) {
        let (guid, targets) = {
            let state = lock(&self.hub.state);
            let Some(me) = state.daemons.get(&self.address) else {
                return;
            };
            (me.guid, MemoryHub::others(&state, &self.address))
        };
        for handler in targets {
            handler.found_names(&self.address, &guid, self.mask, Some(names.clone()), ttl);
        }
    }
}

async fn run_receiver(
    name: String,
    handler: Arc<dyn DaemonHandler>,
    mut rx: mpsc::UnboundedReceiver<LinkItem>,
    closed: CancellationToken,
) {
    loop {
        // Frames queued before the close are still delivered.
        tokio::select! {
            biased;
            item = rx.recv() => match item {
                None => break,
                Some(LinkItem::Frame(frame)) => match codec::decode(&frame) {
                    Ok(msg) => handler.deliver(&name, msg),
                    Err(e) => warn!(link = %name, error = %e, "Dropping undecodable frame"),
                },
                Some(LinkItem::Call(call, reply_tx)) => {
                    let handler = Arc::clone(&handler);
                    let name = name.clone();
                    tokio::spawn(async move {
                        let reply = handler.handle_call(&name, call).await;
                        let _ = reply_tx.send(reply);
                    });
                }
            },
            () = closed.cancelled() => break,
        }
    }
    debug!(link = %name, "Memory link receiver stopped");
    handler.link_lost(&name);
}

#[async_trait]
impl Transport for MemoryTransport {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn mask(&self) -> TransportMask {
        self.mask
    }

    fn handles(&self, bus_addr: &str) -> bool {
        bus_addr.starts_with(ADDRESS_PREFIX)
    }

    fn start(&self, handler: Arc<dyn DaemonHandler>) -> Result<(), TransportError> {
        let mut state = lock(&self.hub.state);
        if state.daemons.contains_key(&self.address) {
            return Err(TransportError::ConnectFailed(format!(
                "{} already in use",
                self.address
            )));
        }
        state.daemons.insert(
            self.address.clone(),
            HubDaemon {
                guid: handler.guid(),
                mask: self.mask,
                ttl: self.ttl,
                handler,
                advertised: BTreeSet::new(),
                discovering: BTreeSet::new(),
            },
        );
        debug!(address = %self.address, "Memory transport listening");
        Ok(())
    }

    fn stop(&self) {
        let (links, targets) = {
            let mut state = lock(&self.hub.state);
            if state.daemons.remove(&self.address).is_none() {
                return;
            }
            let links: Vec<_> = state
                .links
                .iter()
                .filter(|(key, _)| key.0 == self.address || key.1 == self.address)
                .map(|(_, pair)| Arc::clone(&pair.first))
                .collect();
            (links, MemoryHub::others(&state, &self.address))
        };
        for link in links {
            link.close_link();
        }
        for handler in targets {
            handler.bus_connection_lost(&self.address);
        }
    }

    async fn connect(&self, bus_addr: &str) -> Result<Arc<dyn BusLink>, TransportError> {
        if bus_addr == self.address {
            return Err(TransportError::ConnectFailed("refusing to connect to self".into()));
        }

        let (local, remote, local_handler, remote_handler, local_rx, remote_rx) = {
            let mut state = lock(&self.hub.state);
            let key = link_key(&self.address, bus_addr);
            if let Some(pair) = state.links.get(&key) {
                let half = pair.half_for(&self.address);
                if !half.is_closing() {
                    return Ok(half);
                }
            }

            let local_daemon = state
                .daemons
                .get(&self.address)
                .ok_or_else(|| TransportError::ConnectFailed("transport not started".into()))?;
            let remote_daemon = state.daemons.get(bus_addr).ok_or_else(|| {
                TransportError::ConnectFailed(format!("nothing listening at {bus_addr}"))
            })?;

            let local_handler = Arc::clone(&local_daemon.handler);
            let remote_handler = Arc::clone(&remote_daemon.handler);
            let name = remote_handler.allocate_unique_name();
            let (local_stream, remote_stream) = RawStream::pair()?;
            let shared = Arc::new(LinkShared {
                closed: CancellationToken::new(),
                detached: AtomicU8::new(0),
            });
            let (to_local, local_rx) = mpsc::unbounded_channel();
            let (to_remote, remote_rx) = mpsc::unbounded_channel();

            let local = Arc::new(MemoryLink {
                name: name.clone(),
                remote_guid: remote_daemon.guid,
                peer: to_remote,
                shared: Arc::clone(&shared),
                stream: Mutex::new(Some(local_stream)),
                hub: Arc::downgrade(&self.hub),
                key: (self.address.clone(), bus_addr.to_string()),
            });
            let remote = Arc::new(MemoryLink {
                name,
                remote_guid: local_daemon.guid,
                peer: to_local,
                shared,
                stream: Mutex::new(Some(remote_stream)),
                hub: Arc::downgrade(&self.hub),
                key: (bus_addr.to_string(), self.address.clone()),
            });

            let (first, second) = if key.0 == self.address {
                (Arc::clone(&local), Arc::clone(&remote))
            } else {
                (Arc::clone(&remote), Arc::clone(&local))
            };
            state.links.insert(key, LinkPair { first, second });
            (local, remote, local_handler, remote_handler, local_rx, remote_rx)
        };

        debug!(link = %local.name, from = %self.address, to = %bus_addr, "Memory link established");

        // Both ends know the link before either receiver runs.
        remote_handler.link_established(Arc::clone(&remote) as Arc<dyn BusLink>);
        local_handler.link_established(Arc::clone(&local) as Arc<dyn BusLink>);

        tokio::spawn(run_receiver(
            remote.name.clone(),
            remote_handler,
            remote_rx,
            remote.shared.closed.clone(),
        ));
        tokio::spawn(run_receiver(
            local.name.clone(),
            local_handler,
            local_rx,
            local.shared.closed.clone(),
        ));

        Ok(local)
    }

    fn listen_addresses(&self, _opts: &SessionOpts) -> Vec<String> {
        vec![self.address.clone()]
    }

    fn enable_advertisement(&self, name: &str) {
        let ttl = {
            let mut state = lock(&self.hub.state);
            let Some(me) = state.daemons.get_mut(&self.address) else {
                return;
            };
            if !me.advertised.insert(name.to_string()) {
                return;
            }
            me.ttl
        };
        self.announce(vec![name.to_string()], ttl);
    }

    fn disable_advertisement(&self, name: &str) {
        {
            let mut state = lock(&self.hub.state);
            let Some(me) = state.daemons.get_mut(&self.address) else {
                return;
            };
            if !me.advertised.remove(name) {
                return;
            }
        }
        self.announce(vec![name.to_string()], 0);
    }

    fn enable_discovery(&self, prefix: &str) {
        let (handler, sightings) = {
            let mut state = lock(&self.hub.state);
            let Some(me) = state.daemons.get_mut(&self.address) else {
                return;
            };
            me.discovering.insert(prefix.to_string());
            let handler = Arc::clone(&me.handler);
            let sightings: Vec<_> = state
                .daemons
                .iter()
                .filter(|(addr, _)| addr.as_str() != self.address)
                .filter_map(|(addr, d)| {
                    let names: Vec<String> = d
                        .advertised
                        .iter()
                        .filter(|n| n.starts_with(prefix))
                        .cloned()
                        .collect();
                    (!names.is_empty()).then(|| (addr.clone(), d.guid, d.mask, names, d.ttl))
                })
                .collect();
            (handler, sightings)
        };
        for (addr, guid, mask, names, ttl) in sightings {
            handler.found_names(&addr, &guid, mask, Some(names), ttl);
        }
    }

    fn disable_discovery(&self, prefix: &str) {
        if let Some(me) = lock(&self.hub.state).daemons.get_mut(&self.address) {
            me.discovering.remove(prefix);
        }
    }
}
