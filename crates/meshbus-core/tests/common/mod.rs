//! Helpers for tests running several daemons on one in-process mesh.

#![allow(dead_code)]

use async_trait::async_trait;
use meshbus_core::{Bus, BusConfig};
use meshbus_protocol::{
    AttachSessionReply, Body, DaemonCall, DaemonReply, GetSessionInfoReply, Guid, Message,
    NameEntry, ReplyCode, SessionId, TransportMask,
};
use meshbus_transport::{
    BusLink, ChannelClient, DaemonHandler, MemoryHub, MemoryTransport, Transport,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

pub const WAIT: Duration = Duration::from_secs(5);

/// A daemon listening at `mem:<name>`.
pub fn daemon(hub: &Arc<MemoryHub>, name: &str) -> Bus {
    daemon_with(MemoryTransport::new(hub, name))
}

pub fn daemon_with(transport: MemoryTransport) -> Bus {
    Bus::builder()
        .transport(Arc::new(transport))
        .build()
        .expect("bus should start")
}

/// A daemon at `mem:<name>` giving up on unreachable session hosts after `join_timeout`.
pub fn impatient_daemon(hub: &Arc<MemoryHub>, name: &str, join_timeout: Duration) -> Bus {
    Bus::builder()
        .config(BusConfig {
            join_route_timeout: join_timeout,
            ..BusConfig::default()
        })
        .transport(Arc::new(MemoryTransport::new(hub, name)))
        .build()
        .expect("bus should start")
}

pub fn address(name: &str) -> String {
    format!("{}{name}", meshbus_transport::memory::ADDRESS_PREFIX)
}

/// Register a new client on `bus`.
pub fn client(bus: &Bus) -> (Arc<ChannelClient>, UnboundedReceiver<Message>) {
    let (client, rx) = ChannelClient::new(bus.new_unique_name());
    bus.register_client(client.clone()).expect("client should register");
    (client, rx)
}

/// Poll `check` until it holds, failing the test after [`WAIT`].
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next message on `rx` accepted by `wanted`, skipping the others.
pub async fn next_matching(
    rx: &mut UnboundedReceiver<Message>,
    wanted: impl Fn(&Message) -> bool,
) -> Message {
    let found = tokio::time::timeout(WAIT, async {
        loop {
            match rx.recv().await {
                Some(msg) if wanted(&msg) => return msg,
                Some(_) => continue,
                None => panic!("client channel closed"),
            }
        }
    })
    .await;
    found.expect("timed out waiting for message")
}

/// A stand-in daemon that never forwards anything.
///
/// It records every message reaching it, sends `names` to each daemon that
/// links up with it, and answers attaches with the session id set through
/// [`StubDaemon::answer_attach_with`] (rejecting them while that is zero).
pub struct StubDaemon {
    guid: Guid,
    next: AtomicU32,
    names: Mutex<Vec<NameEntry>>,
    attach_id: AtomicU32,
    delivered: Mutex<Vec<(String, Message)>>,
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl StubDaemon {
    /// Start a stub listening at `mem:<name>`.
    pub fn start(hub: &Arc<MemoryHub>, name: &str) -> (Arc<Self>, MemoryTransport) {
        let stub = Arc::new(Self {
            guid: Guid::new_random(),
            next: AtomicU32::new(2),
            names: Mutex::new(Vec::new()),
            attach_id: AtomicU32::new(0),
            delivered: Mutex::new(Vec::new()),
        });
        let transport = MemoryTransport::new(hub, name);
        transport.start(stub.clone()).expect("stub should listen");
        (stub, transport)
    }

    pub fn controller_name(&self) -> String {
        self.guid.controller_name()
    }

    /// Unique name `:<short-guid>.<n>` owned by this stub.
    pub fn unique_name(&self, n: u32) -> String {
        format!(":{}.{n}", self.guid.short_string())
    }

    /// Names sent to daemons linking up from now on.
    pub fn publish(&self, entry: NameEntry) {
        lock(&self.names).push(entry);
    }

    pub fn answer_attach_with(&self, id: SessionId) {
        self.attach_id.store(id, Ordering::Relaxed);
    }

    /// Messages received over `link_name`, in arrival order.
    pub fn delivered_over(&self, link_name: &str) -> Vec<Message> {
        lock(&self.delivered)
            .iter()
            .filter(|(link, _)| link == link_name)
            .map(|(_, msg)| msg.clone())
            .collect()
    }

    pub fn delivered(&self) -> Vec<Message> {
        lock(&self.delivered).iter().map(|(_, msg)| msg.clone()).collect()
    }
}

#[async_trait]
impl DaemonHandler for StubDaemon {
    fn guid(&self) -> Guid {
        self.guid
    }

    fn allocate_unique_name(&self) -> String {
        self.unique_name(self.next.fetch_add(1, Ordering::Relaxed) + 100)
    }

    fn link_established(&self, link: Arc<dyn BusLink>) {
        let names = lock(&self.names).clone();
        if !names.is_empty() {
            let _ = link.push(Message::exchange_names(self.controller_name(), names));
        }
    }

    fn link_lost(&self, _link_name: &str) {}

    fn deliver(&self, link_name: &str, msg: Message) {
        lock(&self.delivered).push((link_name.to_string(), msg));
    }

    async fn handle_call(&self, _link_name: &str, call: DaemonCall) -> DaemonReply {
        match call {
            DaemonCall::AttachSession(req) => {
                let id = self.attach_id.load(Ordering::Relaxed);
                if id == 0 {
                    return DaemonReply::AttachSession(AttachSessionReply::failed(ReplyCode::Rejected, req.opts));
                }
                DaemonReply::AttachSession(AttachSessionReply {
                    code: ReplyCode::Success,
                    session_id: id,
                    opts: req.opts,
                    members: vec![req.src],
                })
            }
            DaemonCall::GetSessionInfo(_) => DaemonReply::GetSessionInfo(GetSessionInfoReply {
                code: ReplyCode::NoSession,
                bus_addrs: Vec::new(),
            }),
        }
    }

    fn found_names(
        &self,
        _bus_addr: &str,
        _guid: &Guid,
        _mask: TransportMask,
        _names: Option<Vec<String>>,
        _ttl: u8,
    ) {
    }

    fn bus_connection_lost(&self, _bus_addr: &str) {}
}

/// Whether a daemon signal carries `name`, as a unique name or an alias.
pub fn mentions(msg: &Message, name: &str) -> bool {
    match &msg.body {
        Body::ExchangeNames { names } => names
            .iter()
            .any(|e| e.unique_name == name || e.aliases.iter().any(|a| a == name)),
        Body::NameChanged { alias, old_owner, new_owner } => {
            alias == name || old_owner == name || new_owner == name
        }
        _ => false,
    }
}
