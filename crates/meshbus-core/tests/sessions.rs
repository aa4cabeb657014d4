mod common;

use async_trait::async_trait;
use common::{
    address, client, daemon, eventually, impatient_daemon, next_matching, StubDaemon,
};
use meshbus_core::{Bus, EndpointKind};
use meshbus_protocol::{
    transport, AttachSessionRequest, Body, DaemonCall, DaemonReply, Message, NameEntry, ReplyCode,
    SessionId, SessionOpts, SessionPort,
};
use meshbus_transport::{ClientConnection, MemoryHub, Sink, Transport, TransportError};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;

fn is_found(msg: &Message, wanted: &str) -> bool {
    matches!(&msg.body, Body::FoundAdvertisedName { name, .. } if name == wanted)
}

fn payload(msg: &Message) -> Option<&[u8]> {
    match &msg.body {
        Body::Bytes { data } => Some(data),
        _ => None,
    }
}

fn is_lost(msg: &Message) -> bool {
    matches!(msg.body, Body::SessionLost { .. })
}

/// Whether a `SessionLost` is already waiting on `rx`.
fn lost_queued(rx: &mut UnboundedReceiver<Message>) -> bool {
    std::iter::from_fn(|| rx.try_recv().ok()).any(|m| is_lost(&m))
}

#[tokio::test]
async fn test_join_advertised_session_on_other_daemon() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");

    let (host, mut rx_host) = client(&beta);
    assert_eq!(beta.request_name(host.unique_name(), "org.test.Chat"), ReplyCode::Success);
    assert_eq!(beta.bind_session_port(host.unique_name(), 42, SessionOpts::messages()).0, ReplyCode::Success);
    assert_eq!(beta.advertise_name(host.unique_name(), "org.test.Chat", transport::ANY), ReplyCode::Success);

    let (joiner, mut rx_joiner) = client(&alpha);
    assert_eq!(alpha.find_advertised_name(joiner.unique_name(), "org.test"), ReplyCode::Success);
    next_matching(&mut rx_joiner, |m| is_found(m, "org.test.Chat")).await;

    let (code, id, opts) = alpha
        .join_session(joiner.unique_name(), "org.test.Chat", 42, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Success);
    assert_ne!(id, 0);
    assert_eq!(opts, SessionOpts::messages());

    let joined = alpha.session(joiner.unique_name(), id).unwrap();
    assert_eq!(joined.host, host.unique_name());
    let hosted = beta.session(host.unique_name(), id).unwrap();
    assert_eq!(hosted.members, vec![joiner.unique_name().to_string()]);
    assert_eq!(alpha.endpoint_kind(host.unique_name()), Some(EndpointKind::Virtual));

    // Traffic flows both ways over the session.
    let ping = Message::signal(joiner.unique_name(), host.unique_name(), "org.test.Chat", "Ping")
        .with_session(id)
        .with_payload(b"ping".to_vec());
    alpha.push_message(joiner.unique_name(), ping).unwrap();
    let got = next_matching(&mut rx_host, |m| m.member.as_deref() == Some("Ping")).await;
    assert_eq!(got.sender, joiner.unique_name());
    assert_eq!(payload(&got), Some(&b"ping"[..]));

    let pong = Message::signal(host.unique_name(), joiner.unique_name(), "org.test.Chat", "Pong").with_session(id);
    beta.push_message(host.unique_name(), pong).unwrap();
    next_matching(&mut rx_joiner, |m| m.member.as_deref() == Some("Pong")).await;

    // A point-to-point session takes a single joiner.
    let (second, _rx_second) = client(&alpha);
    let (code, _, _) = alpha
        .join_session(second.unique_name(), "org.test.Chat", 42, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Failed);
    assert_eq!(
        alpha
            .join_session(joiner.unique_name(), "org.test.Chat", 42, SessionOpts::messages())
            .await
            .0,
        ReplyCode::AlreadyJoined
    );
}

#[tokio::test]
async fn test_join_refusals_across_daemons() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");

    let (host, _rx_host) = client(&beta);
    beta.request_name(host.unique_name(), "org.test.Picky");
    beta.bind_session_port(host.unique_name(), 42, SessionOpts::messages());
    beta.advertise_name(host.unique_name(), "org.test.Picky", transport::ANY);
    let (joiner, _rx_joiner) = client(&alpha);

    let (code, _, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Nobody", 42, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Unreachable);

    let (code, _, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Picky", 43, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::NoSession);

    let (code, _, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Picky", 42, SessionOpts::raw_reliable())
        .await;
    assert_eq!(code, ReplyCode::BadSessionOpts);

    host.set_accept_sessions(false);
    let (code, _, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Picky", 42, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Rejected);

    // Failed joins leave no link behind.
    eventually("unused link to close", || hub.link_count() == 0).await;
    assert_eq!(beta.stats().sessions, 0);
}

#[tokio::test]
async fn test_join_through_existing_link() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");

    let (host, _rx_host) = client(&beta);
    beta.bind_session_port(host.unique_name(), 7, SessionOpts::messages());
    alpha.connect(&address("beta")).await.unwrap();
    eventually("alpha to learn the host", || {
        alpha.endpoint_kind(host.unique_name()) == Some(EndpointKind::Virtual)
    })
    .await;

    let (code, addrs) = alpha
        .get_session_info(host.unique_name(), 7, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Success);
    assert_eq!(addrs, vec![address("beta")]);

    let (joiner, _rx_joiner) = client(&alpha);
    let (code, id, _) = alpha
        .join_session(joiner.unique_name(), host.unique_name(), 7, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Success);
    assert_eq!(beta.session(host.unique_name(), id).unwrap().members.len(), 1);
    assert_eq!(hub.link_count(), 1);
}

#[tokio::test]
async fn test_leaving_remote_session_notifies_host() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");

    let (host, mut rx_host) = client(&beta);
    beta.request_name(host.unique_name(), "org.test.Leave");
    beta.bind_session_port(host.unique_name(), 5, SessionOpts::messages());
    beta.advertise_name(host.unique_name(), "org.test.Leave", transport::ANY);

    let (joiner, _rx_joiner) = client(&alpha);
    let (code, id, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Leave", 5, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Success);

    assert_eq!(alpha.leave_session(joiner.unique_name(), id), ReplyCode::Success);
    let lost = next_matching(&mut rx_host, |m| matches!(m.body, Body::SessionLost { .. })).await;
    assert_eq!(lost.body, Body::SessionLost { session_id: id });
    assert!(beta.session(host.unique_name(), id).is_none());

    // The link carried only this session.
    eventually("link to close", || hub.link_count() == 0).await;
    eventually("routes to clear", || {
        alpha.stats().session_routes == 0 && beta.stats().session_routes == 0
    })
    .await;
}

#[tokio::test]
async fn test_host_daemon_loss_ends_session() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");

    let (host, _rx_host) = client(&beta);
    beta.request_name(host.unique_name(), "org.test.Fragile");
    beta.bind_session_port(host.unique_name(), 5, SessionOpts::messages());
    beta.advertise_name(host.unique_name(), "org.test.Fragile", transport::ANY);

    let (joiner, mut rx_joiner) = client(&alpha);
    let (code, id, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Fragile", 5, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Success);

    beta.shutdown().await;
    let lost = next_matching(&mut rx_joiner, |m| matches!(m.body, Body::SessionLost { .. })).await;
    assert_eq!(lost.body, Body::SessionLost { session_id: id });
    assert!(alpha.session(joiner.unique_name(), id).is_none());
    assert_eq!(alpha.stats().session_routes, 0);
}

#[tokio::test]
async fn test_multipoint_session_spans_three_daemons() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");
    let gamma = daemon(&hub, "gamma");

    let (host, mut rx_host) = client(&beta);
    beta.request_name(host.unique_name(), "org.test.Room");
    beta.bind_session_port(host.unique_name(), 9, SessionOpts::multipoint());
    beta.advertise_name(host.unique_name(), "org.test.Room", transport::ANY);

    let (a, mut rx_a) = client(&alpha);
    let (c, mut rx_c) = client(&gamma);

    let (code, id, _) = alpha
        .join_session(a.unique_name(), "org.test.Room", 9, SessionOpts::multipoint())
        .await;
    assert_eq!(code, ReplyCode::Success);
    let (code, id_c, _) = gamma
        .join_session(c.unique_name(), "org.test.Room", 9, SessionOpts::multipoint())
        .await;
    assert_eq!(code, ReplyCode::Success);
    assert_eq!(id, id_c);

    let both = vec![a.unique_name().to_string(), c.unique_name().to_string()];
    assert_eq!(beta.session(host.unique_name(), id).unwrap().members, both);
    assert_eq!(gamma.session(c.unique_name(), id).unwrap().members, both);
    assert_eq!(alpha.session(a.unique_name(), id).unwrap().members, both);

    // An untargeted session signal reaches every other party once.
    let hello = Message::signal(c.unique_name(), "", "org.test.Room", "Hello")
        .with_session(id)
        .with_payload(b"hi all".to_vec());
    gamma.push_message(c.unique_name(), hello).unwrap();
    let at_host = next_matching(&mut rx_host, |m| m.member.as_deref() == Some("Hello")).await;
    let at_a = next_matching(&mut rx_a, |m| m.member.as_deref() == Some("Hello")).await;
    assert_eq!(payload(&at_host), Some(&b"hi all"[..]));
    assert_eq!(payload(&at_a), Some(&b"hi all"[..]));
    assert_eq!(at_a.sender, c.unique_name());

    let reply = Message::signal(a.unique_name(), "", "org.test.Room", "Welcome").with_session(id);
    alpha.push_message(a.unique_name(), reply).unwrap();
    next_matching(&mut rx_c, |m| m.member.as_deref() == Some("Welcome")).await;
    next_matching(&mut rx_host, |m| m.member.as_deref() == Some("Welcome")).await;

    // One member leaving keeps the session alive for the rest.
    assert_eq!(gamma.leave_session(c.unique_name(), id), ReplyCode::Success);
    eventually("members to shrink", || {
        beta.session(host.unique_name(), id).is_some_and(|s| s.members.len() == 1)
            && alpha.session(a.unique_name(), id).is_some_and(|s| s.members.len() == 1)
    })
    .await;
}

#[tokio::test]
async fn test_raw_session_across_daemons() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");

    let (host, _rx_host) = client(&beta);
    beta.request_name(host.unique_name(), "org.test.Pipe");
    beta.bind_session_port(host.unique_name(), 3, SessionOpts::raw_reliable());
    beta.advertise_name(host.unique_name(), "org.test.Pipe", transport::ANY);

    let (joiner, _rx_joiner) = client(&alpha);
    let (code, id, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Pipe", 3, SessionOpts::raw_reliable())
        .await;
    assert_eq!(code, ReplyCode::Success);

    let (code, joiner_end) = alpha.get_session_fd(joiner.unique_name(), id).await;
    assert_eq!(code, ReplyCode::Success);
    let (code, host_end) = beta.get_session_fd(host.unique_name(), id).await;
    assert_eq!(code, ReplyCode::Success);

    let (mut joiner_end, mut host_end) = (joiner_end.unwrap(), host_end.unwrap());
    joiner_end.write_all(b"bytes").unwrap();
    let mut buf = [0u8; 5];
    host_end.read_exact(&mut buf).unwrap();
    assert_eq!(&buf, b"bytes");

    // The link became the stream and is gone from the mesh.
    eventually("streaming link to close", || hub.link_count() == 0).await;
}

#[tokio::test]
async fn test_multipoint_session_ends_with_its_last_member() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");
    let gamma = daemon(&hub, "gamma");

    let (host, mut rx_host) = client(&beta);
    beta.request_name(host.unique_name(), "org.test.Hall");
    beta.bind_session_port(host.unique_name(), 11, SessionOpts::multipoint());
    beta.advertise_name(host.unique_name(), "org.test.Hall", transport::ANY);

    let (a, mut rx_a) = client(&alpha);
    let (c, _rx_c) = client(&gamma);
    let (code, id, _) = alpha
        .join_session(a.unique_name(), "org.test.Hall", 11, SessionOpts::multipoint())
        .await;
    assert_eq!(code, ReplyCode::Success);
    let (code, _, _) = gamma
        .join_session(c.unique_name(), "org.test.Hall", 11, SessionOpts::multipoint())
        .await;
    assert_eq!(code, ReplyCode::Success);

    assert_eq!(gamma.leave_session(c.unique_name(), id), ReplyCode::Success);
    eventually("the departure to reach both daemons", || {
        beta.session(host.unique_name(), id).is_some_and(|s| s.members == [a.unique_name()])
            && alpha.session(a.unique_name(), id).is_some_and(|s| s.members == [a.unique_name()])
    })
    .await;
    assert!(!lost_queued(&mut rx_host));
    assert!(!lost_queued(&mut rx_a));
    assert!(gamma.session(c.unique_name(), id).is_none());

    assert_eq!(alpha.leave_session(a.unique_name(), id), ReplyCode::Success);
    let lost = next_matching(&mut rx_host, is_lost).await;
    assert_eq!(lost.body, Body::SessionLost { session_id: id });
    assert!(beta.session(host.unique_name(), id).is_none());
    eventually("routes to clear everywhere", || {
        alpha.stats().session_routes == 0
            && beta.stats().session_routes == 0
            && gamma.stats().session_routes == 0
    })
    .await;
}

#[tokio::test]
async fn test_lost_link_clears_routes_while_peer_stays_reachable() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let beta = daemon(&hub, "beta");
    let gamma = daemon(&hub, "gamma");

    let (host, mut rx_host) = client(&beta);
    beta.bind_session_port(host.unique_name(), 6, SessionOpts::messages());
    let (joiner, mut rx_joiner) = client(&alpha);

    gamma.connect(&address("beta")).await.unwrap();
    eventually("gamma to learn the host", || {
        gamma.endpoint_kind(host.unique_name()) == Some(EndpointKind::Virtual)
    })
    .await;
    alpha.connect(&address("gamma")).await.unwrap();
    eventually("the host and joiner to be known through gamma", || {
        alpha.endpoint_kind(host.unique_name()) == Some(EndpointKind::Virtual)
            && beta.endpoint_kind(joiner.unique_name()) == Some(EndpointKind::Virtual)
    })
    .await;

    // The join opens a direct link between alpha and beta.
    let (code, id, _) = alpha
        .join_session(joiner.unique_name(), host.unique_name(), 6, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Success);
    assert_eq!(hub.link_count(), 3);
    assert_eq!(alpha.stats().session_routes, 2);
    assert_eq!(beta.stats().session_routes, 2);

    assert!(hub.disconnect(&address("alpha"), &address("beta")));
    let lost = next_matching(&mut rx_joiner, is_lost).await;
    assert_eq!(lost.body, Body::SessionLost { session_id: id });
    let lost = next_matching(&mut rx_host, is_lost).await;
    assert_eq!(lost.body, Body::SessionLost { session_id: id });

    eventually("routes of the lost session to clear", || {
        alpha.stats().session_routes == 0 && beta.stats().session_routes == 0
    })
    .await;
    assert_eq!(alpha.stats().sessions, 0);
    assert_eq!(beta.stats().sessions, 0);
    assert_eq!(alpha.endpoint_kind(host.unique_name()), Some(EndpointKind::Virtual));
    assert_eq!(beta.endpoint_kind(joiner.unique_name()), Some(EndpointKind::Virtual));
}

#[tokio::test]
async fn test_unreachable_host_after_attach_gets_detached() {
    let hub = MemoryHub::new();
    let alpha = impatient_daemon(&hub, "alpha", Duration::from_millis(200));
    let (stub, stub_transport) = StubDaemon::start(&hub, "ghost");
    stub.answer_attach_with(77);
    stub_transport.enable_advertisement("org.test.Ghost");

    let (joiner, _rx_joiner) = client(&alpha);
    let (code, _, _) = alpha
        .join_session(joiner.unique_name(), "org.test.Ghost", 4, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Failed);

    let detach = Body::DetachSession {
        session_id: 77,
        src: joiner.unique_name().to_string(),
    };
    eventually("the host daemon to be told to detach", || {
        stub.delivered().iter().any(|m| m.body == detach)
    })
    .await;
    assert!(alpha.session(joiner.unique_name(), 77).is_none());
    assert_eq!(alpha.stats().session_routes, 0);
}

#[tokio::test]
async fn test_attach_makes_unknown_joiner_reachable() {
    let hub = MemoryHub::new();
    let beta = daemon(&hub, "beta");
    let (host, _rx_host) = client(&beta);
    beta.bind_session_port(host.unique_name(), 4, SessionOpts::messages());

    let (stub, stub_transport) = StubDaemon::start(&hub, "stub");
    let link = stub_transport.connect(&address("beta")).await.unwrap();
    let joiner = stub.unique_name(9);
    assert_eq!(beta.endpoint_kind(&joiner), None);

    let req = AttachSessionRequest {
        session_port: 4,
        src: joiner.clone(),
        session_host: host.unique_name().to_string(),
        dest: host.unique_name().to_string(),
        src_b2b: link.unique_name().to_string(),
        remote_controller: link.remote_controller_name(),
        session_id: 0,
        bus_addr: address("beta"),
        opts: SessionOpts::messages(),
    };
    let reply = match link.call(DaemonCall::AttachSession(req)).await.unwrap() {
        DaemonReply::AttachSession(reply) => reply,
        other => panic!("unexpected reply {other:?}"),
    };
    assert_eq!(reply.code, ReplyCode::Success);
    assert_ne!(reply.session_id, 0);

    assert_eq!(beta.endpoint_kind(&joiner), Some(EndpointKind::Virtual));
    let hosted = beta.session(host.unique_name(), reply.session_id).unwrap();
    assert_eq!(hosted.members, vec![joiner]);
    assert_eq!(beta.stats().session_routes, 2);
}

/// Creator that, while asked about a joiner, lets another client join a
/// remote session carrying the very id it was offered.
struct ClashingHost {
    name: String,
    bus: Bus,
    stub: Arc<StubDaemon>,
    other: String,
    offered: AtomicU32,
}

impl Sink for ClashingHost {
    fn push(&self, _msg: Message) -> Result<(), TransportError> {
        Ok(())
    }
}

#[async_trait]
impl ClientConnection for ClashingHost {
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
        self.offered.store(session_id, Ordering::Relaxed);
        self.stub.answer_attach_with(session_id);
        let (code, id, _) = self
            .bus
            .join_session(&self.other, "org.test.Ghost", 4, SessionOpts::messages())
            .await;
        assert_eq!((code, id), (ReplyCode::Success, session_id));
        Ok(true)
    }
}

#[tokio::test]
async fn test_session_id_taken_during_accept_fails_the_join() {
    let hub = MemoryHub::new();
    let alpha = daemon(&hub, "alpha");
    let (stub, stub_transport) = StubDaemon::start(&hub, "ghost");
    let ghost = stub.unique_name(7);
    stub.publish(NameEntry::new(ghost.clone(), vec!["org.test.Ghost".to_string()]));
    stub_transport.enable_advertisement("org.test.Ghost");

    let (other, _rx_other) = client(&alpha);
    let host = Arc::new(ClashingHost {
        name: alpha.new_unique_name(),
        bus: alpha.clone(),
        stub: Arc::clone(&stub),
        other: other.unique_name().to_string(),
        offered: AtomicU32::new(0),
    });
    alpha.register_client(host.clone()).unwrap();
    alpha.bind_session_port(&host.name, 1, SessionOpts::messages());
    let (joiner, _rx_joiner) = client(&alpha);

    let (code, _, _) = alpha
        .join_session(joiner.unique_name(), &host.name, 1, SessionOpts::messages())
        .await;
    assert_eq!(code, ReplyCode::Failed);

    // Only the remote session holding the id is left.
    let id = host.offered.load(Ordering::Relaxed);
    assert!(alpha.session(&host.name, id).is_none());
    assert!(alpha.session(joiner.unique_name(), id).is_none());
    let remote = alpha.session(other.unique_name(), id).unwrap();
    assert_eq!(remote.host, ghost);
    let stats = alpha.stats();
    assert_eq!(stats.sessions, 1);
    assert_eq!(stats.session_routes, 2);
}
