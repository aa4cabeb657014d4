//! Endpoint and transport seams.
//!
//! The broker never owns a socket. It talks to three kinds of collaborators:
//! directly attached clients ([`ClientConnection`]), links to other daemons
//! ([`BusLink`]) and the transports that create those links ([`Transport`]).
//! Transports report back through [`DaemonHandler`], which the broker implements.

use async_trait::async_trait;
use meshbus_protocol::{
    DaemonCall, DaemonReply, Guid, Message, SessionId, SessionOpts, SessionPort, TransportMask,
};
use std::io::{self, Read, Write};
use std::net::Shutdown;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The endpoint is shutting down and accepts no more traffic.
    #[error("Endpoint closing")]
    Closing,

    /// Could not reach the requested address.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to hand a message to the endpoint.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// A daemon-to-daemon call did not produce a reply.
    #[error("Call failed: {0}")]
    CallFailed(String),

    /// The operation is not available on this endpoint.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] meshbus_protocol::ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TransportError {
    /// Whether the error only means the endpoint is going away.
    #[must_use]
    pub fn is_closing(&self) -> bool {
        matches!(self, TransportError::Closing)
    }
}

/// Something messages can be pushed to.
///
/// `push` must not block: implementations queue the message and return.
pub trait Sink: Send + Sync {
    /// Queue a message for delivery.
    fn push(&self, msg: Message) -> Result<(), TransportError>;
}

/// A client attached directly to this daemon.
#[async_trait]
pub trait ClientConnection: Sink {
    /// Unique name assigned to the client.
    fn unique_name(&self) -> &str;

    /// Whether the client accepts messages that originate on other daemons.
    fn allows_remote_messages(&self) -> bool {
        true
    }

    /// Ask the client, as session creator, whether `joiner` may join.
    async fn accept_session(
        &self,
        port: SessionPort,
        session_id: SessionId,
        joiner: &str,
        opts: &SessionOpts,
    ) -> Result<bool, TransportError>;
}

/// A connection to another daemon.
#[async_trait]
pub trait BusLink: Sink {
    /// Unique name of the link. Both ends of a link use the same name.
    fn unique_name(&self) -> &str;

    /// GUID of the daemon at the other end.
    fn remote_guid(&self) -> Guid;

    /// Controller name of the daemon at the other end.
    fn remote_controller_name(&self) -> String {
        self.remote_guid().controller_name()
    }

    /// Whether the link is shutting down.
    fn is_closing(&self) -> bool;

    /// Call the daemon at the other end and wait for its answer.
    async fn call(&self, call: DaemonCall) -> Result<DaemonReply, TransportError>;

    /// Stop carrying messages and hand over the underlying byte stream.
    async fn detach_stream(&self) -> Result<RawStream, TransportError>;

    /// Close the link.
    fn close(&self);
}

/// Something that creates links to other daemons and announces names.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport name (e.g. "memory").
    fn name(&self) -> &'static str;

    /// Transport bit of this transport.
    fn mask(&self) -> TransportMask;

    /// Whether this transport understands `bus_addr`.
    fn handles(&self, bus_addr: &str) -> bool;

    /// Start accepting links and reporting to `handler`.
    fn start(&self, handler: Arc<dyn DaemonHandler>) -> Result<(), TransportError>;

    /// Stop the transport and close its links.
    fn stop(&self) {}

    /// Connect to the daemon listening at `bus_addr`.
    ///
    /// The returned link has already been reported through
    /// [`DaemonHandler::link_established`] on both ends.
    async fn connect(&self, bus_addr: &str) -> Result<Arc<dyn BusLink>, TransportError>;

    /// Addresses a joiner asking for `opts` can connect to.
    fn listen_addresses(&self, opts: &SessionOpts) -> Vec<String>;

    /// Start announcing `name`.
    fn enable_advertisement(&self, name: &str);

    /// Stop announcing `name`.
    fn disable_advertisement(&self, name: &str);

    /// Start looking for names starting with `prefix`.
    fn enable_discovery(&self, prefix: &str);

    /// Stop looking for names starting with `prefix`.
    fn disable_discovery(&self, prefix: &str);

    /// Check if the transport is healthy.
    fn is_healthy(&self) -> bool {
        true
    }
}

/// Callbacks from transports into the daemon that owns them.
#[async_trait]
pub trait DaemonHandler: Send + Sync {
    /// GUID of the daemon.
    fn guid(&self) -> Guid;

    /// Hand out a fresh unique name, used to name accepted links.
    fn allocate_unique_name(&self) -> String;

    /// A link to another daemon is up.
    fn link_established(&self, link: Arc<dyn BusLink>);

    /// The link named `link_name` is gone.
    fn link_lost(&self, link_name: &str);

    /// A message arrived over `link_name`.
    fn deliver(&self, link_name: &str, msg: Message);

    /// A call arrived over `link_name`.
    async fn handle_call(&self, link_name: &str, call: DaemonCall) -> DaemonReply;

    /// Names were seen at (or withdrawn from) `bus_addr`.
    ///
    /// `names == None` with `ttl == 0` withdraws every name from that daemon.
    fn found_names(
        &self,
        bus_addr: &str,
        guid: &Guid,
        mask: TransportMask,
        names: Option<Vec<String>>,
        ttl: u8,
    );

    /// The daemon at `bus_addr` can no longer be reached.
    fn bus_connection_lost(&self, bus_addr: &str);
}

#[cfg(unix)]
type StreamInner = std::os::unix::net::UnixStream;

#[cfg(not(unix))]
type StreamInner = std::net::TcpStream;

/// Byte stream handed to the parties of a raw session.
#[derive(Debug)]
pub struct RawStream {
    inner: StreamInner,
}

impl RawStream {
    /// Create a connected pair of streams.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system refuses the sockets.
    #[cfg(unix)]
    pub fn pair() -> io::Result<(RawStream, RawStream)> {
        let (a, b) = StreamInner::pair()?;
        Ok((RawStream { inner: a }, RawStream { inner: b }))
    }

    /// Create a connected pair of streams over loopback.
    ///
    /// # Errors
    ///
    /// Returns an error if the operating system refuses the sockets.
    #[cfg(not(unix))]
    pub fn pair() -> io::Result<(RawStream, RawStream)> {
        let listener = std::net::TcpListener::bind(("127.0.0.1", 0))?;
        let a = StreamInner::connect(listener.local_addr()?)?;
        let (b, _) = listener.accept()?;
        Ok((RawStream { inner: a }, RawStream { inner: b }))
    }

    /// Shut down both directions of the stream.
    ///
    /// # Errors
    ///
    /// Returns an error if the stream is already disconnected.
    pub fn shutdown(&self) -> io::Result<()> {
        self.inner.shutdown(Shutdown::Both)
    }

    /// Take the underlying socket.
    #[must_use]
    pub fn into_inner(self) -> StreamInner {
        self.inner
    }
}

impl Read for RawStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for RawStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
