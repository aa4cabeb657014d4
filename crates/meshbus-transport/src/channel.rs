//! Channel-backed client connection.
//!
//! Used by embedders that host applications in-process and by tests. Every
//! message pushed to the client lands on an unbounded receiver.

use crate::traits::{ClientConnection, Sink, TransportError};
use async_trait::async_trait;
use meshbus_protocol::{Message, SessionId, SessionOpts, SessionPort};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::trace;

/// A client whose inbound messages go to an mpsc channel.
pub struct ChannelClient {
    name: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    accept_sessions: AtomicBool,
    remote_messages: bool,
}

impl ChannelClient {
    /// Create a client named `name` and the receiver of its messages.
    #[must_use]
    pub fn new(name: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        Self::with_remote_messages(name, true)
    }

    /// Like [`ChannelClient::new`], choosing whether messages from other daemons are accepted.
    #[must_use]
    pub fn with_remote_messages(
        name: impl Into<String>,
        remote_messages: bool,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            name: name.into(),
            tx: Mutex::new(Some(tx)),
            accept_sessions: AtomicBool::new(true),
            remote_messages,
        });
        (client, rx)
    }

    /// Answer future session offers with `accept`.
    pub fn set_accept_sessions(&self, accept: bool) {
        self.accept_sessions.store(accept, Ordering::Relaxed);
    }

    /// Drop the sending side. Further pushes fail with [`TransportError::Closing`].
    pub fn close(&self) {
        self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner).take();
    }
}

impl Sink for ChannelClient {
    fn push(&self, msg: Message) -> Result<(), TransportError> {
        let guard = self.tx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        let tx = guard.as_ref().ok_or(TransportError::Closing)?;
        trace!(client = %self.name, serial = msg.serial, "Queueing message");
        tx.send(msg).map_err(|_| TransportError::Closing)
    }
}

#[async_trait]
impl ClientConnection for ChannelClient {
    fn unique_name(&self) -> &str {
        &self.name
    }

    fn allows_remote_messages(&self) -> bool {
        self.remote_messages
    }

    async fn accept_session(
        &self,
        port: SessionPort,
        session_id: SessionId,
        joiner: &str,
        _opts: &SessionOpts,
    ) -> Result<bool, TransportError> {
        let accept = self.accept_sessions.load(Ordering::Relaxed);
        trace!(client = %self.name, port, session_id, joiner, accept, "Session offer");
        Ok(accept)
    }
}
