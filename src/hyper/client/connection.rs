//! One control or transfer leg of a client session.
//!
//! A leg dials the session's server, sizes its receive buffer by role, and
//! writes a [`Handshake`] before anything else. Control legs then drain the
//! session's request queue; both roles report responses through the
//! session's [`ClientEvents`](super::ClientEvents).

use std::sync::{Arc, Weak};
use tokio::net::{lookup_host, TcpSocket};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::config::Role;
use crate::error::{HyperError, Result};
use crate::hyper::client::session::ClientShared;
use crate::hyper::connection::{run_link, ConnectionStatus, Link, LinkHandler, Outbound};
use crate::hyper::protocol::{Handshake, Message};

pub struct ClientConnection {
    id: u64,
    role: Role,
    pub(crate) link: Link,
    session: Weak<ClientShared>,
}

impl ClientConnection {
    pub(crate) fn new(id: u64, role: Role, session: Weak<ClientShared>) -> Arc<Self> {
        Arc::new(Self {
            id,
            role,
            link: Link::new(ConnectionStatus::Disconnected),
            session,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn status(&self) -> ConnectionStatus {
        self.link.status()
    }

    /// Time of the last status change.
    pub fn since(&self) -> Instant {
        self.link.since()
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn request_flush(&self) {
        self.link.request_flush();
    }

    /// Dial the server in the background, replacing any running attempt.
    pub(crate) fn start(self: &Arc<Self>) {
        self.link.set_status(ConnectionStatus::Connecting);
        let conn = self.clone();
        let handle = tokio::spawn(async move { conn.run().await });
        self.link.attach_task(handle);
    }

    pub(crate) fn stop(&self) {
        self.link.abort();
        self.link.set_status(ConnectionStatus::Disconnected);
    }

    async fn run(self: Arc<Self>) {
        let shared = match self.session.upgrade() {
            Some(shared) => shared,
            None => return,
        };

        let res = self.connect_and_serve(&shared).await;
        self.link.set_status(ConnectionStatus::Disconnected);
        shared.status_changed();

        match res {
            Ok(()) => debug!(id = self.id, role = ?self.role, "server closed connection"),
            Err(e) => {
                warn!(id = self.id, role = ?self.role, address = %shared.address(), "connection failed: {}", e);
                shared.events().on_error(self.role, &e);
            }
        }
    }

    async fn connect_and_serve(&self, shared: &Arc<ClientShared>) -> Result<()> {
        let addr = lookup_host(shared.address())
            .await?
            .next()
            .ok_or_else(|| HyperError::NoSession(shared.address().to_string()))?;

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        let rcvbuf = shared.config().receive_buffer(self.role);
        if let Err(e) = socket.set_recv_buffer_size(rcvbuf) {
            debug!(id = self.id, "could not set receive buffer to {}: {}", rcvbuf, e);
        }

        let stream = socket.connect(addr).await?;
        stream.set_nodelay(true)?;

        self.link.set_status(ConnectionStatus::Connected);
        debug!(id = self.id, role = ?self.role, %addr, token = shared.token(), "connected");
        shared.status_changed();
        if self.role.is_control() {
            // Requests queued while no control leg was up.
            self.link.request_flush();
        }

        let handshake = Handshake {
            session_token: shared.token(),
            role: self.role,
        };
        run_link(
            stream,
            &self.link,
            self,
            shared.pool().clone(),
            shared.config().read_chunk_size,
            Some(handshake.encode()),
        )
        .await
    }

    fn shared(&self) -> Result<Arc<ClientShared>> {
        self.session.upgrade().ok_or(HyperError::Closed)
    }
}

impl LinkHandler for ClientConnection {
    fn on_message(&self, msg: Message) -> Result<()> {
        match msg {
            Message::SegmentData(seg) => {
                trace!(id = self.id, token = seg.token, len = seg.data.len(), "segment received");
                self.shared()?.events().on_segment(seg.token, seg.data);
                Ok(())
            }
            Message::FileCheckResult(res) => {
                trace!(id = self.id, token = res.token, size = res.size, "file check result");
                self.shared()?.events().on_file_found(res.token, res.size);
                Ok(())
            }
            other => Err(HyperError::UnexpectedMessage(other.kind().name())),
        }
    }

    fn next_outbound(&self) -> Option<Outbound> {
        if !self.role.is_control() {
            return None;
        }
        self.session
            .upgrade()?
            .pop_request()
            .map(Outbound::Frame)
    }

    fn has_outbound(&self) -> bool {
        self.role.is_control()
            && self
                .session
                .upgrade()
                .map_or(false, |shared| shared.has_requests())
    }
}
