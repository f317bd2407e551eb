//! Server side of one TCP connection.
//!
//! A connection starts out unbound: the first message must be a
//! [`Handshake`], which names the session token and the leg's role. After
//! that the connection reads requests into its session and writes whatever
//! the session has queued for its role.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::config::Role;
use crate::error::{HyperError, Result};
use crate::hyper::connection::{ConnectionStatus, Link, LinkHandler, Outbound};
use crate::hyper::protocol::{Handshake, Message};
use crate::hyper::server::session::ServerSession;
use crate::hyper::server::ServerShared;

struct Binding {
    role: Role,
    session: Weak<ServerSession>,
}

pub struct ServerConnection {
    id: u64,
    peer: SocketAddr,
    pub(crate) link: Link,
    me: Weak<ServerConnection>,
    server: Weak<ServerShared>,
    binding: Mutex<Option<Binding>>,
}

impl ServerConnection {
    pub(crate) fn new(id: u64, peer: SocketAddr, server: Weak<ServerShared>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            id,
            peer,
            link: Link::new(ConnectionStatus::Connected),
            me: me.clone(),
            server,
            binding: Mutex::new(None),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn status(&self) -> ConnectionStatus {
        self.link.status()
    }

    /// Role declared in the handshake, `None` before it arrives.
    pub fn role(&self) -> Option<Role> {
        self.binding.lock().as_ref().map(|b| b.role)
    }

    pub fn session(&self) -> Option<Arc<ServerSession>> {
        self.binding.lock().as_ref().and_then(|b| b.session.upgrade())
    }

    pub fn request_flush(&self) {
        self.link.request_flush();
    }

    pub(crate) fn bind(&self, role: Role, session: &Arc<ServerSession>) {
        *self.binding.lock() = Some(Binding {
            role,
            session: Arc::downgrade(session),
        });
    }

    /// Session and role, if the handshake has been seen.
    fn bound(&self) -> Option<(Role, Arc<ServerSession>)> {
        let binding = self.binding.lock();
        let binding = binding.as_ref()?;
        Some((binding.role, binding.session.upgrade()?))
    }

    fn on_handshake(&self, hs: Handshake) -> Result<()> {
        if self.binding.lock().is_some() {
            return Err(HyperError::UnexpectedMessage("Handshake"));
        }
        let (me, server) = match (self.me.upgrade(), self.server.upgrade()) {
            (Some(me), Some(server)) => (me, server),
            _ => return Err(HyperError::Closed),
        };
        debug!(
            id = self.id,
            peer = %self.peer,
            token = hs.session_token,
            role = ?hs.role,
            "handshake received"
        );
        server.on_handshake(me, hs);
        Ok(())
    }
}

impl LinkHandler for ServerConnection {
    fn on_message(&self, msg: Message) -> Result<()> {
        match msg {
            Message::Handshake(hs) => self.on_handshake(hs),
            Message::Request(req) => {
                let (_, session) = self
                    .bound()
                    .ok_or(HyperError::UnexpectedMessage("Request"))?;
                trace!(id = self.id, token = req.token, path = %req.path, "request");
                session.dispatch(req);
                Ok(())
            }
            other => Err(HyperError::UnexpectedMessage(other.kind().name())),
        }
    }

    fn next_outbound(&self) -> Option<Outbound> {
        let (role, session) = self.bound()?;
        session.next_outbound(role)
    }

    fn has_outbound(&self) -> bool {
        self.bound()
            .map_or(false, |(role, session)| session.has_outbound(role))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyper::protocol::{FileCheckResult, Request};

    fn unbound() -> Arc<ServerConnection> {
        ServerConnection::new(1, "127.0.0.1:9000".parse().unwrap(), Weak::new())
    }

    #[test]
    fn test_request_before_handshake_is_violation() {
        let conn = unbound();
        let err = conn
            .on_message(Message::Request(Request::file_check(1, "/a")))
            .unwrap_err();
        assert!(matches!(err, HyperError::UnexpectedMessage("Request")));
        assert!(conn.role().is_none());
        assert!(!conn.has_outbound());
        assert!(conn.next_outbound().is_none());
    }

    #[test]
    fn test_client_only_messages_are_rejected() {
        let conn = unbound();
        let err = conn
            .on_message(Message::FileCheckResult(FileCheckResult { token: 1, size: 2 }))
            .unwrap_err();
        assert!(matches!(err, HyperError::UnexpectedMessage("FileCheckResult")));
    }

    #[test]
    fn test_handshake_without_server_closes() {
        let conn = unbound();
        let err = conn
            .on_message(Message::Handshake(Handshake {
                session_token: 5,
                role: Role::Control,
            }))
            .unwrap_err();
        assert!(matches!(err, HyperError::Closed));
    }
}
