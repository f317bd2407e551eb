//! HYPER server: accepts connections and sorts them into sessions.
//!
//! A fresh connection is held as "unknown" until its handshake names a
//! session token and a role. The handshake moves it into the session for
//! that token, creating the session on first sight. A session is removed
//! once its last connection closes.

pub mod connection;
pub mod session;

pub use connection::ServerConnection;
pub use session::ServerSession;

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::HyperConfig;
use crate::error::Result;
use crate::hyper::buffer_pool::BufferPool;
use crate::hyper::connection::{run_link, ConnectionStatus};
use crate::hyper::protocol::Handshake;
use crate::storage::StorageResolver;

/// Pause after a failed accept, so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(250);

pub(crate) struct ServerShared {
    config: HyperConfig,
    pool: Arc<BufferPool>,
    resolver: Arc<dyn StorageResolver>,
    sessions: DashMap<i64, Arc<ServerSession>>,
    unknown: DashMap<u64, Arc<ServerConnection>>,
    next_id: AtomicU64,
}

impl ServerShared {
    fn accept(self: &Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(%peer, "set_nodelay failed: {}", e);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let conn = ServerConnection::new(id, peer, Arc::downgrade(self));
        self.unknown.insert(id, conn.clone());
        debug!(id, %peer, "connection accepted");

        let shared = self.clone();
        let task_conn = conn.clone();
        let handle = tokio::spawn(async move {
            let conn = task_conn;
            let res = run_link(
                stream,
                &conn.link,
                &*conn,
                shared.pool.clone(),
                shared.config.read_chunk_size,
                None,
            )
            .await;
            match res {
                Ok(()) => debug!(id = conn.id(), "peer closed connection"),
                Err(e) => warn!(id = conn.id(), peer = %conn.peer(), "connection failed: {}", e),
            }
            conn.link.set_status(ConnectionStatus::Disconnected);
            shared.on_closed(&conn);
        });
        conn.link.attach_task(handle);
    }

    pub(crate) fn on_handshake(&self, conn: Arc<ServerConnection>, hs: Handshake) {
        self.unknown.remove(&conn.id());

        // Attach while holding the entry: `on_closed` removes a session only
        // through the same shard lock, and only when it is empty.
        let session = self
            .sessions
            .entry(hs.session_token)
            .or_insert_with(|| {
                ServerSession::new(hs.session_token, &self.config, self.resolver.clone())
            });
        session.attach(hs.role, conn);
    }

    fn on_closed(&self, conn: &Arc<ServerConnection>) {
        let session = match conn.session() {
            Some(session) => session,
            None => {
                self.unknown.remove(&conn.id());
                return;
            }
        };

        session.detach(conn.id());
        let token = session.token();
        if self
            .sessions
            .remove_if(&token, |_, s| Arc::ptr_eq(s, &session) && s.is_empty())
            .is_some()
        {
            info!(token, "session closed");
        }
    }

    fn shutdown(&self) {
        for entry in self.unknown.iter() {
            entry.value().link.abort();
        }
        self.unknown.clear();
        for entry in self.sessions.iter() {
            for conn in entry.value().connections() {
                conn.link.abort();
            }
        }
        self.sessions.clear();
    }
}

/// A listening HYPER server. Dropping it stops accepting and closes every
/// connection.
pub struct HyperServer {
    shared: Arc<ServerShared>,
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl HyperServer {
    /// Bind `addr` and start accepting. `pool` should be the pool the
    /// storages behind `resolver` read into.
    pub async fn bind(
        addr: impl ToSocketAddrs,
        config: HyperConfig,
        pool: Arc<BufferPool>,
        resolver: Arc<dyn StorageResolver>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "HYPER server listening");

        let shared = Arc::new(ServerShared {
            config,
            pool,
            resolver,
            sessions: DashMap::new(),
            unknown: DashMap::new(),
            next_id: AtomicU64::new(1),
        });

        let accept_task = tokio::spawn(accept_loop(listener, shared.clone()));

        Ok(Self {
            shared,
            local_addr,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn session_count(&self) -> usize {
        self.shared.sessions.len()
    }

    /// Connections still waiting for their handshake.
    pub fn unknown_count(&self) -> usize {
        self.shared.unknown.len()
    }

    pub fn session(&self, token: i64) -> Option<Arc<ServerSession>> {
        self.shared.sessions.get(&token).map(|s| s.value().clone())
    }

    pub fn sessions(&self) -> Vec<Arc<ServerSession>> {
        self.shared
            .sessions
            .iter()
            .map(|s| s.value().clone())
            .collect()
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.shared.pool
    }

    /// Stop accepting and close all connections.
    pub fn shutdown(&self) {
        self.accept_task.abort();
        self.shared.shutdown();
    }
}

impl Drop for HyperServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => shared.accept(stream, peer),
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
