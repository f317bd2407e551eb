//! Client side of one logical session to a remote server.
//!
//! A session keeps a fixed number of control and transfer legs alive under
//! one random session token. Requests go onto a single queue that every
//! connected control leg drains; responses come back through the
//! [`ClientEvents`] given at construction.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::config::{HyperConfig, Role};
use crate::error::{HyperError, Result};
use crate::hyper::buffer_pool::BufferPool;
use crate::hyper::client::connection::ClientConnection;
use crate::hyper::client::ClientEvents;
use crate::hyper::connection::ConnectionStatus;
use crate::hyper::protocol::{Request, FILE_CHECK_LENGTH, LENGTH_FIELD_SIZE, MAX_MESSAGE_SIZE};
use crate::hyper::queue::SendQueue;

/// State shared by a session and its legs.
pub(crate) struct ClientShared {
    address: String,
    token: AtomicI64,
    config: HyperConfig,
    pool: Arc<BufferPool>,
    events: Arc<dyn ClientEvents>,
    requests: SendQueue<Bytes>,
    control: Mutex<Vec<Arc<ClientConnection>>>,
    transfer: Mutex<Vec<Arc<ClientConnection>>>,
    control_target: AtomicUsize,
    transfer_target: AtomicUsize,
    active: watch::Sender<bool>,
    next_id: AtomicU64,
}

impl ClientShared {
    pub(crate) fn address(&self) -> &str {
        &self.address
    }

    pub(crate) fn token(&self) -> i64 {
        self.token.load(Ordering::Acquire)
    }

    pub(crate) fn config(&self) -> &HyperConfig {
        &self.config
    }

    pub(crate) fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub(crate) fn events(&self) -> &Arc<dyn ClientEvents> {
        &self.events
    }

    pub(crate) fn pop_request(&self) -> Option<Bytes> {
        self.requests.pop()
    }

    pub(crate) fn has_requests(&self) -> bool {
        !self.requests.is_empty()
    }

    fn legs(&self, role: Role) -> &Mutex<Vec<Arc<ClientConnection>>> {
        match role {
            Role::Control => &self.control,
            Role::Transfer => &self.transfer,
        }
    }

    fn target(&self, role: Role) -> usize {
        match role {
            Role::Control => self.control_target.load(Ordering::Acquire),
            Role::Transfer => self.transfer_target.load(Ordering::Acquire),
        }
    }

    fn connected(&self, role: Role) -> usize {
        self.legs(role)
            .lock()
            .iter()
            .filter(|c| c.is_connected())
            .count()
    }

    /// Recompute the activity predicate and publish it if it changed.
    pub(crate) fn status_changed(&self) {
        let active = self.connected(Role::Control) > 0 && self.connected(Role::Transfer) > 0;
        let changed = self.active.send_if_modified(|current| {
            if *current == active {
                return false;
            }
            *current = active;
            true
        });
        if changed {
            info!(address = %self.address, active, "session activity changed");
        }
    }

    /// Bring each role to its target count and restart legs that have been
    /// down longer than the reconnect idle time.
    fn validate(self: &Arc<Self>) {
        let idle = self.config.reconnect_idle();

        for role in [Role::Control, Role::Transfer] {
            let desired = self.target(role);
            let mut legs = self.legs(role).lock();

            while legs.len() > desired {
                if let Some(conn) = legs.pop() {
                    debug!(id = conn.id(), ?role, "removing excess connection");
                    conn.stop();
                }
            }

            for conn in legs.iter() {
                if conn.status() == ConnectionStatus::Disconnected && conn.since().elapsed() >= idle {
                    debug!(id = conn.id(), ?role, "restarting idle connection");
                    conn.start();
                }
            }

            while legs.len() < desired {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                let conn = ClientConnection::new(id, role, Arc::downgrade(self));
                trace!(id, ?role, "starting connection");
                conn.start();
                legs.push(conn);
            }
        }

        self.status_changed();
    }

    fn stop_all(&self) {
        for role in [Role::Control, Role::Transfer] {
            for conn in self.legs(role).lock().drain(..) {
                conn.stop();
            }
        }
        self.status_changed();
    }
}

pub struct ClientSession {
    shared: Arc<ClientShared>,
    maintenance: Mutex<Option<JoinHandle<()>>>,
}

impl ClientSession {
    /// A session to `address` (`host:port`). Nothing is dialled until
    /// [`connect`](Self::connect).
    pub fn new(
        address: impl Into<String>,
        config: HyperConfig,
        pool: Arc<BufferPool>,
        events: Arc<dyn ClientEvents>,
    ) -> Self {
        let (active, _) = watch::channel(false);
        let shared = Arc::new(ClientShared {
            address: address.into(),
            token: AtomicI64::new(0),
            control_target: AtomicUsize::new(config.desired_connections(Role::Control)),
            transfer_target: AtomicUsize::new(config.desired_connections(Role::Transfer)),
            config,
            pool,
            events,
            requests: SendQueue::unbounded(),
            control: Mutex::new(Vec::new()),
            transfer: Mutex::new(Vec::new()),
            active,
            next_id: AtomicU64::new(1),
        });
        Self {
            shared,
            maintenance: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.shared.address
    }

    /// Session token, `0` before the first [`connect`](Self::connect).
    pub fn token(&self) -> i64 {
        self.shared.token()
    }

    /// Pick a fresh session token, open the legs and keep them reconciled.
    /// Must be called inside a tokio runtime.
    pub fn connect(&self) {
        self.disconnect();

        let token = rand::thread_rng().gen::<i64>();
        self.shared.token.store(token, Ordering::Release);
        info!(address = %self.shared.address, token, "connecting session");

        self.shared.validate();
        let handle = tokio::spawn(maintain(
            Arc::downgrade(&self.shared),
            self.shared.config.validate_interval(),
        ));
        *self.maintenance.lock() = Some(handle);
    }

    /// Close every leg and stop reconciling. Queued requests are kept.
    pub fn disconnect(&self) {
        if let Some(handle) = self.maintenance.lock().take() {
            handle.abort();
        }
        self.shared.stop_all();
    }

    /// Reconcile leg counts with their targets now.
    pub fn validate_connections(&self) {
        self.shared.validate();
    }

    /// Change the target leg counts and reconcile.
    pub fn set_connection_counts(&self, control: usize, transfer: usize) {
        self.shared.control_target.store(control, Ordering::Release);
        self.shared.transfer_target.store(transfer, Ordering::Release);
        self.shared.validate();
    }

    /// Queue a request and wake every connected control leg.
    /// `length` of [`FILE_CHECK_LENGTH`] asks for the file size.
    pub fn request_segment(&self, path: &str, offset: i64, length: i32, token: u32) -> Result<()> {
        let frame = Request {
            token,
            path: path.to_string(),
            offset,
            length,
        }
        .encode();
        let len = frame.len() - LENGTH_FIELD_SIZE;
        if len > MAX_MESSAGE_SIZE {
            return Err(HyperError::FrameTooLarge {
                kind: 3,
                len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        self.shared.requests.push(frame);

        let mut woken = 0;
        for conn in self.shared.control.lock().iter() {
            if conn.is_connected() {
                conn.request_flush();
                woken += 1;
            }
        }
        trace!(token, path, woken, "request queued");
        Ok(())
    }

    pub fn request_file_check(&self, path: &str, token: u32) -> Result<()> {
        self.request_segment(path, 0, FILE_CHECK_LENGTH, token)
    }

    /// At least one control and one transfer leg are connected.
    pub fn is_active(&self) -> bool {
        *self.shared.active.borrow()
    }

    /// Resolve once the session is active.
    pub async fn wait_active(&self) {
        let mut rx = self.shared.active.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|active| *active).await;
    }

    /// Watch the activity predicate.
    pub fn subscribe_active(&self) -> watch::Receiver<bool> {
        self.shared.active.subscribe()
    }

    pub fn connection_count(&self, role: Role) -> usize {
        self.shared.legs(role).lock().len()
    }

    pub fn connected_count(&self, role: Role) -> usize {
        self.shared.connected(role)
    }

    pub fn connections(&self, role: Role) -> Vec<Arc<ClientConnection>> {
        self.shared.legs(role).lock().clone()
    }

    /// Requests not yet written by any control leg.
    pub fn queued_requests(&self) -> usize {
        self.shared.requests.len()
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.disconnect();
    }
}

async fn maintain(shared: Weak<ClientShared>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match shared.upgrade() {
            Some(shared) => shared.validate(),
            None => break,
        }
    }
}
