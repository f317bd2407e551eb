//! Request/response correlation for HYPER clients.
//!
//! Every call gets a request token and a pending entry holding the channel
//! its caller waits on. Responses resolve the entry with the same token; a
//! periodic sweep resolves entries nobody answered with a sentinel (`None`
//! for segments, `-1` for file sizes). Responses with no entry are counted
//! and dropped, since a late answer after a timeout is expected.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::{HyperConfig, Role};
use crate::error::{HyperError, Result};
use crate::hyper::buffer_pool::{BufferPool, PooledBuf};
use crate::hyper::client::{ClientEvents, ClientSession};
use crate::hyper::protocol::{FILE_CHECK_LENGTH, FILE_NOT_FOUND};

// =============================================================================
// Correlation table
// =============================================================================

enum Waiter {
    Segment(oneshot::Sender<Option<PooledBuf>>),
    FileSize(oneshot::Sender<i64>),
}

impl Waiter {
    fn wants(&self) -> &'static str {
        match self {
            Waiter::Segment(_) => "segment",
            Waiter::FileSize(_) => "file size",
        }
    }

    /// Resolve with the "nothing arrived" value.
    fn resolve_sentinel(self) {
        match self {
            Waiter::Segment(tx) => {
                let _ = tx.send(None);
            }
            Waiter::FileSize(tx) => {
                let _ = tx.send(FILE_NOT_FOUND);
            }
        }
    }
}

struct PendingCall {
    created: Instant,
    waiter: Waiter,
}

/// Token-keyed table of outstanding calls.
pub struct Correlator {
    pending: DashMap<u32, PendingCall>,
    next_token: AtomicU32,
    missed: AtomicU64,
    mismatched: AtomicU64,
    timed_out: AtomicU64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl Correlator {
    fn starting_at(first_token: u32) -> Self {
        Self {
            pending: DashMap::new(),
            next_token: AtomicU32::new(first_token),
            missed: AtomicU64::new(0),
            mismatched: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
        }
    }

    /// Insert `waiter` under the next token not already outstanding.
    fn register(&self, waiter: Waiter) -> u32 {
        let call = PendingCall {
            created: Instant::now(),
            waiter,
        };
        loop {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            match self.pending.entry(token) {
                Entry::Vacant(slot) => {
                    slot.insert(call);
                    return token;
                }
                // Wrapped around onto a call that is still waiting.
                Entry::Occupied(_) => continue,
            }
        }
    }

    pub(crate) fn register_segment(&self) -> (u32, oneshot::Receiver<Option<PooledBuf>>) {
        let (tx, rx) = oneshot::channel();
        (self.register(Waiter::Segment(tx)), rx)
    }

    pub(crate) fn register_file_check(&self) -> (u32, oneshot::Receiver<i64>) {
        let (tx, rx) = oneshot::channel();
        (self.register(Waiter::FileSize(tx)), rx)
    }

    /// Drop a call whose request never went out.
    pub(crate) fn forget(&self, token: u32) {
        self.pending.remove(&token);
    }

    /// Resolve every call older than its timeout with its sentinel.
    /// Returns how many calls were evicted.
    pub fn sweep(
        &self,
        now: Instant,
        segment_timeout: Duration,
        file_check_timeout: Duration,
    ) -> usize {
        let stale: Vec<u32> = self
            .pending
            .iter()
            .filter(|entry| {
                let limit = match entry.waiter {
                    Waiter::Segment(_) => segment_timeout,
                    Waiter::FileSize(_) => file_check_timeout,
                };
                now.saturating_duration_since(entry.created) > limit
            })
            .map(|entry| *entry.key())
            .collect();

        let mut evicted = 0;
        for token in stale {
            if let Some((_, call)) = self.pending.remove(&token) {
                debug!(token, wants = call.waiter.wants(), "pending call timed out");
                call.waiter.resolve_sentinel();
                evicted += 1;
            }
        }
        self.timed_out.fetch_add(evicted as u64, Ordering::Relaxed);
        evicted
    }

    /// Outstanding calls.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Responses that arrived with no outstanding call.
    pub fn missed_responses(&self) -> u64 {
        self.missed.load(Ordering::Relaxed)
    }

    /// Responses whose call was waiting for the other kind of answer.
    pub fn mismatched_responses(&self) -> u64 {
        self.mismatched.load(Ordering::Relaxed)
    }

    pub fn timed_out(&self) -> u64 {
        self.timed_out.load(Ordering::Relaxed)
    }

    fn take(&self, token: u32, kind: &'static str) -> Option<Waiter> {
        match self.pending.remove(&token) {
            Some((_, call)) => Some(call.waiter),
            None => {
                let missed = self.missed.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(token, kind, missed, "response for no pending call");
                None
            }
        }
    }

    fn mismatch(&self, token: u32, got: &'static str, waiter: Waiter) {
        self.mismatched.fetch_add(1, Ordering::Relaxed);
        warn!(token, got, wanted = waiter.wants(), "response kind does not match pending call");
        waiter.resolve_sentinel();
    }
}

impl ClientEvents for Correlator {
    fn on_segment(&self, token: u32, data: PooledBuf) {
        match self.take(token, "segment") {
            Some(Waiter::Segment(tx)) => {
                let _ = tx.send(Some(data));
            }
            Some(other) => self.mismatch(token, "segment", other),
            None => {}
        }
    }

    fn on_file_found(&self, token: u32, size: i64) {
        match self.take(token, "file size") {
            Some(Waiter::FileSize(tx)) => {
                let _ = tx.send(size);
            }
            Some(other) => self.mismatch(token, "file size", other),
            None => {}
        }
    }

    fn on_error(&self, role: Role, error: &HyperError) {
        debug!(?role, "client leg error: {}", error);
    }
}

// =============================================================================
// Download manager
// =============================================================================

/// Client entry point: owns the sessions and answers segment and file-size
/// calls addressed as `"{host:port}{remote path}"`.
pub struct DownloadManager {
    config: HyperConfig,
    pool: Arc<BufferPool>,
    correlator: Arc<Correlator>,
    sessions: RwLock<Vec<Arc<ClientSession>>>,
    sweeper: JoinHandle<()>,
}

impl DownloadManager {
    /// Must be called inside a tokio runtime.
    pub fn new(config: HyperConfig) -> Self {
        let pool = BufferPool::new(config.segment_buffer_size, config.pooled_buffers);
        Self::with_pool(config, pool)
    }

    pub fn with_pool(config: HyperConfig, pool: Arc<BufferPool>) -> Self {
        let correlator = Arc::new(Correlator::default());
        let sweeper = tokio::spawn(run_sweeper(Arc::downgrade(&correlator), config.clone()));
        Self {
            config,
            pool,
            correlator,
            sessions: RwLock::new(Vec::new()),
            sweeper,
        }
    }

    /// Open a session to `address` unless one exists already.
    pub fn add_session(&self, address: &str) -> Arc<ClientSession> {
        if let Some(existing) = self.session(address) {
            return existing;
        }
        let session = Arc::new(self.new_session(address));
        session.connect();
        self.insert_session(session.clone());
        session
    }

    /// A session wired to this manager's correlation table, not yet
    /// connected.
    pub fn new_session(&self, address: &str) -> ClientSession {
        let events: Arc<dyn ClientEvents> = self.correlator.clone();
        ClientSession::new(address, self.config.clone(), self.pool.clone(), events)
    }

    pub fn insert_session(&self, session: Arc<ClientSession>) {
        info!(address = session.address(), "session added");
        self.sessions.write().push(session);
    }

    pub fn remove_session(&self, address: &str) -> bool {
        let mut sessions = self.sessions.write();
        let before = sessions.len();
        sessions.retain(|s| s.address() != address);
        before != sessions.len()
    }

    pub fn session(&self, address: &str) -> Option<Arc<ClientSession>> {
        self.sessions
            .read()
            .iter()
            .find(|s| s.address() == address)
            .cloned()
    }

    /// Split `path` into the session serving it and the path to send.
    pub fn route<'a>(&self, path: &'a str) -> Option<(Arc<ClientSession>, &'a str)> {
        self.sessions.read().iter().find_map(|s| {
            let rest = path.strip_prefix(s.address())?;
            if rest.starts_with('/') {
                Some((s.clone(), rest))
            } else {
                None
            }
        })
    }

    /// Fetch `length` bytes at `offset`. `None` means no answer arrived in
    /// time.
    pub async fn download_segment(
        &self,
        path: &str,
        offset: i64,
        length: i32,
    ) -> Result<Option<PooledBuf>> {
        if length < 0 {
            return Err(HyperError::malformed("Request", "negative segment length"));
        }
        let (session, remote) = self
            .route(path)
            .ok_or_else(|| HyperError::NoSession(path.to_string()))?;

        let (token, rx) = self.correlator.register_segment();
        if let Err(e) = session.request_segment(remote, offset, length, token) {
            self.correlator.forget(token);
            return Err(e);
        }
        Ok(rx.await.unwrap_or(None))
    }

    /// Size of the file at `path`, `-1` if missing or unanswered. Waits for
    /// the session to become active before asking.
    pub async fn get_file_size(&self, path: &str) -> Result<i64> {
        let (session, remote) = self
            .route(path)
            .ok_or_else(|| HyperError::NoSession(path.to_string()))?;
        session.wait_active().await;

        let (token, rx) = self.correlator.register_file_check();
        if let Err(e) = session.request_segment(remote, 0, FILE_CHECK_LENGTH, token) {
            self.correlator.forget(token);
            return Err(e);
        }
        Ok(rx.await.unwrap_or(FILE_NOT_FOUND))
    }

    /// Evict timed-out calls now.
    pub fn sweep(&self) -> usize {
        self.correlator.sweep(
            Instant::now(),
            self.config.segment_timeout(),
            self.config.file_check_timeout(),
        )
    }

    pub fn correlator(&self) -> &Arc<Correlator> {
        &self.correlator
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn pending(&self) -> usize {
        self.correlator.pending()
    }

    pub fn missed_responses(&self) -> u64 {
        self.correlator.missed_responses()
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

async fn run_sweeper(correlator: Weak<Correlator>, config: HyperConfig) {
    let mut ticker = tokio::time::interval(config.sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let correlator = match correlator.upgrade() {
            Some(correlator) => correlator,
            None => break,
        };
        let evicted = correlator.sweep(
            Instant::now(),
            config.segment_timeout(),
            config.file_check_timeout(),
        );
        if evicted > 0 {
            debug!(evicted, pending = correlator.pending(), "timeout sweep");
        }
    }
}
