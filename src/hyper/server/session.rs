//! Server side of one logical session.
//!
//! Groups every connection that handshook with the same session token,
//! dispatches their requests to storage and queues the results. Results are
//! shed rather than queued without bound: a push onto a full queue is
//! dropped and counted.

use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::config::{HyperConfig, Role};
use crate::hyper::buffer_pool::PooledBuf;
use crate::hyper::connection::Outbound;
use crate::hyper::protocol::{FileCheckResult, Request, FILE_NOT_FOUND};
use crate::hyper::queue::SendQueue;
use crate::hyper::server::connection::ServerConnection;
use crate::storage::{StorageResolver, Task, TaskResult, TaskSink};

pub struct ServerSession {
    token: i64,
    me: Weak<ServerSession>,
    resolver: Arc<dyn StorageResolver>,
    control: Mutex<Vec<Arc<ServerConnection>>>,
    transfer: Mutex<Vec<Arc<ServerConnection>>>,
    segments: SendQueue<Outbound>,
    file_checks: SendQueue<Outbound>,
    created: Instant,
}

impl ServerSession {
    pub(crate) fn new(
        token: i64,
        config: &HyperConfig,
        resolver: Arc<dyn StorageResolver>,
    ) -> Arc<Self> {
        debug!(token, "session created");
        Arc::new_cyclic(|me| Self {
            token,
            me: me.clone(),
            resolver,
            control: Mutex::new(Vec::new()),
            transfer: Mutex::new(Vec::new()),
            segments: SendQueue::bounded(config.segment_queue_depth),
            file_checks: SendQueue::bounded(config.file_check_queue_depth),
            created: Instant::now(),
        })
    }

    pub fn token(&self) -> i64 {
        self.token
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    // =========================================================================
    // Connections
    // =========================================================================

    fn legs(&self, role: Role) -> &Mutex<Vec<Arc<ServerConnection>>> {
        match role {
            Role::Control => &self.control,
            Role::Transfer => &self.transfer,
        }
    }

    pub(crate) fn attach(self: &Arc<Self>, role: Role, conn: Arc<ServerConnection>) {
        conn.bind(role, self);
        self.legs(role).lock().push(conn.clone());
        debug!(
            token = self.token,
            id = conn.id(),
            ?role,
            control = self.control_count(),
            transfer = self.transfer_count(),
            "connection attached"
        );
        // Responses may have queued up while the session had no leg for them.
        conn.request_flush();
    }

    /// Remove a connection. Returns whether it belonged to this session.
    pub(crate) fn detach(&self, id: u64) -> bool {
        for role in [Role::Control, Role::Transfer] {
            let mut legs = self.legs(role).lock();
            if let Some(pos) = legs.iter().position(|c| c.id() == id) {
                legs.remove(pos);
                drop(legs);
                debug!(token = self.token, id, ?role, "connection detached");
                return true;
            }
        }
        false
    }

    pub fn control_count(&self) -> usize {
        self.control.lock().len()
    }

    pub fn transfer_count(&self) -> usize {
        self.transfer.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.control.lock().is_empty() && self.transfer.lock().is_empty()
    }

    pub(crate) fn connections(&self) -> Vec<Arc<ServerConnection>> {
        let mut all = self.control.lock().clone();
        all.extend(self.transfer.lock().iter().cloned());
        all
    }

    fn flush_legs(&self, role: Role) {
        for conn in self.legs(role).lock().iter() {
            conn.request_flush();
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    /// Route a request to the storage responsible for its path.
    pub fn dispatch(&self, req: Request) {
        let mut task = Task::from_request(req);

        let storage = match self.resolver.resolve(&task.path) {
            Some(storage) => storage,
            None if task.is_file_check() => {
                debug!(token = task.token, path = %task.path, "no storage for file check");
                self.push_file_check(task.token, FILE_NOT_FOUND);
                return;
            }
            None => {
                // No wire message reports this; the client times the call out.
                error!(token = task.token, path = %task.path, "no storage for segment request");
                return;
            }
        };

        let target: Weak<dyn TaskSink> = self.me.clone();
        task.set_target(target);
        trace!(token = task.token, "dispatching to {}", storage.debug_line());
        storage.enqueue(task);
    }

    // =========================================================================
    // Outbound queues
    // =========================================================================

    /// Queue a segment response and wake the transfer legs.
    /// Returns `false` if the queue was full and the response was dropped.
    pub fn push_segment(&self, token: u32, data: PooledBuf) -> bool {
        if !self.segments.push(Outbound::Segment { token, data }) {
            warn!(
                session = self.token,
                token,
                skipped = self.segments.skipped(),
                "segment queue full, dropping response"
            );
            return false;
        }
        self.flush_legs(Role::Transfer);
        true
    }

    /// Queue a file-check response and wake every leg.
    pub fn push_file_check(&self, token: u32, size: i64) -> bool {
        let frame = FileCheckResult { token, size }.encode();
        if !self.file_checks.push(Outbound::Frame(frame)) {
            warn!(
                session = self.token,
                token,
                skipped = self.file_checks.skipped(),
                "file check queue full, dropping response"
            );
            return false;
        }
        self.flush_legs(Role::Control);
        self.flush_legs(Role::Transfer);
        true
    }

    /// Transfer legs drain both queues; control legs only file checks.
    pub(crate) fn next_outbound(&self, role: Role) -> Option<Outbound> {
        match role {
            Role::Control => self.file_checks.pop(),
            Role::Transfer => self.file_checks.pop().or_else(|| self.segments.pop()),
        }
    }

    pub(crate) fn has_outbound(&self, role: Role) -> bool {
        match role {
            Role::Control => !self.file_checks.is_empty(),
            Role::Transfer => !self.file_checks.is_empty() || !self.segments.is_empty(),
        }
    }

    /// Responses dropped on full queues.
    pub fn skipped(&self) -> u64 {
        self.segments.skipped() + self.file_checks.skipped()
    }

    pub fn skipped_segments(&self) -> u64 {
        self.segments.skipped()
    }

    pub fn skipped_file_checks(&self) -> u64 {
        self.file_checks.skipped()
    }

    pub fn queued_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn queued_file_checks(&self) -> usize {
        self.file_checks.len()
    }
}

impl TaskSink for ServerSession {
    fn task_completed(&self, token: u32, result: TaskResult) {
        match result {
            TaskResult::Segment(data) => {
                self.push_segment(token, data);
            }
            TaskResult::FileSize(size) => {
                self.push_file_check(token, size);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hyper::protocol::Message;
    use crate::storage::{Storage, StorageSet};

    /// Completes every task on the spot with `len` bytes or a fixed size.
    struct Instant42;

    impl Storage for Instant42 {
        fn enqueue(&self, task: Task) {
            if task.is_file_check() {
                task.complete(TaskResult::FileSize(42));
            } else {
                let len = task.length as usize;
                task.complete(TaskResult::Segment(PooledBuf::from_vec(vec![0xAB; len])));
            }
        }

        fn contains(&self, path: &str) -> bool {
            path.starts_with("/share/")
        }

        fn debug_line(&self) -> String {
            "Instant42".into()
        }
    }

    fn session(config: &HyperConfig) -> Arc<ServerSession> {
        let storages = StorageSet::new();
        storages.add(Arc::new(Instant42));
        ServerSession::new(7, config, Arc::new(storages))
    }

    fn leg(id: u64) -> Arc<ServerConnection> {
        ServerConnection::new(id, "127.0.0.1:1".parse().unwrap(), Weak::new())
    }

    fn frame_message(out: Outbound) -> Message {
        match out {
            Outbound::Frame(bytes) => Message::decode_frame(&bytes).unwrap().0,
            Outbound::Segment { .. } => panic!("expected a frame"),
        }
    }

    #[test]
    fn test_full_segment_queue_drops_third_response() {
        let config = HyperConfig {
            segment_queue_depth: 2,
            ..HyperConfig::default()
        };
        let session = session(&config);

        assert!(session.push_segment(1, PooledBuf::from_vec(vec![1])));
        assert!(session.push_segment(2, PooledBuf::from_vec(vec![2])));
        assert!(!session.push_segment(3, PooledBuf::from_vec(vec![3])));

        assert_eq!(session.queued_segments(), 2);
        assert_eq!(session.skipped_segments(), 1);
        assert_eq!(session.skipped(), 1);
    }

    #[test]
    fn test_unresolvable_file_check_answers_not_found() {
        let session = session(&HyperConfig::default());
        let control = leg(1);
        session.attach(Role::Control, control.clone());
        control.link.abort();

        session.dispatch(Request::file_check(9, "/elsewhere/a.bin"));

        assert_eq!(session.queued_file_checks(), 1);
        assert!(control.link.is_flushing());
        let msg = frame_message(session.next_outbound(Role::Control).unwrap());
        assert_eq!(
            msg,
            Message::FileCheckResult(FileCheckResult {
                token: 9,
                size: FILE_NOT_FOUND
            })
        );
    }

    #[test]
    fn test_unresolvable_segment_request_is_dropped() {
        let session = session(&HyperConfig::default());
        session.dispatch(Request {
            token: 3,
            path: "/elsewhere/a.bin".into(),
            offset: 0,
            length: 100,
        });
        assert_eq!(session.queued_segments(), 0);
        assert_eq!(session.queued_file_checks(), 0);
        assert_eq!(session.skipped(), 0);
    }

    #[test]
    fn test_segment_results_wake_transfer_legs_only() {
        let session = session(&HyperConfig::default());
        let control = leg(1);
        let transfer = leg(2);
        session.attach(Role::Control, control.clone());
        session.attach(Role::Transfer, transfer.clone());
        control.link.abort();
        transfer.link.abort();

        session.dispatch(Request {
            token: 4,
            path: "/share/video.avi".into(),
            offset: 0,
            length: 16,
        });

        assert_eq!(session.queued_segments(), 1);
        assert!(transfer.link.is_flushing());
        assert!(!control.link.is_flushing());
        assert!(!session.has_outbound(Role::Control));
        match session.next_outbound(Role::Transfer) {
            Some(Outbound::Segment { token, data }) => {
                assert_eq!(token, 4);
                assert_eq!(data.as_slice(), &[0xAB; 16]);
            }
            _ => panic!("expected a segment"),
        }
    }

    #[test]
    fn test_file_check_results_travel_on_any_leg() {
        let session = session(&HyperConfig::default());
        session.dispatch(Request::file_check(5, "/share/video.avi"));
        session.dispatch(Request::file_check(6, "/share/video.avi"));

        assert!(session.has_outbound(Role::Control));
        assert!(session.has_outbound(Role::Transfer));
        let first = frame_message(session.next_outbound(Role::Transfer).unwrap());
        let second = frame_message(session.next_outbound(Role::Control).unwrap());
        assert_eq!(first, Message::FileCheckResult(FileCheckResult { token: 5, size: 42 }));
        assert_eq!(second, Message::FileCheckResult(FileCheckResult { token: 6, size: 42 }));
    }

    #[test]
    fn test_attach_and_detach() {
        let session = session(&HyperConfig::default());
        let a = leg(1);
        let b = leg(2);
        session.attach(Role::Control, a.clone());
        session.attach(Role::Transfer, b.clone());
        assert_eq!(a.role(), Some(Role::Control));
        assert_eq!(b.session().map(|s| s.token()), Some(7));
        assert_eq!((session.control_count(), session.transfer_count()), (1, 1));

        assert!(session.detach(1));
        assert!(!session.detach(1));
        assert!(!session.is_empty());
        assert!(session.detach(2));
        assert!(session.is_empty());
    }
}
