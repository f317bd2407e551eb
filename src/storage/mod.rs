//! Storage collaborators for the server side.
//!
//! A server session turns each request into a [`Task`], finds the
//! [`Storage`] responsible for its path through a [`StorageResolver`], and
//! hands the task over. The storage completes the task at most once, which
//! feeds the result back into the session that asked for it.

pub mod file;

pub use file::FileStorage;

use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, Weak};
use tracing::debug;

use crate::hyper::buffer_pool::PooledBuf;
use crate::hyper::protocol::Request;

/// Outcome of a task.
#[derive(Debug, PartialEq, Eq)]
pub enum TaskResult {
    /// Bytes read for a segment request
    Segment(PooledBuf),
    /// File length for a file check, `-1` if absent
    FileSize(i64),
}

/// Receives task results. Implemented by the server session.
pub trait TaskSink: Send + Sync {
    fn task_completed(&self, token: u32, result: TaskResult);
}

/// One unit of work derived from a request.
pub struct Task {
    pub path: String,
    pub offset: i64,
    /// Bytes wanted, negative for a file check
    pub length: i32,
    pub token: u32,
    target: Option<Weak<dyn TaskSink>>,
}

impl Task {
    pub fn new(path: impl Into<String>, offset: i64, length: i32, token: u32) -> Self {
        Self {
            path: path.into(),
            offset,
            length,
            token,
            target: None,
        }
    }

    pub fn from_request(req: Request) -> Self {
        Self::new(req.path, req.offset, req.length, req.token)
    }

    pub fn is_file_check(&self) -> bool {
        self.length < 0
    }

    /// Route the result of this task to `target`.
    pub fn set_target(&mut self, target: Weak<dyn TaskSink>) {
        self.target = Some(target);
    }

    /// Deliver the result. Consumes the task, so a task completes at most once.
    pub fn complete(self, result: TaskResult) {
        match self.target.as_ref().and_then(Weak::upgrade) {
            Some(sink) => sink.task_completed(self.token, result),
            None => debug!(token = self.token, path = %self.path, "task target gone, result dropped"),
        }
    }
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("path", &self.path)
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("token", &self.token)
            .finish()
    }
}

pub trait Storage: Send + Sync {
    /// Accept a task for asynchronous processing.
    fn enqueue(&self, task: Task);

    fn contains(&self, path: &str) -> bool;

    fn debug_line(&self) -> String;
}

/// Picks the storage responsible for a path.
pub trait StorageResolver: Send + Sync {
    fn resolve(&self, path: &str) -> Option<Arc<dyn Storage>>;
}

/// Resolves to the first registered storage that contains the path.
#[derive(Default)]
pub struct StorageSet {
    storages: RwLock<Vec<Arc<dyn Storage>>>,
}

impl StorageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, storage: Arc<dyn Storage>) {
        self.storages.write().push(storage);
    }

    pub fn len(&self) -> usize {
        self.storages.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.storages.read().is_empty()
    }

    pub fn debug_lines(&self) -> Vec<String> {
        self.storages.read().iter().map(|s| s.debug_line()).collect()
    }
}

impl StorageResolver for StorageSet {
    fn resolve(&self, path: &str) -> Option<Arc<dyn Storage>> {
        self.storages
            .read()
            .iter()
            .find(|s| s.contains(path))
            .cloned()
    }
}
