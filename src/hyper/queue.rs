//! Outbound queues shared between a session and its connections.
//!
//! Client sessions keep one unbounded request queue drained by every control
//! leg. Server sessions keep bounded response queues that shed load: a push
//! onto a full queue drops the item and counts it, and the client's timeout
//! sweep is what recovers the lost response.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

/// FIFO with an optional depth limit and a counter of dropped pushes.
pub struct SendQueue<T> {
    items: Mutex<VecDeque<T>>,
    max_depth: Option<usize>,
    skipped: AtomicU64,
}

impl<T> SendQueue<T> {
    pub fn unbounded() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            max_depth: None,
            skipped: AtomicU64::new(0),
        }
    }

    pub fn bounded(max_depth: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::with_capacity(max_depth.min(1024))),
            max_depth: Some(max_depth),
            skipped: AtomicU64::new(0),
        }
    }

    /// Queue `item` unless the queue is full. Returns whether it was kept.
    pub fn push(&self, item: T) -> bool {
        let mut items = self.items.lock();
        if let Some(max) = self.max_depth {
            if items.len() >= max {
                drop(items);
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }
        items.push_back(item);
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    /// Items dropped because the queue was full.
    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn max_depth(&self) -> Option<usize> {
        self.max_depth
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_queue_drops_and_counts() {
        let queue = SendQueue::bounded(2);
        assert!(queue.push(1));
        assert!(queue.push(2));
        assert!(!queue.push(3));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.skipped(), 1);

        assert_eq!(queue.pop(), Some(1));
        assert!(queue.push(4));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(4));
        assert_eq!(queue.pop(), None);
        assert_eq!(queue.skipped(), 1);
    }

    #[test]
    fn test_unbounded_never_drops() {
        let queue = SendQueue::unbounded();
        for i in 0..10_000 {
            assert!(queue.push(i));
        }
        assert_eq!(queue.len(), 10_000);
        assert_eq!(queue.skipped(), 0);
        assert_eq!(queue.max_depth(), None);
    }
}
