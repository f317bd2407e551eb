//! Reusable segment buffers.
//!
//! One pool is created per client or server and injected into every
//! connection and storage that needs segment-sized buffers. The pool never
//! resizes: every pooled buffer has exactly `buf_size` bytes of capacity.

use parking_lot::Mutex;
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::error::{HyperError, Result};

pub struct BufferPool {
    buf_size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
    outstanding: AtomicUsize,
}

impl BufferPool {
    pub fn new(buf_size: usize, max_pooled: usize) -> Arc<Self> {
        Arc::new(BufferPool {
            buf_size,
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
            outstanding: AtomicUsize::new(0),
        })
    }

    pub fn buf_size(&self) -> usize {
        self.buf_size
    }

    /// Number of buffers handed out and not yet returned.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Number of idle buffers held for reuse.
    pub fn idle(&self) -> usize {
        self.buffers.lock().len()
    }

    /// Hand out an empty buffer able to hold `len` bytes without reallocating.
    pub fn acquire(self: &Arc<Self>, len: usize) -> Result<PooledBuf> {
        if len > self.buf_size {
            return Err(HyperError::SegmentTooLarge {
                len,
                max: self.buf_size,
            });
        }

        let data = match self.buffers.lock().pop() {
            Some(buf) => {
                trace!("reusing pooled segment buffer");
                buf
            }
            None => {
                debug!("segment pool empty: allocating {} byte buffer", self.buf_size);
                Vec::with_capacity(self.buf_size)
            }
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        Ok(PooledBuf {
            data,
            pool: Some(Arc::clone(self)),
        })
    }

    fn release(&self, mut buf: Vec<u8>) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        if buf.capacity() != self.buf_size {
            debug!("discarding resized segment buffer");
            return;
        }
        buf.clear();

        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        } else {
            trace!("segment pool full: discarding returned buffer");
        }
    }
}

/// Segment bytes, returned to their pool exactly once when dropped.
pub struct PooledBuf {
    data: Vec<u8>,
    pool: Option<Arc<BufferPool>>,
}

impl PooledBuf {
    /// Wrap bytes that do not belong to any pool.
    pub fn from_vec(data: Vec<u8>) -> Self {
        PooledBuf { data, pool: None }
    }

    pub fn empty() -> Self {
        Self::from_vec(Vec::new())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Copy the contents out, leaving the buffer to go back to its pool.
    pub fn to_vec(&self) -> Vec<u8> {
        self.data.clone()
    }

    pub(crate) fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub(crate) fn vec_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for PooledBuf {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(pool) = self.pool.take() {
            pool.release(std::mem::take(&mut self.data));
        }
    }
}

impl PartialEq for PooledBuf {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for PooledBuf {}

impl fmt::Debug for PooledBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuf")
            .field("len", &self.data.len())
            .field("pooled", &self.pool.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buffer_returns_on_drop() {
        let pool = BufferPool::new(16, 4);
        let mut buf = pool.acquire(8).unwrap();
        buf.extend_from_slice(b"abcdefgh");
        assert_eq!(pool.outstanding(), 1);
        assert_eq!(buf.as_slice(), b"abcdefgh");

        drop(buf);
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.idle(), 1);

        let reused = pool.acquire(4).unwrap();
        assert!(reused.is_empty());
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_oversized_request_rejected() {
        let pool = BufferPool::new(16, 4);
        let err = pool.acquire(17).unwrap_err();
        assert!(matches!(err, HyperError::SegmentTooLarge { len: 17, max: 16 }));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_pool_is_bounded() {
        let pool = BufferPool::new(8, 1);
        let a = pool.acquire(8).unwrap();
        let b = pool.acquire(8).unwrap();
        drop(a);
        drop(b);
        assert_eq!(pool.idle(), 1);
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_unpooled_buffer_compares_by_content() {
        let pool = BufferPool::new(8, 1);
        let mut pooled = pool.acquire(3).unwrap();
        pooled.extend_from_slice(&[1, 2, 3]);
        assert_eq!(pooled, PooledBuf::from_vec(vec![1, 2, 3]));
    }
}
