use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex, PoisonError};

use crate::frame::MAX_FRAME_SIZE;

/// Pool of reusable frame buffers.
///
/// Every buffer handed out has exactly `MAX_FRAME_SIZE` bytes, so a single
/// read can never overflow it. Buffers come back through the [`PooledBuf`]
/// drop guard, which returns each buffer to the pool exactly once. The pool
/// is owned by the switch manager rather than living in a process-wide
/// static, so multiple managers can coexist in one process.
pub struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(Vec::new()),
        })
    }

    /// Take a buffer from the pool, allocating a fresh one when empty.
    pub fn acquire(self: &Arc<Self>) -> PooledBuf {
        let data = self
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; MAX_FRAME_SIZE]);
        PooledBuf {
            data: Some(data),
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers currently held by the pool.
    pub fn available(&self) -> usize {
        self.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        // Undersized buffers would corrupt later reads; drop them instead.
        if buf.capacity() >= MAX_FRAME_SIZE {
            buf.resize(MAX_FRAME_SIZE, 0);
            self.lock().push(buf);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Vec<u8>>> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A frame buffer on loan from a [`BufferPool`].
///
/// Dereferences to its byte slice; dropping it hands the buffer back.
pub struct PooledBuf {
    data: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuf {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.release(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_hands_out_full_size_buffers() {
        let pool = BufferPool::new();
        let buf = pool.acquire();
        assert_eq!(buf.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn dropped_buffers_are_recycled() {
        let pool = BufferPool::new();
        assert_eq!(pool.available(), 0);
        let buf = pool.acquire();
        drop(buf);
        assert_eq!(pool.available(), 1);
        let _buf = pool.acquire();
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn each_buffer_is_returned_exactly_once() {
        let pool = BufferPool::new();
        drop(pool.acquire());
        drop(pool.acquire());
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn undersized_buffers_are_not_pooled() {
        let pool = BufferPool::new();
        pool.release(vec![0u8; 10]);
        assert_eq!(pool.available(), 0);
        pool.release(vec![0u8; MAX_FRAME_SIZE]);
        assert_eq!(pool.available(), 1);
    }
}
