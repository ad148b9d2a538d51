use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

/// A thread-safe pool of receive buffers.
///
/// Buffers are lazily allocated when the pool is empty and handed back when
/// the [`PooledBuffer`] guard drops. At most `capacity` idle buffers are kept.
#[derive(Clone)]
pub struct BufferPool {
    pool: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    /// Acquires a zeroed buffer of exactly `len` bytes.
    #[inline]
    pub fn acquire(&self, len: usize) -> PooledBuffer {
        let buffer = {
            let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            pool.pop_front()
        };

        let mut buffer = buffer.unwrap_or_default();
        buffer.clear();
        buffer.resize(len, 0);

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(&self.pool),
            capacity: self.capacity,
        }
    }

    /// Returns the number of idle buffers currently in the pool.
    pub fn available(&self) -> usize {
        self.pool
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// A guard that returns the buffer to the pool when dropped.
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    pool: Arc<Mutex<VecDeque<Vec<u8>>>>,
    capacity: usize,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &Self::Target {
        self.buffer.as_deref().unwrap_or_default()
    }
}

impl std::ops::DerefMut for PooledBuffer {
    #[inline]
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_deref_mut().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    #[inline]
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut pool = self.pool.lock().unwrap_or_else(PoisonError::into_inner);
            if pool.len() < self.capacity {
                pool.push_back(buffer);
            }
        }
    }
}
