//! Bounded pool of segment-sized, page-aligned scratch buffers.
//!
//! Segment reads and writes (flush, reorganization, recovery) all go through
//! pooled buffers so that direct-I/O alignment holds and allocation cost is
//! paid once. The pool is bounded: [`BufferPool::acquire`] blocks until a
//! buffer is returned or the pool is closed.

use std::sync::{Arc, Weak};

use parking_lot::{Condvar, Mutex};

use crate::error::{LogError, Result};
use crate::utility::AlignedBuffer;

struct PoolInner {
    buffers: Mutex<PoolState>,
    available: Condvar,
    buffer_size: usize,
    alignment: usize,
}

struct PoolState {
    free: Vec<AlignedBuffer>,
    closed: bool,
}

impl PoolInner {
    fn return_buffer(&self, buffer: AlignedBuffer) {
        let mut state = self.buffers.lock();
        state.free.push(buffer);
        drop(state);
        self.available.notify_one();
    }
}

/// A buffer checked out from the pool. Returns to the pool on drop.
///
/// Contents are whatever the previous user left behind; call
/// [`PooledBuffer::clear`] before building partial segments.
pub struct PooledBuffer {
    buffer: Option<AlignedBuffer>,
    pool: Weak<PoolInner>,
}

impl PooledBuffer {
    /// Buffer length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.as_ref().map_or(0, |b| b.size())
    }

    /// Whether the buffer is zero-sized (never true for pooled buffers).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Immutable view of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        self.buffer.as_ref().map_or(&[], |b| b.as_slice())
    }

    /// Mutable view of the buffer.
    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        self.buffer.as_mut().map_or(&mut [], |b| b.as_mut_slice())
    }

    /// Zero the buffer contents.
    pub fn clear(&mut self) {
        if let Some(buffer) = self.buffer.as_mut() {
            buffer.clear();
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let (Some(pool), Some(buffer)) = (self.pool.upgrade(), self.buffer.take()) {
            pool.return_buffer(buffer);
        }
    }
}

/// Bounded pool of page-aligned buffers, all of one size.
pub struct BufferPool {
    inner: Arc<PoolInner>,
}

impl BufferPool {
    /// Create a pool of `count` buffers of `buffer_size` bytes, aligned to
    /// `alignment`.
    pub fn new(buffer_size: usize, alignment: usize, count: usize) -> Self {
        let mut free = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(buffer) = AlignedBuffer::zeroed(alignment, buffer_size) {
                free.push(buffer);
            }
        }

        Self {
            inner: Arc::new(PoolInner {
                buffers: Mutex::new(PoolState {
                    free,
                    closed: false,
                }),
                available: Condvar::new(),
                buffer_size,
                alignment,
            }),
        }
    }

    /// Take a buffer, blocking until one is free. Fails with
    /// [`LogError::Shutdown`] once the pool is closed.
    pub fn acquire(&self) -> Result<PooledBuffer> {
        let mut state = self.inner.buffers.lock();
        loop {
            if state.closed {
                return Err(LogError::Shutdown);
            }
            if let Some(buffer) = state.free.pop() {
                return Ok(PooledBuffer {
                    buffer: Some(buffer),
                    pool: Arc::downgrade(&self.inner),
                });
            }
            self.inner.available.wait(&mut state);
        }
    }

    /// Take a buffer if one is immediately free.
    pub fn try_acquire(&self) -> Option<PooledBuffer> {
        let mut state = self.inner.buffers.lock();
        if state.closed {
            return None;
        }
        state.free.pop().map(|buffer| PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::downgrade(&self.inner),
        })
    }

    /// Number of currently free buffers.
    pub fn available(&self) -> usize {
        self.inner.buffers.lock().free.len()
    }

    /// Size of each pooled buffer.
    pub fn buffer_size(&self) -> usize {
        self.inner.buffer_size
    }

    /// Alignment of each pooled buffer.
    pub fn alignment(&self) -> usize {
        self.inner.alignment
    }

    /// Close the pool: blocked and future acquires fail with `Shutdown`.
    pub fn close(&self) {
        let mut state = self.inner.buffers.lock();
        state.closed = true;
        drop(state);
        self.inner.available.notify_all();
    }
}

impl Clone for BufferPool {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}
