//! A free list of fixed-capacity scratch buffers, shared across
//! connections to keep steady-state allocation near zero.
//!
//! Borrowing returns an RAII handle; dropping it returns the buffer to the
//! pool with its length reset to zero, so a borrower that forgets to clear
//! sensitive data can't leak it to the next borrower through a stale tail.

use std::sync::{Arc, Mutex};

/// Default scratch size used by the tunnel's plain copy loops and by
/// Replacing Readers whose `old`/`new` pair easily fits inside it.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Clone)]
pub struct BufferPool {
    capacity: usize,
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Borrows a buffer of `self.capacity()` bytes, all zeroed, reusing a
    /// freed one if available.
    pub fn acquire(&self) -> PooledBuffer {
        let mut buf = self
            .free
            .lock()
            .expect("buffer pool mutex poisoned")
            .pop()
            .unwrap_or_default();
        buf.clear();
        buf.resize(self.capacity, 0);
        PooledBuffer {
            buf: Some(buf),
            free: self.free.clone(),
        }
    }
}

/// An RAII-owned scratch buffer. Exactly one task holds this between
/// `acquire` and drop.
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    free: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.buf.as_deref().expect("buffer taken")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().expect("buffer taken")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.free
                .lock()
                .expect("buffer pool mutex poisoned")
                .push(buf);
        }
    }
}
