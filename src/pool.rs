//! Bounded write-buffer pool.
//!
//! One pool backs all shards of a dataset. Buffers are drawn from size-class
//! freelists under a hard byte budget; exhaustion is signalled to the caller
//! so it can trigger eviction before retrying.

use crate::error::{MemSeriesError, Result};
use parking_lot::Mutex;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Size classes for recycled buffers. Requests above the largest class are
/// served exactly-sized and not recycled.
const SIZE_CLASSES: &[usize] = &[
    256,
    1024,
    4 * 1024,
    16 * 1024,
    64 * 1024,
    256 * 1024,
    1024 * 1024,
];

#[derive(Debug)]
struct PoolShared {
    tags: String,
    capacity: usize,
    bytes_free: AtomicUsize,
    freelists: Vec<Mutex<Vec<Box<[u8]>>>>,
}

impl PoolShared {
    fn reserve(&self, bytes: usize) -> Result<()> {
        loop {
            let free = self.bytes_free.load(Ordering::Acquire);
            if free < bytes {
                return Err(MemSeriesError::BufferPoolExhausted {
                    requested: bytes,
                    free,
                });
            }
            if self
                .bytes_free
                .compare_exchange_weak(free, free - bytes, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    fn release(&self, bytes: usize) {
        self.bytes_free.fetch_add(bytes, Ordering::AcqRel);
    }
}

/// A bounded pool of recyclable write buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<PoolShared>,
}

impl BufferPool {
    /// Creates a pool with the given byte budget. `tags` label the pool in
    /// telemetry output.
    pub fn new(capacity: usize, tags: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                tags: tags.into(),
                capacity,
                bytes_free: AtomicUsize::new(capacity),
                freelists: SIZE_CLASSES.iter().map(|_| Mutex::new(Vec::new())).collect(),
            }),
        }
    }

    /// Allocates a buffer of at least `size` bytes, or signals exhaustion.
    pub fn allocate(&self, size: usize) -> Result<PoolBuffer> {
        let (class, charged) = match SIZE_CLASSES.iter().position(|&c| c >= size) {
            Some(idx) => (Some(idx), SIZE_CLASSES[idx]),
            None => (None, size),
        };

        self.shared.reserve(charged)?;

        let data = class
            .and_then(|idx| self.shared.freelists[idx].lock().pop())
            .unwrap_or_else(|| vec![0u8; charged].into_boxed_slice());

        Ok(PoolBuffer {
            data: Some(data),
            charged,
            class,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Bytes currently available for allocation.
    pub fn bytes_free(&self) -> usize {
        self.shared.bytes_free.load(Ordering::Acquire)
    }

    /// Total byte budget.
    pub fn capacity(&self) -> usize {
        self.shared.capacity
    }

    /// Telemetry tags for this pool.
    pub fn tags(&self) -> &str {
        &self.shared.tags
    }
}

/// A buffer leased from the pool. Returns its bytes to the pool's freelist on
/// drop.
#[derive(Debug)]
pub struct PoolBuffer {
    data: Option<Box<[u8]>>,
    charged: usize,
    class: Option<usize>,
    shared: Arc<PoolShared>,
}

impl PoolBuffer {
    /// Capacity charged against the pool budget.
    pub fn capacity(&self) -> usize {
        self.charged
    }
}

impl Deref for PoolBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.data.as_deref().expect("buffer present until drop")
    }
}

impl DerefMut for PoolBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().expect("buffer present until drop")
    }
}

impl Drop for PoolBuffer {
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            if let Some(idx) = self.class {
                self.shared.freelists[idx].lock().push(data);
            }
            self.shared.release(self.charged);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_rounds_up_to_size_class() {
        let pool = BufferPool::new(8 * 1024, "test");
        let buf = pool.allocate(300).unwrap();
        assert_eq!(buf.capacity(), 1024);
        assert_eq!(pool.bytes_free(), 7 * 1024);
    }

    #[test]
    fn drop_returns_bytes_to_the_pool() {
        let pool = BufferPool::new(4 * 1024, "test");
        let buf = pool.allocate(1024).unwrap();
        assert_eq!(pool.bytes_free(), 3 * 1024);
        drop(buf);
        assert_eq!(pool.bytes_free(), 4 * 1024);
    }

    #[test]
    fn exhausted_pool_signals_instead_of_overcommitting() {
        let pool = BufferPool::new(1024, "test");
        let _held = pool.allocate(1024).unwrap();
        let err = pool.allocate(256).unwrap_err();
        assert!(matches!(
            err,
            MemSeriesError::BufferPoolExhausted { requested: 256, free: 0 }
        ));
    }

    #[test]
    fn freed_buffers_are_recycled_from_the_freelist() {
        let pool = BufferPool::new(2048, "test");
        let first = pool.allocate(1024).unwrap();
        let ptr = first.as_ptr();
        drop(first);
        let second = pool.allocate(1024).unwrap();
        assert_eq!(second.as_ptr(), ptr);
    }

    #[test]
    fn oversize_allocations_are_exact_and_not_recycled() {
        let pool = BufferPool::new(8 * 1024 * 1024, "test");
        let big = pool.allocate(3 * 1024 * 1024).unwrap();
        assert_eq!(big.capacity(), 3 * 1024 * 1024);
        drop(big);
        assert_eq!(pool.bytes_free(), 8 * 1024 * 1024);
    }
}
