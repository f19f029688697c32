//! Bounded pools for frames, packets and their byte buffers.
//!
//! Pools bound how many objects of each kind may be alive at once, so a
//! misbehaving peer or a stalled consumer translates into `NoMem` instead of
//! unbounded memory growth. A pool is `Arc`-shared and outlives everything
//! drawn from it; the slot is returned when the last reference to the drawn
//! object drops.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};

struct PoolInner {
    capacity: usize,
    available: AtomicUsize,
}

impl PoolInner {
    fn acquire(self: &Arc<Self>) -> Option<PoolSlot> {
        let mut available = self.available.load(Ordering::Relaxed);
        loop {
            if available == 0 {
                return None;
            }
            match self.available.compare_exchange_weak(
                available,
                available - 1,
                Ordering::Acquire,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(PoolSlot {
                        pool: Arc::clone(self),
                    })
                }
                Err(current) => available = current,
            }
        }
    }
}

/// Guard representing one occupied slot of a pool.
///
/// Dropping the guard frees the slot for reuse.
pub struct PoolSlot {
    pool: Arc<PoolInner>,
}

impl Drop for PoolSlot {
    fn drop(&mut self) {
        self.pool.available.fetch_add(1, Ordering::Release);
    }
}

/// Counting pool for plain objects (packets, frames).
#[derive(Clone)]
pub struct ObjectPool {
    inner: Arc<PoolInner>,
}

impl ObjectPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                available: AtomicUsize::new(capacity),
            }),
        }
    }

    /// Claims a slot, or `None` if the pool is exhausted.
    pub fn acquire(&self) -> Option<PoolSlot> {
        self.inner.acquire()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of currently free slots.
    pub fn num_free(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }
}

/// Counting pool of fixed-size byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    inner: Arc<PoolInner>,
    buffer_size: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, capacity: usize) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                available: AtomicUsize::new(capacity),
            }),
            buffer_size,
        }
    }

    /// Maximum byte size of buffers drawn from this pool.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn num_free(&self) -> usize {
        self.inner.available.load(Ordering::Relaxed)
    }

    /// Draws an empty buffer, or `None` if the pool is exhausted.
    pub fn allocate(&self) -> Option<PooledBuffer> {
        let slot = self.inner.acquire()?;
        Some(PooledBuffer {
            data: BytesMut::with_capacity(self.buffer_size),
            slot,
        })
    }
}

/// Mutable byte buffer drawn from a [`BufferPool`].
pub struct PooledBuffer {
    data: BytesMut,
    slot: PoolSlot,
}

impl PooledBuffer {
    /// Converts the buffer into an immutable shared slice plus the slot
    /// guard that keeps the pool accounting alive.
    pub fn freeze(self) -> (Bytes, PoolSlot) {
        (self.data.freeze(), self.slot)
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        &self.data
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocation_bounded_by_capacity() {
        let pool = BufferPool::new(64, 2);
        let a = pool.allocate().expect("first");
        let b = pool.allocate().expect("second");
        assert!(pool.allocate().is_none(), "pool should be exhausted");
        drop(a);
        let c = pool.allocate().expect("slot returned after drop");
        drop(b);
        drop(c);
        assert_eq!(pool.num_free(), 2);
    }

    #[test]
    fn slot_survives_freeze() {
        let pool = BufferPool::new(16, 1);
        let mut buffer = pool.allocate().unwrap();
        buffer.extend_from_slice(b"abc");
        let (bytes, slot) = buffer.freeze();
        assert_eq!(&bytes[..], b"abc");
        assert!(pool.allocate().is_none(), "slot still held by guard");
        drop(slot);
        assert!(pool.allocate().is_some());
    }

    #[test]
    fn object_pool_counts() {
        let pool = ObjectPool::new(1);
        let slot = pool.acquire().unwrap();
        assert!(pool.acquire().is_none());
        drop(slot);
        assert_eq!(pool.num_free(), 1);
    }
}
