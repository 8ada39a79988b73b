//! Buffer pools.
//!
//! Read buffers are preallocated in large blocks. A read fills the front of a
//! block, the filled bytes are split off and frozen, and the unfilled
//! remainder goes back to the pool for the next read. Splitting hands out
//! disjoint regions of the same allocation, so a recycled remainder can never
//! alias bytes that are still referenced by a frozen [`Bytes`].
//!
//! [`UnsynchronizedPool`] is owned by exactly one dispatcher thread.
//! [`SynchronizedPool`] is shared through an `Arc` and keeps at most
//! `capacity` free buffers; [`SynchronizedPool::shrink`] evicts half of them
//! and is driven by the dispatcher's timeout sweep.

use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tracing::trace;

/// Allocations for oversized requests are this many times the request.
pub const GROWTH_FACTOR: usize = 2;

/// Hit/miss counters of a pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Buffers currently held by the free list.
    pub pooled: usize,
    /// Acquires served from the free list.
    pub hits: u64,
    /// Acquires that had to allocate.
    pub misses: u64,
}

// Free list shared by both pool variants.
#[derive(Debug)]
struct FreeList {
    buffers: Vec<BytesMut>,
    preallocation_size: usize,
    capacity: usize,
}

impl FreeList {
    fn new(preallocation_size: usize, capacity: usize) -> Self {
        Self {
            buffers: Vec::new(),
            preallocation_size,
            capacity,
        }
    }

    // Returns the buffer and whether it came from the free list.
    fn acquire(&mut self, min_size: usize) -> (BytesMut, bool) {
        while let Some(buffer) = self.buffers.pop() {
            if buffer.capacity() >= min_size {
                return (buffer, true);
            }
            // Undersized leftovers are dropped, not kept around.
        }
        let size = self
            .preallocation_size
            .max(min_size.saturating_mul(GROWTH_FACTOR));
        (BytesMut::with_capacity(size), false)
    }

    fn recycle(&mut self, mut buffer: BytesMut, min_size: usize) -> bool {
        buffer.clear();
        if buffer.capacity() < min_size || self.buffers.len() >= self.capacity {
            return false;
        }
        self.buffers.push(buffer);
        true
    }
}

/// Thread-confined buffer pool used by one dispatcher's read path.
///
/// **Not thread-safe.** Only the dispatcher thread that owns it may touch it.
#[derive(Debug)]
pub struct UnsynchronizedPool {
    free: FreeList,
    hits: u64,
    misses: u64,
}

impl UnsynchronizedPool {
    /// Creates a pool that allocates blocks of `preallocation_size` bytes.
    pub fn new(preallocation_size: usize) -> Self {
        Self {
            free: FreeList::new(preallocation_size, usize::MAX),
            hits: 0,
            misses: 0,
        }
    }

    /// Returns an empty buffer with at least `min_size` bytes of capacity.
    pub fn acquire(&mut self, min_size: usize) -> BytesMut {
        let (buffer, hit) = self.free.acquire(min_size);
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
            trace!(capacity = buffer.capacity(), "Allocated read buffer");
        }
        buffer
    }

    /// Returns `buffer` to the pool if at least `min_size` bytes remain.
    pub fn recycle(&mut self, buffer: BytesMut, min_size: usize) {
        self.free.recycle(buffer, min_size);
    }

    /// Splits the first `read` bytes off `buffer` and recycles the rest.
    pub fn extract_and_recycle(&mut self, mut buffer: BytesMut, read: usize, min_size: usize) -> Bytes {
        let data = buffer.split_to(read).freeze();
        self.recycle(buffer, min_size);
        data
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pooled: self.free.buffers.len(),
            hits: self.hits,
            misses: self.misses,
        }
    }
}

/// Mutex-guarded buffer pool that may be shared between threads.
#[derive(Debug)]
pub struct SynchronizedPool {
    free: Mutex<FreeList>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl SynchronizedPool {
    /// Creates a pool that allocates blocks of `preallocation_size` bytes and
    /// keeps at most `capacity` of them.
    pub fn new(preallocation_size: usize, capacity: usize) -> Self {
        Self {
            free: Mutex::new(FreeList::new(preallocation_size, capacity)),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn acquire(&self, min_size: usize) -> BytesMut {
        let (buffer, hit) = self.lock().acquire(min_size);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
        buffer
    }

    pub fn recycle(&self, buffer: BytesMut, min_size: usize) {
        self.lock().recycle(buffer, min_size);
    }

    pub fn extract_and_recycle(&self, mut buffer: BytesMut, read: usize, min_size: usize) -> Bytes {
        let data = buffer.split_to(read).freeze();
        self.recycle(buffer, min_size);
        data
    }

    /// Drops half of the free buffers. Returns how many were evicted.
    pub fn shrink(&self) -> usize {
        let mut free = self.lock();
        let keep = free.buffers.len() / 2;
        let evicted = free.buffers.len() - keep;
        free.buffers.truncate(keep);
        if evicted > 0 {
            trace!(evicted, kept = keep, "Shrunk shared buffer pool");
        }
        evicted
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            pooled: self.lock().buffers.len(),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
        }
    }

    // A panic while holding the lock leaves the free list consistent, so a
    // poisoned mutex is still usable.
    fn lock(&self) -> std::sync::MutexGuard<'_, FreeList> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
