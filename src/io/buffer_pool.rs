//! Lock-free message buffer pool
//!
//! A free-list of fixed-size buffers sized to the largest possible transport
//! message. The TUN reader acquires a buffer for each work element; whoever
//! drops the element last (the sequential sender on the normal path, a
//! drop-oldest eviction otherwise) returns it. Uses
//! `crossbeam_queue::ArrayQueue` for lock-free management so the reader and
//! the per-peer senders never contend on a lock.
//!
//! Buffers are handed out dirty: the reader overwrites the packet region and
//! the encryption worker writes padding explicitly, so zeroing on reuse would
//! be wasted work on the hot path.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::wire::MAX_MESSAGE_SIZE;

/// Default pool capacity (number of buffers)
pub const DEFAULT_POOL_CAPACITY: usize = 1024;

/// Statistics for the buffer pool
///
/// `gets() == returns() + discards()` once every outstanding buffer has been
/// dropped; the pipeline tests lean on that to prove buffer conservation.
#[derive(Debug)]
pub struct BufferPoolStats {
    /// Number of buffers handed out
    gets: AtomicU64,
    /// Number of new buffer allocations (pool was empty)
    allocations: AtomicU64,
    /// Number of buffer reuses from the pool
    reuses: AtomicU64,
    /// Number of buffers returned to the pool
    returns: AtomicU64,
    /// Number of buffers discarded on return (pool was full)
    discards: AtomicU64,
}

impl BufferPoolStats {
    fn new() -> Self {
        Self {
            gets: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
            reuses: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            discards: AtomicU64::new(0),
        }
    }

    /// Number of buffers handed out
    #[must_use]
    pub fn gets(&self) -> u64 {
        self.gets.load(Ordering::Relaxed)
    }

    /// Number of fresh allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Number of reuses from the free list
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Number of buffers returned to the free list
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Number of buffers discarded because the free list was full
    #[must_use]
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Buffers currently held by live elements
    #[must_use]
    pub fn in_flight(&self) -> u64 {
        self.gets()
            .saturating_sub(self.returns() + self.discards())
    }

    /// Get a snapshot of all stats
    #[must_use]
    pub fn snapshot(&self) -> BufferPoolStatsSnapshot {
        BufferPoolStatsSnapshot {
            gets: self.gets(),
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            discards: self.discards(),
        }
    }
}

/// Snapshot of buffer pool statistics
#[derive(Debug, Clone, Copy)]
pub struct BufferPoolStatsSnapshot {
    /// Number of buffers handed out
    pub gets: u64,
    /// Number of fresh allocations
    pub allocations: u64,
    /// Number of reuses
    pub reuses: u64,
    /// Number of returns
    pub returns: u64,
    /// Number of discards (pool full)
    pub discards: u64,
}

/// A lock-free pool of fixed-size message buffers.
///
/// Every buffer is exactly [`MAX_MESSAGE_SIZE`] bytes. Buffers return to the
/// pool automatically when the [`PooledBuffer`] is dropped.
#[derive(Debug)]
pub struct MessageBufferPool {
    /// Lock-free free list
    buffers: ArrayQueue<Vec<u8>>,
    /// Pool statistics
    stats: BufferPoolStats,
}

impl MessageBufferPool {
    /// Create a new pool holding at most `capacity` idle buffers
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            buffers: ArrayQueue::new(capacity),
            stats: BufferPoolStats::new(),
        }
    }

    /// Create a pool with the default capacity
    #[must_use]
    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_POOL_CAPACITY)
    }

    /// Get a buffer from the pool or allocate a new one.
    ///
    /// Reused buffers are NOT zeroed; the contents are overwritten by the
    /// TUN read and the explicit padding step.
    #[must_use]
    pub fn get(self: &Arc<Self>) -> PooledBuffer {
        self.stats.gets.fetch_add(1, Ordering::Relaxed);
        let buffer = if let Some(buf) = self.buffers.pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            vec![0u8; MAX_MESSAGE_SIZE]
        };

        PooledBuffer {
            buffer: Some(buffer),
            pool: Arc::clone(self),
        }
    }

    /// Pre-warm the pool by allocating buffers up front
    pub fn prewarm(&self, count: usize) {
        for _ in 0..count {
            if self.buffers.push(vec![0u8; MAX_MESSAGE_SIZE]).is_err() {
                break;
            }
        }
    }

    /// Return a buffer to the pool; dropped if the free list is full
    fn return_buffer(&self, buffer: Vec<u8>) {
        match self.buffers.push(buffer) {
            Ok(()) => {
                self.stats.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_buf) => {
                self.stats.discards.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Number of idle buffers currently in the pool
    #[must_use]
    pub fn available(&self) -> usize {
        self.buffers.len()
    }

    /// Pool capacity
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffers.capacity()
    }

    /// Pool statistics
    #[must_use]
    pub fn stats(&self) -> &BufferPoolStats {
        &self.stats
    }
}

/// A message buffer borrowed from the pool.
///
/// Always [`MAX_MESSAGE_SIZE`] bytes long; returns to the pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    /// The underlying buffer (Option for taking on drop)
    buffer: Option<Vec<u8>>,
    /// Owning pool
    pool: Arc<MessageBufferPool>,
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            self.pool.return_buffer(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}

impl AsRef<[u8]> for PooledBuffer {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for PooledBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}
