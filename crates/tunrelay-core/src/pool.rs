//! Reusable byte buffers for the relay copy loops.
//!
//! Buffers are grouped in power-of-two size classes up to [`MAX_POOLED_SIZE`].
//! Each class keeps a bounded lock-free free list, so concurrent sessions can
//! take and return buffers without a shared lock. A [`PooledBuffer`] goes back
//! to its class when dropped.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

/// Chunk size used by the stream copy loops.
pub const RELAY_BUFFER_SIZE: usize = 20 << 10;

/// Largest datagram the packet copy loops accept.
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;

/// Largest buffer kept in the pool. Bigger requests are allocated on demand.
pub const MAX_POOLED_SIZE: usize = 1 << 16;

/// Default number of idle buffers kept per size class.
pub const DEFAULT_CLASS_CAPACITY: usize = 256;

const CLASS_COUNT: usize = MAX_POOLED_SIZE.trailing_zeros() as usize + 1;

#[derive(Debug, Default)]
struct Counters {
    allocations: AtomicU64,
    reuses: AtomicU64,
    returns: AtomicU64,
    drops: AtomicU64,
}

/// Point-in-time copy of the pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers allocated because the class was empty.
    pub allocations: u64,
    /// Buffers handed out from a free list.
    pub reuses: u64,
    /// Buffers put back on a free list.
    pub returns: u64,
    /// Buffers released to the allocator (class full or oversized).
    pub drops: u64,
}

/// Size-classed buffer pool, safe to share across tasks.
#[derive(Debug)]
pub struct BufferPool {
    classes: Vec<ArrayQueue<Vec<u8>>>,
    counters: Counters,
}

impl BufferPool {
    /// Creates a pool keeping at most `class_capacity` idle buffers per class.
    pub fn new(class_capacity: usize) -> Arc<Self> {
        let class_capacity = class_capacity.max(1);
        let classes = (0..CLASS_COUNT)
            .map(|_| ArrayQueue::new(class_capacity))
            .collect();
        Arc::new(Self {
            classes,
            counters: Counters::default(),
        })
    }

    /// Takes a buffer of exactly `size` usable bytes.
    ///
    /// Contents of a reused buffer are whatever the previous holder left.
    pub fn get(self: &Arc<Self>, size: usize) -> PooledBuffer {
        let class = class_of(size);
        let buf = match class {
            Some(idx) => match self.classes[idx].pop() {
                Some(buf) => {
                    self.counters.reuses.fetch_add(1, Ordering::Relaxed);
                    buf
                }
                None => {
                    self.counters.allocations.fetch_add(1, Ordering::Relaxed);
                    vec![0u8; 1 << idx]
                }
            },
            None => {
                self.counters.allocations.fetch_add(1, Ordering::Relaxed);
                vec![0u8; size]
            }
        };

        PooledBuffer {
            buf: Some(buf),
            len: size,
            class,
            pool: Arc::clone(self),
        }
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            allocations: self.counters.allocations.load(Ordering::Relaxed),
            reuses: self.counters.reuses.load(Ordering::Relaxed),
            returns: self.counters.returns.load(Ordering::Relaxed),
            drops: self.counters.drops.load(Ordering::Relaxed),
        }
    }

    /// Number of idle buffers currently held for requests of `size` bytes.
    pub fn idle(&self, size: usize) -> usize {
        class_of(size).map_or(0, |idx| self.classes[idx].len())
    }

    fn put(&self, buf: Vec<u8>, class: Option<usize>) {
        let Some(idx) = class else {
            self.counters.drops.fetch_add(1, Ordering::Relaxed);
            return;
        };
        match self.classes[idx].push(buf) {
            Ok(()) => {
                self.counters.returns.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.counters.drops.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

fn class_of(size: usize) -> Option<usize> {
    if size > MAX_POOLED_SIZE {
        return None;
    }
    Some(size.max(1).next_power_of_two().trailing_zeros() as usize)
}

/// A buffer borrowed from a [`BufferPool`], returned on drop.
#[derive(Debug)]
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    len: usize,
    class: Option<usize>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match &self.buf {
            Some(buf) => &buf[..self.len],
            None => &[],
        }
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        match &mut self.buf {
            Some(buf) => &mut buf[..self.len],
            None => &mut [],
        }
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.put(buf, self.class);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_of() {
        assert_eq!(class_of(0), Some(0));
        assert_eq!(class_of(1), Some(0));
        assert_eq!(class_of(1500), Some(11));
        assert_eq!(class_of(RELAY_BUFFER_SIZE), Some(15));
        assert_eq!(class_of(MAX_SEGMENT_SIZE), Some(16));
        assert_eq!(class_of(MAX_POOLED_SIZE), Some(16));
        assert_eq!(class_of(MAX_POOLED_SIZE + 1), None);
    }

    #[test]
    fn test_get_returns_requested_length() {
        let pool = BufferPool::new(4);
        let buf = pool.get(RELAY_BUFFER_SIZE);
        assert_eq!(buf.len(), RELAY_BUFFER_SIZE);
    }

    #[test]
    fn test_buffer_returned_on_drop() {
        let pool = BufferPool::new(4);
        let buf = pool.get(RELAY_BUFFER_SIZE);
        assert_eq!(pool.idle(RELAY_BUFFER_SIZE), 0);
        drop(buf);
        assert_eq!(pool.idle(RELAY_BUFFER_SIZE), 1);

        let _again = pool.get(RELAY_BUFFER_SIZE);
        let stats = pool.stats();
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.reuses, 1);
        assert_eq!(stats.returns, 1);
    }

    #[test]
    fn test_full_class_drops_buffer() {
        let pool = BufferPool::new(1);
        let a = pool.get(512);
        let b = pool.get(512);
        drop(a);
        drop(b);
        let stats = pool.stats();
        assert_eq!(stats.returns, 1);
        assert_eq!(stats.drops, 1);
        assert_eq!(pool.idle(512), 1);
    }

    #[test]
    fn test_oversized_request_not_pooled() {
        let pool = BufferPool::new(4);
        let buf = pool.get(MAX_POOLED_SIZE * 2);
        assert_eq!(buf.len(), MAX_POOLED_SIZE * 2);
        drop(buf);
        assert_eq!(pool.stats().drops, 1);
        assert_eq!(pool.idle(MAX_POOLED_SIZE * 2), 0);
    }

    #[test]
    fn test_concurrent_buffers_do_not_alias() {
        let pool = BufferPool::new(64);
        let handles: Vec<_> = (0..8u8)
            .map(|marker| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..200 {
                        let mut buf = pool.get(4096);
                        buf.fill(marker);
                        std::thread::yield_now();
                        assert!(buf.iter().all(|&b| b == marker));
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = pool.stats();
        assert_eq!(stats.allocations + stats.reuses, 8 * 200);
        assert_eq!(stats.returns + stats.drops, 8 * 200);
    }
}
