//! Reusable byte buffers grouped by power-of-two size class
//!
//! Module archives can be hundreds of megabytes. Workers borrow their download
//! and unpack buffers from a shared [`BufferPool`] so that steady-state
//! ingestion reuses a handful of large allocations instead of making new ones
//! per release. A [`PooledBuffer`] goes back to its class when dropped, on
//! success, error and unwind paths alike.

use bytes::Bytes;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Smallest size class handed out.
pub const MIN_CLASS: usize = 4 * 1024;

/// Default capacity class for whole-archive buffers (module zips are capped at 500 MB).
pub const DEFAULT_ARCHIVE_CAPACITY: usize = 512 * 1024 * 1024;

/// Default capacity class for single archive members.
pub const DEFAULT_FILE_CAPACITY: usize = 1024 * 1024;

/// Size class for a requested minimum capacity.
pub fn size_class(min_capacity: usize) -> usize {
    min_capacity.max(MIN_CLASS).next_power_of_two()
}

#[derive(Default)]
struct Counters {
    allocated: AtomicU64,
    reused: AtomicU64,
    released: AtomicU64,
}

struct Shared {
    free: Mutex<HashMap<usize, Vec<Vec<u8>>>>,
    max_retained_per_class: usize,
    counters: Counters,
}

/// Thread-safe pool of byte buffers.
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

/// Allocation counters of a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PoolStats {
    /// Buffers created because no retained buffer of the class was free
    pub allocated: u64,
    /// Acquisitions served from a retained buffer
    pub reused: u64,
    /// Returned buffers dropped instead of retained
    pub released: u64,
    /// Buffers currently retained across all classes
    pub retained: usize,
}

impl BufferPool {
    /// Create a pool that keeps at most `max_retained_per_class` idle buffers per class.
    pub fn new(max_retained_per_class: usize) -> Self {
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(HashMap::new()),
                max_retained_per_class,
                counters: Counters::default(),
            }),
        }
    }

    /// Borrow an empty buffer with at least `min_capacity` bytes of capacity.
    pub fn acquire(&self, min_capacity: usize) -> PooledBuffer {
        let class = size_class(min_capacity);
        let retained = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&class)
            .and_then(Vec::pop);

        let buf = match retained {
            Some(buf) => {
                self.shared.counters.reused.fetch_add(1, Ordering::Relaxed);
                buf
            }
            None => {
                self.shared.counters.allocated.fetch_add(1, Ordering::Relaxed);
                Vec::with_capacity(class)
            }
        };

        PooledBuffer {
            buf,
            class,
            pool: self.shared.clone(),
        }
    }

    pub fn stats(&self) -> PoolStats {
        let counters = &self.shared.counters;
        let retained = self
            .shared
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum();

        PoolStats {
            allocated: counters.allocated.load(Ordering::Relaxed),
            reused: counters.reused.load(Ordering::Relaxed),
            released: counters.released.load(Ordering::Relaxed),
            retained,
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(16)
    }
}

/// A buffer on loan from a [`BufferPool`].
pub struct PooledBuffer {
    buf: Vec<u8>,
    class: usize,
    pool: Arc<Shared>,
}

impl PooledBuffer {
    /// Size class this buffer returns to.
    pub fn class(&self) -> usize {
        self.class
    }

    /// Move the contents out as [`Bytes`] without copying, leaving this
    /// buffer empty until [`PooledBuffer::restore`] is called.
    pub fn share(&mut self) -> Bytes {
        Bytes::from(std::mem::take(&mut self.buf))
    }

    /// Take back bytes from [`PooledBuffer::share`]. The allocation is kept
    /// when no other handle to it is alive, otherwise the bytes are copied.
    pub fn restore(&mut self, bytes: Bytes) {
        self.buf = Vec::from(bytes);
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Self::Target {
        &self.buf
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buf
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buf = std::mem::take(&mut self.buf);
        buf.clear();

        // A buffer that grew past its class would inflate the class's footprint.
        if buf.capacity() > self.class * 2 {
            self.pool.counters.released.fetch_add(1, Ordering::Relaxed);
            return;
        }

        let mut free = self.pool.free.lock().unwrap_or_else(PoisonError::into_inner);
        let slot = free.entry(self.class).or_default();
        if slot.len() < self.pool.max_retained_per_class {
            slot.push(buf);
        } else {
            self.pool.counters.released.fetch_add(1, Ordering::Relaxed);
        }
    }
}
