//! Tiered pool for large pixel and JPEG buffers.
//!
//! Capture and encode churn through multi-megabyte allocations at frame
//! rate. The pool retains a bounded number of buffers in fixed-size
//! buckets so steady-state operation allocates nothing. Small buffers
//! (below [`POOL_MIN`]) are cheaper to allocate fresh than to track and
//! are never pooled.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::buffer::SharedBuffer;

/// Allocations below this size bypass the pool entirely.
pub const POOL_MIN: usize = 85 * 1024;

/// Fixed bucket sizes, ascending.
pub const BUCKET_SIZES: [usize; 4] = [128 * 1024, 512 * 1024, 2 * 1024 * 1024, 8 * 1024 * 1024];

/// Retained-item cap per bucket.
const BUCKET_CAPS: [usize; 4] = [16, 8, 8, 4];

/// Retained-item cap for the oversize free list.
const HUGE_CAP: usize = 3;

/// Counters describing pool behavior since creation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolMetrics {
    /// Total `rent` calls.
    pub rents: u64,
    /// Rents satisfied from a retained buffer.
    pub hits: u64,
    /// Rents that allocated fresh storage.
    pub misses: u64,
    /// Returned buffers dropped because their bucket was full.
    pub discards: u64,
    /// Total buffers handed back (pooled or discarded).
    pub returns: u64,
    /// Bytes currently retained across all buckets.
    pub current_retained_bytes: usize,
    /// High-water mark of `current_retained_bytes`.
    pub peak_retained_bytes: usize,
}

/// Process-wide tiered buffer pool.
///
/// Buckets are bounded lock-free queues; counters are atomics. The pool
/// is created once at startup and shared via `Arc`.
pub struct BufferPool {
    buckets: [ArrayQueue<Vec<u8>>; 4],
    huge: ArrayQueue<Vec<u8>>,
    rents: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    discards: AtomicU64,
    returns: AtomicU64,
    retained: AtomicUsize,
    peak_retained: AtomicUsize,
}

impl BufferPool {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            buckets: [
                ArrayQueue::new(BUCKET_CAPS[0]),
                ArrayQueue::new(BUCKET_CAPS[1]),
                ArrayQueue::new(BUCKET_CAPS[2]),
                ArrayQueue::new(BUCKET_CAPS[3]),
            ],
            huge: ArrayQueue::new(HUGE_CAP),
            rents: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            discards: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            retained: AtomicUsize::new(0),
            peak_retained: AtomicUsize::new(0),
        })
    }

    /// Rent a buffer of at least `min_len` bytes.
    ///
    /// The returned [`SharedBuffer`] reports `min_len` as its logical
    /// length; capacity may be larger (the bucket's fixed size).
    pub fn rent(self: &Arc<Self>, min_len: usize) -> SharedBuffer {
        self.rents.fetch_add(1, Ordering::Relaxed);
        let storage = self.take_storage(min_len);
        SharedBuffer::from_pool(storage, min_len, Arc::downgrade(self))
    }

    fn take_storage(&self, min_len: usize) -> Vec<u8> {
        if min_len < POOL_MIN {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return vec![0; min_len];
        }

        if let Some(idx) = BUCKET_SIZES.iter().position(|&s| min_len <= s) {
            if let Some(buf) = self.buckets[idx].pop() {
                self.note_dequeued(buf.len());
                self.hits.fetch_add(1, Ordering::Relaxed);
                return buf;
            }
            self.misses.fetch_add(1, Ordering::Relaxed);
            return vec![0; BUCKET_SIZES[idx]];
        }

        // Oversize: scan the huge list for a fit, requeueing the rest.
        let mut misfits = Vec::new();
        let mut found = None;
        while let Some(buf) = self.huge.pop() {
            if found.is_none() && buf.len() >= min_len {
                found = Some(buf);
            } else {
                misfits.push(buf);
            }
        }
        for buf in misfits {
            let len = buf.len();
            if self.huge.push(buf).is_err() {
                self.note_dequeued(len);
            }
        }
        if let Some(buf) = found {
            self.note_dequeued(buf.len());
            self.hits.fetch_add(1, Ordering::Relaxed);
            return buf;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        vec![0; min_len]
    }

    /// Return storage to the pool. Small buffers are dropped; buffers
    /// that do not fit their bucket (cap reached, or an off-size stray)
    /// are counted as discards and released to the allocator.
    pub(crate) fn recycle(&self, data: Vec<u8>) {
        let len = data.len();
        if len < POOL_MIN {
            return;
        }
        self.returns.fetch_add(1, Ordering::Relaxed);

        if let Some(idx) = BUCKET_SIZES.iter().position(|&s| s == len) {
            if self.buckets[idx].push(data).is_ok() {
                self.note_enqueued(len);
            } else {
                self.discards.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        if len > *BUCKET_SIZES.last().expect("buckets non-empty") {
            if self.huge.push(data).is_ok() {
                self.note_enqueued(len);
            } else {
                self.discards.fetch_add(1, Ordering::Relaxed);
            }
            return;
        }

        // Large but not a bucket size: did not come from a bucket rent.
        self.discards.fetch_add(1, Ordering::Relaxed);
    }

    fn note_enqueued(&self, len: usize) {
        let now = self.retained.fetch_add(len, Ordering::Relaxed) + len;
        let mut peak = self.peak_retained.load(Ordering::Relaxed);
        while now > peak {
            match self.peak_retained.compare_exchange_weak(
                peak,
                now,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => peak = observed,
            }
        }
    }

    fn note_dequeued(&self, len: usize) {
        self.retained.fetch_sub(len, Ordering::Relaxed);
    }

    /// Snapshot the pool counters.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        PoolMetrics {
            rents: self.rents.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            discards: self.discards.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            current_retained_bytes: self.retained.load(Ordering::Relaxed),
            peak_retained_bytes: self.peak_retained.load(Ordering::Relaxed),
        }
    }
}
