//! Shared-ownership pixel buffers backed by the tiered pool.

use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use thiserror::Error;

use crate::pool::BufferPool;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// `set_len` may shrink but never grow beyond capacity.
    #[error("logical length {requested} exceeds capacity {capacity}")]
    LengthExceedsCapacity { requested: usize, capacity: usize },
}

struct BufInner {
    data: Vec<u8>,
    logical: AtomicUsize,
    pool: Weak<BufferPool>,
}

impl Drop for BufInner {
    fn drop(&mut self) {
        // Last handle gone: hand the storage back exactly once. A pool
        // that has already been torn down just lets the Vec free.
        if let Some(pool) = self.pool.upgrade() {
            pool.recycle(mem::take(&mut self.data));
        }
    }
}

/// A fixed-capacity byte buffer with atomic shared ownership.
///
/// Cloning increments the reference count; dropping the final clone
/// returns the underlying storage to its [`BufferPool`]. The logical
/// length may be shrunk in place with [`set_len`](Self::set_len) but
/// never grows past the allocated capacity. Mutable access requires a
/// unique handle, so a buffer can be filled before it is shared and is
/// immutable afterwards.
pub struct SharedBuffer {
    inner: Arc<BufInner>,
}

impl SharedBuffer {
    pub(crate) fn from_pool(data: Vec<u8>, logical: usize, pool: Weak<BufferPool>) -> Self {
        debug_assert!(logical <= data.len());
        Self {
            inner: Arc::new(BufInner {
                data,
                logical: AtomicUsize::new(logical),
                pool,
            }),
        }
    }

    /// Wrap plain storage without pool backing (dropped storage is
    /// simply freed). Used where pooling would never pay off.
    #[must_use]
    pub fn from_vec(data: Vec<u8>) -> Self {
        let logical = data.len();
        Self::from_pool(data, logical, Weak::new())
    }

    /// Logical length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.logical.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Allocated capacity; fixed for the buffer's lifetime.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.inner.data.len()
    }

    /// The logical contents.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.inner.data[..self.len()]
    }

    /// Shrink (or restore, up to capacity) the logical length.
    pub fn set_len(&self, len: usize) -> Result<(), BufferError> {
        if len > self.capacity() {
            return Err(BufferError::LengthExceedsCapacity {
                requested: len,
                capacity: self.capacity(),
            });
        }
        self.inner.logical.store(len, Ordering::Release);
        Ok(())
    }

    /// Mutable view of the logical contents. `None` once the buffer is
    /// shared; fill before cloning.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        let inner = Arc::get_mut(&mut self.inner)?;
        let logical = *inner.logical.get_mut();
        Some(&mut inner.data[..logical])
    }

    /// Number of live handles to this buffer.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

impl Clone for SharedBuffer {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl AsRef<[u8]> for SharedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for SharedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("refs", &self.ref_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_bumps_ref_count() {
        let buf = SharedBuffer::from_vec(vec![1, 2, 3]);
        assert_eq!(buf.ref_count(), 1);
        let other = buf.clone();
        assert_eq!(buf.ref_count(), 2);
        drop(other);
        assert_eq!(buf.ref_count(), 1);
    }

    #[test]
    fn set_len_shrinks_view() {
        let buf = SharedBuffer::from_vec(vec![0; 16]);
        buf.set_len(4).unwrap();
        assert_eq!(buf.as_slice().len(), 4);
        assert_eq!(buf.capacity(), 16);
        buf.set_len(16).unwrap();
        assert_eq!(buf.len(), 16);
    }

    #[test]
    fn set_len_rejects_growth_past_capacity() {
        let buf = SharedBuffer::from_vec(vec![0; 8]);
        assert_eq!(
            buf.set_len(9),
            Err(BufferError::LengthExceedsCapacity {
                requested: 9,
                capacity: 8
            })
        );
    }

    #[test]
    fn mutation_requires_unique_handle() {
        let mut buf = SharedBuffer::from_vec(vec![0; 4]);
        assert!(buf.as_mut_slice().is_some());
        let shared = buf.clone();
        assert!(buf.as_mut_slice().is_none());
        drop(shared);
        buf.as_mut_slice().unwrap()[0] = 7;
        assert_eq!(buf.as_slice()[0], 7);
    }

    #[test]
    fn storage_returns_to_pool_once() {
        let pool = BufferPool::new();
        let buf = pool.rent(256 * 1024);
        let clone = buf.clone();
        drop(buf);
        assert_eq!(pool.metrics().returns, 0);
        drop(clone);
        assert_eq!(pool.metrics().returns, 1);
        assert_eq!(pool.metrics().current_retained_bytes, 512 * 1024);
    }
}
