//! Bounded pool of reusable pixel buffers.
//!
//! At most `capacity` buffers ever exist: a buffer is either on the free list
//! or checked out together with a semaphore permit. When every buffer is
//! checked out, `acquire` waits for one to come back.

use crate::config::PoolSettings;
use crate::error::CaptureError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub allocations: u64,
    pub reallocations: u64,
    pub reuses: u64,
    pub exhaustion_waits: u64,
    pub in_use: usize,
    pub available: usize,
    pub high_water: usize,
    pub bytes_held: usize,
}

impl PoolStats {
    pub fn memory_mb(&self) -> f64 {
        self.bytes_held as f64 / (1024.0 * 1024.0)
    }
}

struct PoolInner {
    capacity: usize,
    free: Mutex<Vec<Vec<u8>>>,
    permits: Arc<Semaphore>,
    stats: Mutex<PoolStats>,
    warn_after: Duration,
}

impl PoolInner {
    fn stats(&self) -> MutexGuard<'_, PoolStats> {
        self.stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn free(&self) -> MutexGuard<'_, Vec<Vec<u8>>> {
        self.free.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn checkout(self: &Arc<Self>, size: usize, permit: OwnedSemaphorePermit) -> PooledBuffer {
        let mut free = self.free();
        let best_fit = free
            .iter()
            .enumerate()
            .filter(|(_, buf)| buf.len() >= size)
            .min_by_key(|(_, buf)| buf.len())
            .map(|(idx, _)| idx);

        let mut stats = self.stats();
        let data = match best_fit {
            Some(idx) => {
                stats.reuses += 1;
                free.swap_remove(idx)
            }
            None => match free.pop() {
                Some(mut buf) => {
                    // Grow the undersized entry in place of allocating a new one.
                    stats.reallocations += 1;
                    stats.bytes_held -= buf.len();
                    buf.resize(size, 0);
                    stats.bytes_held += buf.len();
                    buf
                }
                None => {
                    stats.allocations += 1;
                    stats.bytes_held += size;
                    vec![0u8; size]
                }
            },
        };

        stats.in_use += 1;
        stats.available = free.len();
        stats.high_water = stats.high_water.max(stats.in_use);

        PooledBuffer {
            data,
            len: size,
            pool: Arc::clone(self),
            _permit: permit,
        }
    }

    fn give_back(&self, data: Vec<u8>) {
        let mut free = self.free();
        free.push(data);
        let mut stats = self.stats();
        stats.in_use = stats.in_use.saturating_sub(1);
        stats.available = free.len();
    }
}

/// Shared handle to the pool. Cloning is cheap.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    pub fn new(capacity: usize) -> Self {
        Self::with_warn_after(capacity, Duration::from_millis(500))
    }

    /// `warn_after` is how long `acquire` waits before logging exhaustion.
    pub fn with_warn_after(capacity: usize, warn_after: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(PoolInner {
                capacity,
                free: Mutex::new(Vec::with_capacity(capacity)),
                permits: Arc::new(Semaphore::new(capacity)),
                stats: Mutex::new(PoolStats::default()),
                warn_after,
            }),
        }
    }

    pub fn from_settings(settings: &PoolSettings) -> Self {
        let pool = Self::with_warn_after(settings.capacity, settings.exhaustion_warn_after());
        let sizes: Vec<usize> = settings
            .prewarm
            .iter()
            .map(|(w, h)| *w as usize * *h as usize * 4)
            .collect();
        pool.prewarm(&sizes);
        pool
    }

    /// Allocates free buffers of the given byte sizes, stopping at capacity.
    pub fn prewarm(&self, sizes: &[usize]) {
        let mut free = self.inner.free();
        let mut stats = self.inner.stats();
        for &size in sizes {
            if free.len() + stats.in_use >= self.inner.capacity {
                break;
            }
            free.push(vec![0u8; size]);
            stats.allocations += 1;
            stats.bytes_held += size;
        }
        stats.available = free.len();
        tracing::debug!(
            "Frame pool prewarmed with {} buffers ({:.1} MB)",
            free.len(),
            stats.memory_mb()
        );
    }

    /// Checks out a buffer of at least `size` bytes, waiting while the pool is exhausted.
    pub async fn acquire(&self, size: usize) -> Result<PooledBuffer, CaptureError> {
        let permits = Arc::clone(&self.inner.permits);
        let permit = match tokio::time::timeout(
            self.inner.warn_after,
            Arc::clone(&permits).acquire_owned(),
        )
        .await
        {
            Ok(permit) => permit,
            Err(_) => {
                self.inner.stats().exhaustion_waits += 1;
                tracing::warn!(
                    "Frame pool exhausted ({} buffers in use), waiting for a release",
                    self.inner.capacity
                );
                permits.acquire_owned().await
            }
        }
        .map_err(|_| CaptureError::PoolClosed)?;

        Ok(self.inner.checkout(size, permit))
    }

    /// Non-waiting variant of [`FramePool::acquire`].
    pub fn try_acquire(&self, size: usize) -> Option<PooledBuffer> {
        let permit = Arc::clone(&self.inner.permits).try_acquire_owned().ok()?;
        Some(self.inner.checkout(size, permit))
    }

    /// Returns a buffer early. Dropping it has the same effect.
    pub fn release(&self, buffer: PooledBuffer) {
        drop(buffer);
    }

    /// Wakes waiters with an error; used at shutdown.
    pub fn close(&self) {
        self.inner.permits.close();
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn stats(&self) -> PoolStats {
        self.inner.stats().clone()
    }
}

/// A checked-out buffer. Returns itself to the pool on drop.
pub struct PooledBuffer {
    data: Vec<u8>,
    len: usize,
    pool: Arc<PoolInner>,
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }
}

impl std::fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len)
            .field("capacity", &self.data.len())
            .finish()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // The permit field is dropped after this runs, so the buffer is on the
        // free list before a waiter can be woken.
        self.pool.give_back(std::mem::take(&mut self.data));
    }
}
