//! Counting admission gate shared by every probe of a run

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{AcquireError, OwnedSemaphorePermit, Semaphore};

/// Default number of probes allowed in flight at once
pub const DEFAULT_MAX_CONNECTIONS: usize = 1000;

/// Above this many simultaneous sockets most hosts hit their descriptor limit
pub const MAX_CONNECTIONS_WARN_THRESHOLD: usize = 4096;

#[derive(Debug)]
struct Inner {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    holders: AtomicUsize,
    peak: AtomicUsize,
}

/// Bounds how many probes are connected at the same time.
///
/// Built on a tokio [`Semaphore`]; admission is not FIFO-sensitive for
/// callers and never blocks while fewer than `capacity` permits are held.
/// The holder counter is bookkeeping for observability; the semaphore is
/// what enforces the bound.
#[derive(Debug, Clone)]
pub struct Governor {
    inner: Arc<Inner>,
}

impl Governor {
    /// `capacity` is clamped to at least one slot
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Arc::new(Inner {
                semaphore: Arc::new(Semaphore::new(capacity)),
                capacity,
                holders: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }),
        }
    }

    /// Wait for a free slot. The slot is released when the returned permit is
    /// dropped, including when the holding task is aborted or unwinds.
    pub async fn acquire(&self) -> Result<Permit, AcquireError> {
        let permit = Arc::clone(&self.inner.semaphore).acquire_owned().await?;
        let now = self.inner.holders.fetch_add(1, Ordering::AcqRel) + 1;
        self.inner.peak.fetch_max(now, Ordering::AcqRel);
        Ok(Permit {
            _permit: permit,
            inner: Arc::clone(&self.inner),
        })
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Permits currently held
    pub fn in_flight(&self) -> usize {
        self.inner.holders.load(Ordering::Acquire)
    }

    /// Highest number of permits held at once since creation
    pub fn peak(&self) -> usize {
        self.inner.peak.load(Ordering::Acquire)
    }

    /// Stop admitting. Pending and future `acquire` calls fail.
    pub fn close(&self) {
        self.inner.semaphore.close();
    }
}

impl Default for Governor {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_CONNECTIONS)
    }
}

/// Scoped slot; dropping it frees the slot
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    inner: Arc<Inner>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        // Decrement before the semaphore permit field is dropped so the
        // counter never shows more holders than the semaphore allows.
        self.inner.holders.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_capacity_clamped() {
        assert_eq!(Governor::new(0).capacity(), 1);
        assert_eq!(Governor::new(25).capacity(), 25);
        assert_eq!(Governor::default().capacity(), DEFAULT_MAX_CONNECTIONS);
    }

    #[tokio::test]
    async fn test_permit_released_on_drop() {
        let governor = Governor::new(2);
        let a = governor.acquire().await.unwrap();
        let b = governor.acquire().await.unwrap();
        assert_eq!(governor.in_flight(), 2);
        drop(a);
        assert_eq!(governor.in_flight(), 1);
        drop(b);
        assert_eq!(governor.in_flight(), 0);
        assert_eq!(governor.peak(), 2);
    }

    #[tokio::test]
    async fn test_acquire_blocks_when_full() {
        let governor = Governor::new(1);
        let held = governor.acquire().await.unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), governor.acquire()).await;
        assert!(blocked.is_err());

        drop(held);
        let admitted = tokio::time::timeout(Duration::from_millis(500), governor.acquire()).await;
        assert!(admitted.is_ok());
    }

    #[tokio::test]
    async fn test_released_when_task_aborted() {
        let governor = Governor::new(4);
        let g = governor.clone();
        let handle = tokio::spawn(async move {
            let _permit = g.acquire().await.unwrap();
            tokio::time::sleep(Duration::from_secs(60)).await;
        });
        while governor.in_flight() == 0 {
            tokio::task::yield_now().await;
        }
        handle.abort();
        let _ = handle.await;
        assert_eq!(governor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_released_when_task_panics() {
        let governor = Governor::new(4);
        let g = governor.clone();
        let handle = tokio::spawn(async move {
            let _permit = g.acquire().await.unwrap();
            panic!("probe blew up");
        });
        assert!(handle.await.is_err());
        assert_eq!(governor.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_closed_governor_rejects() {
        let governor = Governor::new(1);
        governor.close();
        assert!(governor.acquire().await.is_err());
    }
}
