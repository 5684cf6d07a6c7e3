use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::error::CallError;

/// Caps the number of calls between "publish issued" and "result resolved".
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    semaphore: Arc<Semaphore>,
    limit: usize,
}

/// Slot held for the lifetime of one call. Released on drop, including when
/// the call future is cancelled.
#[derive(Debug)]
pub struct CallPermit {
    _permit: OwnedSemaphorePermit,
}

impl ConcurrencyLimiter {
    pub fn new(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit,
        }
    }

    /// Waits for a free slot. Fails with `EngineStopped` once closed,
    /// including for callers already queued.
    pub async fn acquire(&self) -> Result<CallPermit, CallError> {
        Arc::clone(&self.semaphore)
            .acquire_owned()
            .await
            .map(|permit| CallPermit { _permit: permit })
            .map_err(|_| CallError::EngineStopped)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.limit.saturating_sub(self.available())
    }

    pub fn close(&self) {
        self.semaphore.close();
    }

    pub fn is_closed(&self) -> bool {
        self.semaphore.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::ConcurrencyLimiter;
    use crate::error::CallError;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn never_exceeds_limit_under_burst() {
        let limiter = ConcurrencyLimiter::new(3);
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..20)
            .map(|_| {
                let limiter = limiter.clone();
                let active = Arc::clone(&active);
                let peak = Arc::clone(&peak);
                tokio::spawn(async move {
                    let _permit = limiter.acquire().await.expect("acquire");
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.expect("task");
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn dropping_permit_releases_slot() {
        let limiter = ConcurrencyLimiter::new(1);
        let permit = limiter.acquire().await.expect("acquire");
        assert_eq!(limiter.in_flight(), 1);
        assert_eq!(limiter.available(), 0);
        drop(permit);
        assert_eq!(limiter.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancelled_acquire_does_not_leak() {
        let limiter = ConcurrencyLimiter::new(1);
        let held = limiter.acquire().await.expect("acquire");
        let waiting = tokio::time::timeout(Duration::from_millis(10), limiter.acquire()).await;
        assert!(waiting.is_err());
        drop(held);
        let _again = limiter.acquire().await.expect("slot free again");
    }

    #[tokio::test]
    async fn close_wakes_queued_callers() {
        let limiter = ConcurrencyLimiter::new(1);
        let _held = limiter.acquire().await.expect("acquire");
        let queued = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.acquire().await })
        };
        tokio::task::yield_now().await;
        limiter.close();
        assert_eq!(
            queued.await.expect("task").expect_err("closed"),
            CallError::EngineStopped
        );
        assert!(limiter.is_closed());
    }

    #[test]
    fn zero_limit_is_clamped() {
        assert_eq!(ConcurrencyLimiter::new(0).limit(), 1);
    }
}
