//! Bounded concurrency for async non-pooled opens.
//!
//! Each open is assigned round-robin to one of a fixed number of slots, and
//! opens on the same slot run one after another. Callers give up after the
//! connect timeout; work whose caller already left is skipped, and a result
//! that arrives after its caller left is dropped, which closes a connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, oneshot};
use tracing::{debug, trace, warn};

use crate::error::{InternalError, PoolError, PoolResult};

/// Fixed-width creation throttle.
#[derive(Debug)]
pub struct NonPooledThrottle {
    slots: Box<[Arc<Mutex<()>>]>,
    next: AtomicUsize,
}

impl NonPooledThrottle {
    /// Create a throttle with `width` slots (at least one).
    pub fn new(width: usize) -> Self {
        let slots = (0..width.max(1)).map(|_| Arc::new(Mutex::new(()))).collect();
        Self {
            slots,
            next: AtomicUsize::new(0),
        }
    }

    /// Number of creations that may run at once.
    pub fn width(&self) -> usize {
        self.slots.len()
    }

    /// Run `create` on a blocking thread once its slot is free, waiting at
    /// most `timeout` for the result.
    pub async fn run<T, F>(&self, timeout: Duration, create: F) -> PoolResult<T>
    where
        T: Send + 'static,
        F: FnOnce() -> PoolResult<T> + Send + 'static,
    {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.slots.len();
        let slot = Arc::clone(&self.slots[index]);
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let _turn = slot.lock_owned().await;
            if tx.is_closed() {
                trace!(slot = index, "skipping creation, caller already timed out");
                return;
            }
            let outcome = match tokio::task::spawn_blocking(create).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(slot = index, error = %e, "connection creation task failed");
                    Err(PoolError::internal(InternalError::CreationTaskLost))
                }
            };
            if let Err(Ok(late)) = tx.send(outcome) {
                debug!(slot = index, "creation finished after its caller timed out, disposing");
                drop(late);
            }
        });

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(PoolError::internal(InternalError::CreationTaskLost)),
            Err(_) => Err(PoolError::non_pooled_open_timeout(timeout.as_millis() as u64)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct Tracked(Arc<AtomicBool>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrency_bounded_by_width() {
        let throttle = Arc::new(NonPooledThrottle::new(2));
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let throttle = throttle.clone();
            let running = running.clone();
            let peak = peak.clone();
            tasks.push(tokio::spawn(async move {
                throttle
                    .run(Duration::from_secs(5), move || {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(20));
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let throttle = NonPooledThrottle::new(1);
        let err = throttle
            .run::<(), _>(Duration::from_secs(1), || Err(PoolError::connect("refused")))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "P3001");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timeout_disposes_late_result() {
        let throttle = NonPooledThrottle::new(1);
        let dropped = Arc::new(AtomicBool::new(false));
        let flag = dropped.clone();

        let err = throttle
            .run(Duration::from_millis(20), move || {
                std::thread::sleep(Duration::from_millis(100));
                Ok(Tracked(flag))
            })
            .await
            .err()
            .unwrap();
        assert_eq!(err.code(), "P3003");

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dropped.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_queued_work_skipped_after_timeout() {
        let throttle = Arc::new(NonPooledThrottle::new(1));
        let ran = Arc::new(AtomicBool::new(false));

        let blocker = {
            let throttle = throttle.clone();
            tokio::spawn(async move {
                throttle
                    .run(Duration::from_secs(1), || {
                        std::thread::sleep(Duration::from_millis(150));
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;

        let flag = ran.clone();
        let queued = throttle
            .run(Duration::from_millis(10), move || {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(queued.unwrap_err().code(), "P3003");
        assert!(blocker.await.unwrap().is_ok());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }
}
