//! Bounded worker pool with fail-fast submission.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio_util::task::TaskTracker;

use crate::error::CoordinationError;

/// Runs submitted tasks concurrently, at most `capacity` at a time.
///
/// Submission never waits: when every slot is busy the task is rejected with
/// [`CoordinationError::PoolSaturated`].
#[derive(Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    capacity: usize,
}

impl WorkerPool {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            tracker: TaskTracker::new(),
            capacity,
        }
    }

    /// Spawn `task` if a slot is free.
    pub fn submit<F>(&self, task: F) -> Result<(), CoordinationError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permit = self.permits.clone().try_acquire_owned().map_err(|_| CoordinationError::PoolSaturated {
            capacity: self.capacity,
        })?;
        self.tracker.spawn(async move {
            // Slot is held until the task finishes.
            let _permit = permit;
            task.await;
        });
        Ok(())
    }

    /// Tasks currently running.
    pub fn in_flight(&self) -> usize {
        self.capacity - self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Wait for every submitted task to finish.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::atomic::Ordering;

    use tokio::sync::oneshot;

    use super::*;

    #[tokio::test]
    async fn rejects_when_saturated() {
        let pool = WorkerPool::new(2);
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let release_rx = Arc::new(tokio::sync::Mutex::new(Some(release_rx)));

        for _ in 0..2 {
            let release_rx = release_rx.clone();
            pool.submit(async move {
                let rx = release_rx.lock().await.take();
                if let Some(rx) = rx {
                    let _ = rx.await;
                } else {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                }
            })
            .unwrap();
        }

        assert_eq!(pool.in_flight(), 2);
        assert!(matches!(pool.submit(async {}), Err(CoordinationError::PoolSaturated { capacity: 2 })));

        release_tx.send(()).unwrap();
        pool.drain().await;
        assert_eq!(pool.in_flight(), 0);
        assert!(pool.submit(async {}).is_ok());
    }

    #[tokio::test]
    async fn runs_every_accepted_task() {
        let pool = WorkerPool::new(8);
        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let done = done.clone();
            pool.submit(async move {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        pool.drain().await;
        assert_eq!(done.load(Ordering::SeqCst), 8);
    }
}
