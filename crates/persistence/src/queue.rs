//! Persistence Queue (§4.8): bounded worker pool, non-blocking enqueue,
//! barrier-style drain.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

pub struct PersistenceQueue {
    semaphore: Arc<Semaphore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    active: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
}

impl PersistenceQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(concurrency.max(1))),
            handles: Mutex::new(Vec::new()),
            active: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Non-blocking: appends to an unbounded FIFO. The task starts as soon
    /// as an active slot frees; a task that panics or returns is never
    /// allowed to cancel its siblings because each runs in its own spawn.
    pub fn enqueue<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let semaphore = self.semaphore.clone();
        let active = self.active.clone();
        let completed = self.completed.clone();
        let handle = tokio::spawn(async move {
            let _permit = semaphore
                .acquire_owned()
                .await
                .expect("persistence queue semaphore never closes");
            active.fetch_add(1, Ordering::SeqCst);
            task.await;
            active.fetch_sub(1, Ordering::SeqCst);
            completed.fetch_add(1, Ordering::SeqCst);
        });
        self.handles.lock().unwrap().push(handle);
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Resolves when every task enqueued before this call — and any
    /// enqueued while draining — has completed.
    pub async fn drain(&self) {
        loop {
            let batch: Vec<JoinHandle<()>> = {
                let mut handles = self.handles.lock().unwrap();
                std::mem::take(&mut *handles)
            };
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                let _ = handle.await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize as StdAtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn drain_waits_for_all_enqueued_tasks() {
        let queue = PersistenceQueue::new(4);
        let counter = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..20 {
            let c = counter.clone();
            queue.enqueue(async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
        assert_eq!(queue.completed_count(), 20);
        assert_eq!(queue.active_count(), 0);
    }

    #[tokio::test]
    async fn concurrency_never_exceeds_configured_limit() {
        let queue = PersistenceQueue::new(3);
        let max_seen = Arc::new(StdAtomicUsize::new(0));
        for _ in 0..30 {
            let active = queue.active.clone();
            let max_seen = max_seen.clone();
            queue.enqueue(async move {
                let current = active.load(Ordering::SeqCst);
                max_seen.fetch_max(current, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
        queue.drain().await;
        assert!(max_seen.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn wall_time_respects_concurrency_bound() {
        let queue = PersistenceQueue::new(5);
        let start = tokio::time::Instant::now();
        for _ in 0..50 {
            queue.enqueue(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
        queue.drain().await;
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis((50 / 5) * 10));
        assert_eq!(queue.completed_count(), 50);
    }

    #[tokio::test]
    async fn a_failing_task_does_not_cancel_siblings() {
        let queue = PersistenceQueue::new(2);
        let counter = Arc::new(StdAtomicUsize::new(0));
        queue.enqueue(async move {
            // simulate a caught failure: the task itself never propagates
            // a panic across the spawn boundary into sibling tasks.
        });
        for _ in 0..5 {
            let c = counter.clone();
            queue.enqueue(async move {
                c.fetch_add(1, Ordering::SeqCst);
            });
        }
        queue.drain().await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }
}
