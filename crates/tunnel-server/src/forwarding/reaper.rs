//! Background retirement of finished workers.
//!
//! Workers register with [`Reaper::track`] and call [`Reaper::signal`] once
//! they have marked themselves inactive. The reaper task wakes, shuts down and
//! forgets every inactive worker, then sleeps until the next signal. One
//! reaper may serve many connections.

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info};

static NEXT_WORKER_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-unique worker id.
pub fn next_worker_id() -> u64 {
    NEXT_WORKER_ID.fetch_add(1, Ordering::Relaxed)
}

/// A concurrent worker the reaper can retire.
pub trait Worker: Send + Sync {
    /// Process-unique id, see [`next_worker_id`].
    fn worker_id(&self) -> u64;

    /// `false` once the worker has finished (or been told to stop).
    fn is_active(&self) -> bool;

    /// Ask the worker to stop and, if `join`, wait for its task to exit.
    /// Must be a no-op on an already stopped worker.
    fn shutdown(&self, join: bool) -> BoxFuture<'_, ()>;
}

/// Tracks workers and retires inactive ones when signalled.
pub struct Reaper {
    tracked: Mutex<HashMap<u64, Arc<dyn Worker>>>,
    wake: Notify,
    closed: AtomicBool,
}

impl Reaper {
    pub fn new() -> Self {
        Self {
            tracked: Mutex::new(HashMap::new()),
            wake: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Spawn the reaper loop. It runs until [`Reaper::close`].
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let reaper = self.clone();
        tokio::spawn(async move {
            reaper.run().await;
            debug!("reaper loop ended");
        })
    }

    /// Add a worker to the tracked set.
    pub fn track(&self, worker: Arc<dyn Worker>) {
        let id = worker.worker_id();
        self.lock_tracked().insert(id, worker);
        debug!(worker_id = id, "worker tracked");
    }

    /// Request a reap pass. Signals sent before the loop wakes coalesce.
    pub fn signal(&self) {
        self.wake.notify_one();
    }

    /// Number of tracked workers.
    pub fn tracked(&self) -> usize {
        self.lock_tracked().len()
    }

    /// Run one pass: shut down and forget every inactive worker.
    ///
    /// Returns how many workers were removed by this pass.
    pub async fn reap(&self) -> usize {
        let finished: Vec<Arc<dyn Worker>> = self
            .lock_tracked()
            .values()
            .filter(|w| !w.is_active())
            .cloned()
            .collect();

        let mut removed = 0;
        for worker in finished {
            let id = worker.worker_id();
            worker.shutdown(true).await;
            if self.lock_tracked().remove(&id).is_some() {
                removed += 1;
            } else {
                debug!(worker_id = id, "worker already removed");
            }
        }

        if removed > 0 {
            debug!(count = removed, "reaped workers");
        }
        removed
    }

    /// Stop every tracked worker without waiting for in-flight pumps and
    /// forget all of them.
    pub async fn shutdown_all(&self) {
        let workers: Vec<Arc<dyn Worker>> = self.lock_tracked().drain().map(|(_, w)| w).collect();
        if workers.is_empty() {
            return;
        }
        info!(count = workers.len(), "shutting down tracked workers");
        for worker in workers {
            worker.shutdown(false).await;
        }
    }

    /// End the reaper loop after one final pass.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.wake.notify_one();
    }

    async fn run(&self) {
        loop {
            self.wake.notified().await;
            self.reap().await;
            if self.closed.load(Ordering::Relaxed) {
                break;
            }
        }
    }

    fn lock_tracked(&self) -> MutexGuard<'_, HashMap<u64, Arc<dyn Worker>>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Reaper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct TestWorker {
        id: u64,
        active: AtomicBool,
        shutdowns: AtomicUsize,
    }

    impl TestWorker {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: next_worker_id(),
                active: AtomicBool::new(true),
                shutdowns: AtomicUsize::new(0),
            })
        }

        fn finish(&self) {
            self.active.store(false, Ordering::Relaxed);
        }
    }

    impl Worker for TestWorker {
        fn worker_id(&self) -> u64 {
            self.id
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::Relaxed)
        }

        fn shutdown(&self, _join: bool) -> BoxFuture<'_, ()> {
            Box::pin(async move {
                self.active.store(false, Ordering::Relaxed);
                self.shutdowns.fetch_add(1, Ordering::Relaxed);
            })
        }
    }

    async fn wait_for_tracked(reaper: &Reaper, expected: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while reaper.tracked() != expected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reaper did not converge");
    }

    #[tokio::test]
    async fn test_reap_removes_only_inactive() {
        let reaper = Reaper::new();
        let done = TestWorker::new();
        let running = TestWorker::new();
        reaper.track(done.clone());
        reaper.track(running.clone());

        done.finish();
        assert_eq!(reaper.reap().await, 1);
        assert_eq!(reaper.tracked(), 1);
        assert_eq!(done.shutdowns.load(Ordering::Relaxed), 1);
        assert_eq!(running.shutdowns.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_signal_wakes_loop() {
        let reaper = Arc::new(Reaper::new());
        let handle = reaper.start();

        let worker = TestWorker::new();
        reaper.track(worker.clone());
        worker.finish();
        reaper.signal();
        wait_for_tracked(&reaper, 0).await;

        // A removed worker is never visited again.
        reaper.signal();
        reaper.signal();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(worker.shutdowns.load(Ordering::Relaxed), 1);

        reaper.close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_signals_before_start_coalesce() {
        let reaper = Arc::new(Reaper::new());
        let worker = TestWorker::new();
        reaper.track(worker.clone());
        worker.finish();
        for _ in 0..10 {
            reaper.signal();
        }

        let handle = reaper.start();
        wait_for_tracked(&reaper, 0).await;
        reaper.close();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_all_clears() {
        let reaper = Reaper::new();
        let a = TestWorker::new();
        let b = TestWorker::new();
        reaper.track(a.clone());
        reaper.track(b.clone());

        reaper.shutdown_all().await;
        assert_eq!(reaper.tracked(), 0);
        assert!(!a.is_active());
        assert!(!b.is_active());
        assert_eq!(reaper.reap().await, 0);
    }
}
