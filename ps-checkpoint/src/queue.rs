//! A single-thread save queue: jobs run strictly one at a time, in the
//! order enqueued, matching spec.md §9's "single-reactor-with-wakeup-
//! channel" description of the original's save/load event loop.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Background worker that serializes checkpoint writes so a save never
/// competes with another save for disk bandwidth, and never runs on the
/// caller's own task (the caller enqueues and returns immediately).
pub struct SaveQueue {
    tx: mpsc::UnboundedSender<Job>,
    _worker: JoinHandle<()>,
}

impl SaveQueue {
    pub fn spawn() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let worker = tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    error!(error = %e, "checkpoint save task panicked");
                }
            }
        });
        SaveQueue { tx, _worker: worker }
    }

    /// Enqueue `job`; `false` means the worker task has already exited.
    pub fn enqueue(&self, job: impl FnOnce() + Send + 'static) -> bool {
        self.tx.send(Box::new(job)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn jobs_run_in_enqueue_order() {
        let queue = SaveQueue::spawn();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let counter = Arc::new(AtomicUsize::new(0));
        for i in 0..5 {
            let order = order.clone();
            let counter = counter.clone();
            queue.enqueue(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                order.lock().unwrap().push(i);
            });
        }
        // Give the background task a chance to drain; this is a
        // best-effort smoke test, not a strict ordering guarantee across
        // an unbounded wait.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 5);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }
}
