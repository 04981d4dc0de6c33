//! Pass scheduling.
//!
//! Passes sharing a key run one after another in submission order; passes
//! with different keys run concurrently, bounded by a semaphore. Each
//! submission returns a [`PassHandle`] that resolves once the pass is done.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tracing::debug;

use crate::error::{TepMgrError, TepMgrResult};

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Completion handle of a queued pass.
#[derive(Debug)]
pub struct PassHandle<T> {
    key: String,
    rx: oneshot::Receiver<TepMgrResult<T>>,
}

impl<T> PassHandle<T> {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Waits for the pass. A pass dropped before it reported resolves to
    /// [`TepMgrError::JobCancelled`].
    pub async fn wait(self) -> TepMgrResult<T> {
        let PassHandle { key, rx } = self;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(TepMgrError::JobCancelled { key }),
        }
    }
}

/// Per-key serial queues over a bounded worker budget.
pub struct JobCoordinator {
    queues: Mutex<HashMap<String, mpsc::UnboundedSender<Job>>>,
    permits: Arc<Semaphore>,
}

impl JobCoordinator {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
        }
    }

    /// Queues `pass` behind earlier passes with the same key.
    ///
    /// Must be called from within a tokio runtime.
    pub fn enqueue<F, T>(&self, key: impl Into<String>, pass: F) -> PassHandle<T>
    where
        F: Future<Output = TepMgrResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let key = key.into();
        let (tx, rx) = oneshot::channel();
        let permits = self.permits.clone();
        let job_key = key.clone();

        let job: Job = Box::pin(async move {
            // A closed semaphore drops `tx`, which cancels the handle.
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let result = pass.await;
            if tx.send(result).is_err() {
                debug!(key = %job_key, "pass finished after its handle was dropped");
            }
        });

        self.dispatch(&key, job);
        PassHandle { key, rx }
    }

    fn dispatch(&self, key: &str, job: Job) {
        let mut queues = self.queues.lock();
        let job = match queues.get(key) {
            Some(sender) => match sender.send(job) {
                Ok(()) => return,
                // worker went away (a pass panicked); start a new one
                Err(mpsc::error::SendError(job)) => job,
            },
            None => job,
        };

        let (sender, mut receiver) = mpsc::unbounded_channel::<Job>();
        let worker_key = key.to_string();
        tokio::spawn(async move {
            debug!(key = %worker_key, "pass worker started");
            job.await;
            while let Some(next) = receiver.recv().await {
                next.await;
            }
            debug!(key = %worker_key, "pass worker stopped");
        });
        queues.insert(key.to_string(), sender);
    }

    /// Number of keys with a live worker.
    pub fn queue_count(&self) -> usize {
        self.queues.lock().len()
    }

    /// Lets every worker drain its queue and exit.
    pub fn shutdown(&self) {
        self.queues.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_key_runs_in_order() {
        let jobs = JobCoordinator::new(4);
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5u64 {
            let log = log.clone();
            handles.push(jobs.enqueue("Z1", async move {
                // later jobs finish faster if run concurrently
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                log.lock().push(i);
                Ok(i)
            }));
        }
        for (i, handle) in handles.into_iter().enumerate() {
            assert_eq!(handle.key(), "Z1");
            assert_eq!(handle.wait().await.unwrap(), i as u64);
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(jobs.queue_count(), 1);
    }

    #[tokio::test]
    async fn test_different_keys_run_concurrently() {
        let jobs = JobCoordinator::new(2);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocked = jobs.enqueue("Z1", async move {
            release_rx.await.ok();
            Ok("z1")
        });
        // Z2 completes while Z1 is still waiting
        let free = jobs.enqueue("Z2", async { Ok("z2") });
        assert_eq!(free.wait().await.unwrap(), "z2");

        release_tx.send(()).unwrap();
        assert_eq!(blocked.wait().await.unwrap(), "z1");
        assert_eq!(jobs.queue_count(), 2);
    }

    #[tokio::test]
    async fn test_errors_are_delivered() {
        let jobs = JobCoordinator::new(1);
        let handle: PassHandle<()> = jobs.enqueue("Z1", async {
            Err(TepMgrError::validation("zone", "empty"))
        });
        assert!(matches!(
            handle.wait().await,
            Err(TepMgrError::Validation { .. })
        ));
    }

    async fn explode() -> TepMgrResult<()> {
        panic!("pass blew up")
    }

    #[tokio::test]
    async fn test_panicking_pass_cancels_handle_and_queue_recovers() {
        let jobs = JobCoordinator::new(1);
        let handle = jobs.enqueue("Z1", explode());
        assert!(matches!(
            handle.wait().await,
            Err(TepMgrError::JobCancelled { .. })
        ));

        // the worker is gone; the next pass gets a fresh one
        let next = jobs.enqueue("Z1", async { Ok(7) });
        assert_eq!(next.wait().await.unwrap(), 7);
    }
}
