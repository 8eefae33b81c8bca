//! Fixed-capacity request queue drained by a fixed worker pool

use conduit_storage::{RequestScope, Result, StorageError};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub workers: usize,
    /// Jobs waiting for a worker before submissions are refused
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            workers: 8,
            capacity: 256,
        }
    }
}

type Job = BoxFuture<'static, ()>;

/// Bounded job queue with explicit back-pressure
///
/// `submit` waits for the job's result but refuses immediately with
/// `QueueFull` once `capacity` jobs are waiting. Workers are spawned on the
/// current tokio runtime.
pub struct RequestQueue {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    capacity: usize,
}

impl RequestQueue {
    pub fn new(workers: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, receiver) = mpsc::channel::<Job>(capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));

        let handles = (0..workers.max(1))
            .map(|id| {
                let receiver = Arc::clone(&receiver);
                tokio::spawn(async move {
                    loop {
                        let job = { receiver.lock().await.recv().await };
                        match job {
                            Some(job) => job.await,
                            None => break,
                        }
                    }
                    trace!(worker = id, "queue worker exiting");
                })
            })
            .collect();

        Self {
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(handles),
            capacity,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(config.workers, config.capacity)
    }

    /// Queue `job` and wait for its result
    ///
    /// Cancelling the scope stops the wait; a job that has not started yet
    /// is then skipped by its worker.
    pub async fn submit<T, F>(&self, scope: &RequestScope, job: F) -> Result<T>
    where
        F: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        scope.check()?;
        let sender = self.sender.lock().clone().ok_or(StorageError::Shutdown)?;

        let (done, result) = oneshot::channel();
        let wrapped = async move {
            if done.is_closed() {
                return;
            }
            let _ = done.send(job.await);
        }
        .boxed();

        sender.try_send(wrapped).map_err(|e| match e {
            TrySendError::Full(_) => {
                debug!(capacity = self.capacity, "request queue full");
                StorageError::QueueFull {
                    capacity: self.capacity,
                }
            }
            TrySendError::Closed(_) => StorageError::Shutdown,
        })?;

        scope
            .run(async { result.await.map_err(|_| StorageError::Shutdown)? })
            .await
    }

    /// Jobs waiting for a worker
    pub fn queued(&self) -> usize {
        self.sender
            .lock()
            .as_ref()
            .map(|sender| self.capacity - sender.capacity())
            .unwrap_or(0)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    /// Refuse new jobs, let queued jobs finish and wait for the workers
    pub async fn shutdown(&self) {
        self.sender.lock().take();
        let workers: Vec<JoinHandle<()>> = std::mem::take(&mut *self.workers.lock());
        for worker in workers {
            let _ = worker.await;
        }
        debug!("request queue shut down");
    }
}
