//! Bounded FIFO worker pool.
//!
//! Webhook handlers stay short: they enqueue and answer. A fixed set of
//! spawned tasks drains the queue; when the queue is full the caller gets
//! [`QueueFull`] and the HTTP layer answers 503 so GitHub re-delivers.

use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Error)]
#[error("worker queue full")]
pub struct QueueFull;

pub struct WorkerPool<T: Send + 'static> {
    name: &'static str,
    tx: mpsc::Sender<T>,
}

impl<T: Send + 'static> WorkerPool<T> {
    /// Spawn `workers` drainers over a queue of `queue_depth` slots.
    pub fn new<F, Fut>(name: &'static str, workers: usize, queue_depth: usize, handler: F) -> Self
    where
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel::<T>(queue_depth.max(1));
        let rx = Arc::new(Mutex::new(rx));
        let handler = Arc::new(handler);

        for worker_id in 0..workers.max(1) {
            let rx = Arc::clone(&rx);
            let handler = Arc::clone(&handler);
            tokio::spawn(async move {
                loop {
                    // The receiver lock is held only while popping; idle
                    // workers queue on the mutex, not on the job.
                    let job = rx.lock().await.recv().await;
                    match job {
                        Some(job) => handler(job).await,
                        None => {
                            tracing::debug!(pool = name, worker_id, "Worker pool channel closed");
                            break;
                        }
                    }
                }
            });
        }

        Self { name, tx }
    }

    /// Enqueue without blocking. `Err(QueueFull)` when the queue is at depth.
    pub fn try_enqueue(&self, job: T) -> Result<(), QueueFull> {
        self.tx.try_send(job).map_err(|e| {
            tracing::warn!(pool = self.name, "Queue full, rejecting job");
            drop(e);
            QueueFull
        })
    }
}
