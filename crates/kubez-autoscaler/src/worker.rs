//! Worker pool
//!
//! Each worker loops "dequeue, reconcile, release" until the queue shuts
//! down. Workers alone decide what happens to a failed key: transient
//! errors go back on the queue with backoff, permanent ones are dropped
//! until the next change to the workload, and invariant violations stop
//! the worker that hit them.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use kubez_common::Error;

use crate::queue::WorkQueue;
use crate::reconciler::{reconcile, Context};
use crate::workload::WorkloadKey;

/// Process keys until the queue shuts down.
///
/// Returns `Err` only for invariant violations.
pub async fn run_worker(
    id: usize,
    queue: Arc<WorkQueue<WorkloadKey>>,
    ctx: Arc<Context>,
) -> Result<(), Error> {
    debug!(worker = id, "Worker started");
    while let Some(item) = queue.dequeue().await {
        let key = item.key().clone();
        match reconcile(&key, &ctx).await {
            Ok(outcome) => {
                queue.forget(&key);
                debug!(worker = id, %key, ?outcome, "Reconciliation completed");
            }
            Err(e) if e.is_fatal() => {
                error!(worker = id, %key, error = %e, "Invariant violated, stopping worker");
                queue.forget(&key);
                return Err(e);
            }
            Err(e) if e.is_retryable() => {
                let attempt = queue.num_requeues(&key) + 1;
                let delay = queue.requeue_with_backoff(key.clone());
                warn!(
                    worker = id,
                    %key,
                    error = %e,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "Reconciliation failed, retrying"
                );
            }
            Err(e) => {
                queue.forget(&key);
                warn!(worker = id, %key, error = %e, "Reconciliation failed permanently, not retrying");
            }
        }
        // Releasing the item re-queues the key if it changed meanwhile
        drop(item);
    }
    debug!(worker = id, "Worker stopped");
    Ok(())
}

/// Fixed set of worker tasks sharing one queue
pub struct WorkerPool {
    tasks: JoinSet<(usize, Result<(), Error>)>,
}

impl WorkerPool {
    /// Spawn `workers` tasks (at least one)
    pub fn spawn(workers: usize, queue: Arc<WorkQueue<WorkloadKey>>, ctx: Arc<Context>) -> Self {
        let mut tasks = JoinSet::new();
        for id in 0..workers.max(1) {
            let queue = Arc::clone(&queue);
            let ctx = Arc::clone(&ctx);
            tasks.spawn(async move { (id, run_worker(id, queue, ctx).await) });
        }
        info!(workers = tasks.len(), "Started reconcile workers");
        Self { tasks }
    }

    /// Number of workers still running
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether every worker has exited
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Wait for every worker to exit, logging how each one ended.
    ///
    /// Returns the number of workers that stopped abnormally.
    pub async fn join(mut self) -> usize {
        let mut failed = 0;
        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok((id, Ok(()))) => debug!(worker = id, "Worker exited"),
                Ok((id, Err(e))) => {
                    failed += 1;
                    error!(worker = id, error = %e, remaining = self.tasks.len(), "Worker exited with error");
                }
                Err(e) => {
                    failed += 1;
                    error!(error = %e, remaining = self.tasks.len(), "Worker task panicked");
                }
            }
        }
        failed
    }
}
