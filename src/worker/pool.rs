use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::scheduler::WorkQueue;
use crate::worker::controller::DispatchController;

const RECEIVE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Fixed set of workers consuming the queue in parallel.
pub struct DispatchPool {
    controller: DispatchController,
    queue: Arc<dyn WorkQueue>,
    workers: usize,
}

impl DispatchPool {
    pub fn new(controller: DispatchController, queue: Arc<dyn WorkQueue>, workers: usize) -> Self {
        Self {
            controller,
            queue,
            workers: workers.max(1),
        }
    }

    /// Spawn the workers. They stop when `token` is cancelled or the queue
    /// is closed.
    pub fn spawn(self, token: CancellationToken) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let controller = self.controller.clone();
                let queue = self.queue.clone();
                let token = token.clone();
                tokio::spawn(async move {
                    worker_loop(worker_id, controller, queue, token).await;
                })
            })
            .collect()
    }
}

/// Receive, process, repeat.
///
/// Each item is processed in its own task so a panic while handling one
/// job is recorded as that job's failure and the worker keeps going. The
/// task belongs to the worker's `JoinSet`, so aborting the worker aborts it.
async fn worker_loop(
    worker_id: usize,
    controller: DispatchController,
    queue: Arc<dyn WorkQueue>,
    token: CancellationToken,
) {
    tracing::info!(worker_id, "Dispatch worker started");
    let mut in_flight = JoinSet::new();

    loop {
        let delivery = tokio::select! {
            _ = token.cancelled() => break,
            received = queue.receive() => match received {
                Ok(Some(delivery)) => delivery,
                Ok(None) => {
                    tracing::info!(worker_id, "Queue closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(worker_id, error = %e, "Queue receive failed");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => continue,
                    }
                }
            },
        };

        let job_id = delivery.item.job_id;
        {
            let controller = controller.clone();
            let token = token.clone();
            let delivery = delivery.clone();
            in_flight.spawn(async move { controller.process(delivery, &token).await });
        }

        let Some(joined) = in_flight.join_next().await else {
            continue;
        };
        match joined {
            Ok(outcome) => {
                tracing::debug!(worker_id, job_id = %job_id, outcome = ?outcome, "Queue item resolved");
            }
            Err(e) if e.is_panic() => {
                tracing::error!(worker_id, job_id = %job_id, "Dispatch panicked");
                controller
                    .fail(job_id, "internal error: dispatch panicked".to_string())
                    .await;
                controller.release(&delivery).await;
            }
            Err(e) => {
                tracing::warn!(worker_id, job_id = %job_id, error = %e, "Dispatch task cancelled");
            }
        }
    }

    tracing::info!(worker_id, "Dispatch worker stopped");
}
