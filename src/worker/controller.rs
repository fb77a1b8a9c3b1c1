use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{DispatchConfig, ExecutorConfig};
use crate::error::OrchestratorError;
use crate::scheduler::{
    Delivery, JobPayload, JobRegistry, JobStatus, StatusRecord, StatusWrite, WorkQueue,
};
use crate::worker::executor::{
    ClusterExecutor, WorkloadCondition, WorkloadSpec, SIMULATED_WORKLOAD_REF,
};

/// How a queue item was resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    Failed(String),
    /// The job was already at or past `status`; nothing was done
    Skipped(JobStatus),
    /// Returned to the queue for another attempt
    Requeued,
    /// Shutdown arrived while the workload was being polled
    Interrupted,
}

/// Drives one queued job from PENDING to a terminal status.
///
/// # Flow
///
/// 1. Redelivery guard: a job already RUNNING or terminal is acked and skipped
/// 2. Resolve the payload (queue item first, then the ephemeral record)
/// 3. Write PENDING, then ack the item
/// 4. With the executor disabled, resolve to SUCCEEDED with a simulated reference
/// 5. Create the workload, adopting an existing one on name conflict
/// 6. Write RUNNING with the workload reference
/// 7. Poll until the workload finishes or the poll budget runs out
///
/// Every failure after the ack becomes a FAILED status; nothing is requeued
/// once the item is acknowledged.
#[derive(Clone)]
pub struct DispatchController {
    registry: JobRegistry,
    queue: Arc<dyn WorkQueue>,
    executor: Arc<dyn ClusterExecutor>,
    executor_config: ExecutorConfig,
    poll_interval: Duration,
    poll_budget: Duration,
}

impl DispatchController {
    pub fn new(
        registry: JobRegistry,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<dyn ClusterExecutor>,
        executor_config: ExecutorConfig,
        dispatch: &DispatchConfig,
    ) -> Self {
        Self {
            registry,
            queue,
            executor,
            executor_config,
            poll_interval: dispatch.poll_interval,
            poll_budget: dispatch.poll_budget,
        }
    }

    pub async fn process(&self, delivery: Delivery, token: &CancellationToken) -> DispatchOutcome {
        let job_id = delivery.item.job_id;
        tracing::info!(job_id = %job_id, attempt = delivery.attempt, "Dispatching job");

        match self.registry.current_status(job_id).await {
            Ok(Some(status)) if status == JobStatus::Running || status.is_terminal() => {
                tracing::info!(job_id = %job_id, status = %status, "Job already dispatched, dropping redelivery");
                self.ack(&delivery).await;
                return DispatchOutcome::Skipped(status);
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(job_id = %job_id, error = %e, "Could not read current status, dispatching anyway");
            }
        }

        let payload = match delivery.item.payload.clone() {
            Some(payload) => payload,
            None => match self.registry.load_payload(job_id).await {
                Ok(Some(payload)) => payload,
                Ok(None) => {
                    let outcome = self
                        .fail(job_id, OrchestratorError::NotFound(job_id).to_string())
                        .await;
                    self.ack(&delivery).await;
                    return outcome;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(job_id = %job_id, error = %e, "Payload unavailable, returning item to queue");
                    self.nack(&delivery).await;
                    return DispatchOutcome::Requeued;
                }
                Err(e) => {
                    let outcome = self.fail(job_id, e.to_string()).await;
                    self.ack(&delivery).await;
                    return outcome;
                }
            },
        };

        if let Some(StatusWrite::Rejected { current }) =
            self.write(job_id, StatusRecord::new(JobStatus::Pending)).await
        {
            self.ack(&delivery).await;
            return DispatchOutcome::Skipped(current);
        }
        self.ack(&delivery).await;

        self.drive(job_id, &payload, token).await
    }

    async fn drive(
        &self,
        job_id: Uuid,
        payload: &JobPayload,
        token: &CancellationToken,
    ) -> DispatchOutcome {
        if !self.executor_config.enabled {
            tracing::info!(job_id = %job_id, "Cluster execution disabled, resolving job as simulated");
            self.write(
                job_id,
                StatusRecord::new(JobStatus::Succeeded).with_workload(SIMULATED_WORKLOAD_REF),
            )
            .await;
            return DispatchOutcome::Succeeded;
        }

        let spec = match WorkloadSpec::for_job(job_id, &payload.config, &self.executor_config) {
            Ok(spec) => spec,
            Err(e) => return self.fail(job_id, e.to_string()).await,
        };

        let workload = match self.executor.create(&spec).await {
            Ok(workload) => workload,
            Err(OrchestratorError::WorkloadConflict(existing)) => {
                tracing::warn!(job_id = %job_id, workload = %existing, "Workload already exists, adopting it");
                existing
            }
            Err(e) => return self.fail(job_id, e.to_string()).await,
        };

        if let Some(StatusWrite::Rejected { current }) = self
            .write(
                job_id,
                StatusRecord::new(JobStatus::Running).with_workload(workload.clone()),
            )
            .await
        {
            return DispatchOutcome::Skipped(current);
        }

        self.poll_until_finished(job_id, &workload, token).await
    }

    async fn poll_until_finished(
        &self,
        job_id: Uuid,
        workload: &str,
        token: &CancellationToken,
    ) -> DispatchOutcome {
        let deadline = Instant::now() + self.poll_budget;

        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = self.poll_interval.min(deadline - now);

            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!(job_id = %job_id, workload = %workload, "Shutdown while polling, leaving status unchanged");
                    return DispatchOutcome::Interrupted;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            match self.executor.poll(workload).await {
                Ok(WorkloadCondition::Running) => {
                    tracing::trace!(job_id = %job_id, workload = %workload, "Workload still running");
                }
                Ok(WorkloadCondition::Succeeded) => {
                    tracing::info!(job_id = %job_id, workload = %workload, "Workload succeeded");
                    self.write(
                        job_id,
                        StatusRecord::new(JobStatus::Succeeded).with_workload(workload),
                    )
                    .await;
                    return DispatchOutcome::Succeeded;
                }
                Ok(WorkloadCondition::Failed(reason)) => {
                    return self.fail(job_id, reason).await;
                }
                Err(e) => {
                    tracing::debug!(job_id = %job_id, workload = %workload, error = %e, "Poll failed, retrying next interval");
                }
            }
        }

        tracing::warn!(job_id = %job_id, workload = %workload, budget = ?self.poll_budget, "Workload did not finish within poll budget");
        self.fail(job_id, OrchestratorError::Timeout.to_string()).await
    }

    /// Write FAILED with a non-empty error detail.
    pub async fn fail(&self, job_id: Uuid, error: String) -> DispatchOutcome {
        let error = if error.trim().is_empty() {
            "unknown error".to_string()
        } else {
            error
        };
        tracing::error!(job_id = %job_id, error = %error, "Job failed");
        self.write(job_id, StatusRecord::new(JobStatus::Failed).with_error(error.clone()))
            .await;
        DispatchOutcome::Failed(error)
    }

    async fn write(&self, job_id: Uuid, update: StatusRecord) -> Option<StatusWrite> {
        let status = update.status;
        match self.registry.update_status(job_id, update).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                tracing::warn!(job_id = %job_id, status = %status, error = %e, "Status write failed");
                None
            }
        }
    }

    async fn ack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.ack(delivery).await {
            tracing::debug!(job_id = %delivery.item.job_id, tag = delivery.tag, error = %e, "Ack failed");
        }
    }

    async fn nack(&self, delivery: &Delivery) {
        if let Err(e) = self.queue.nack(delivery).await {
            tracing::warn!(job_id = %delivery.item.job_id, tag = delivery.tag, error = %e, "Nack failed");
        }
    }

    pub(crate) async fn release(&self, delivery: &Delivery) {
        self.ack(delivery).await;
    }
}
