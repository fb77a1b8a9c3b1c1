use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use uuid::Uuid;

use crate::config::{DispatchConfig, StoreConfig};
use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::{
    JobData, JobPayload, JobRecord, JobStatus, JobView, StatusRecord, StatusWrite,
};
use crate::scheduler::reader::StatusReader;
use crate::store::{job_key, status_key, DurableStore, EphemeralStore};

const RETRY_DELAY: Duration = Duration::from_millis(50);
const MAX_SWAP_CONFLICTS: usize = 16;

/// Owns the job record across both stores.
///
/// The ephemeral store is written first and wins whenever both stores hold
/// a record; the durable store is mirrored best-effort and repaired lazily
/// by [`StatusReader`].
#[derive(Clone)]
pub struct JobRegistry {
    ephemeral: Arc<dyn EphemeralStore>,
    durable: Arc<dyn DurableStore>,
    reader: StatusReader,
    ttl: Duration,
    write_attempts: u32,
    durable_timeout: Duration,
}

impl JobRegistry {
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        durable: Arc<dyn DurableStore>,
        store: &StoreConfig,
        dispatch: &DispatchConfig,
    ) -> Self {
        Self {
            reader: StatusReader::new(ephemeral.clone(), durable.clone()),
            ephemeral,
            durable,
            ttl: store.ephemeral_ttl,
            write_attempts: dispatch.status_write_attempts.max(1),
            durable_timeout: dispatch.durable_write_timeout,
        }
    }

    pub fn durable(&self) -> &Arc<dyn DurableStore> {
        &self.durable
    }

    /// Register a new job in QUEUED state and return its id.
    ///
    /// Fails only if the ephemeral write fails. A durable failure after that
    /// is logged; the ephemeral record is never rolled back and the durable
    /// row is rebuilt on a later read.
    pub async fn create(&self, name: Option<String>, config: Value) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let payload = JobPayload::new(name, config);

        let data = JobData {
            status: JobStatus::Queued,
            payload: payload.clone(),
        };
        self.ephemeral
            .set(&job_key(id), serde_json::to_string(&data)?, self.ttl)
            .await?;
        self.ephemeral
            .set(
                &status_key(id),
                serde_json::to_string(&StatusRecord::new(JobStatus::Queued))?,
                self.ttl,
            )
            .await?;

        let record = JobRecord::new(id, payload);
        match tokio::time::timeout(self.durable_timeout, self.durable.insert_job_if_absent(record))
            .await
        {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                tracing::warn!(job_id = %id, "Durable row already existed at creation");
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %id, error = %e, "Durable insert failed, ephemeral record stays authoritative");
            }
            Err(_) => {
                tracing::warn!(job_id = %id, "Durable insert timed out, ephemeral record stays authoritative");
            }
        }

        tracing::info!(job_id = %id, "Job created");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<JobView> {
        self.reader.get(id).await
    }

    /// Load the payload stored at creation, if it has not expired.
    pub async fn load_payload(&self, id: Uuid) -> Result<Option<JobPayload>> {
        match self.ephemeral.get(&job_key(id)).await? {
            Some(raw) => {
                let data: JobData = serde_json::from_str(&raw)?;
                Ok(Some(data.payload))
            }
            None => Ok(None),
        }
    }

    /// Current status, preferring the ephemeral record.
    pub async fn current_status(&self, id: Uuid) -> Result<Option<JobStatus>> {
        if let Some(record) = self.ephemeral_status(id).await? {
            return Ok(Some(record.status));
        }
        Ok(self.durable.get_job(id).await?.map(|r| r.status))
    }

    async fn ephemeral_status(&self, id: Uuid) -> Result<Option<StatusRecord>> {
        match self.ephemeral.get(&status_key(id)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Write a status transition.
    ///
    /// The ephemeral slot is updated by compare-and-swap against the record
    /// read just before, so a write that would move the job backward (or out
    /// of a terminal state) is rejected rather than overwriting. The durable
    /// row is mirrored afterwards; mirror failures are logged only.
    pub async fn update_status(&self, id: Uuid, update: StatusRecord) -> Result<StatusWrite> {
        let mut last_error = None;

        for attempt in 1..=self.write_attempts {
            match self.swap_ephemeral(id, &update).await {
                Ok(StatusWrite::Applied) => {
                    tracing::debug!(job_id = %id, status = %update.status, "Status written");
                    let mirrored = self.merged_for_mirror(id, &update).await;
                    self.mirror(id, mirrored).await;
                    return Ok(StatusWrite::Applied);
                }
                Ok(rejected) => {
                    tracing::info!(job_id = %id, status = %update.status, outcome = ?rejected, "Status write rejected");
                    return Ok(rejected);
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(job_id = %id, attempt, error = %e, "Ephemeral status write failed");
                    last_error = Some(e);
                    tokio::time::sleep(RETRY_DELAY * attempt).await;
                }
                Err(e) => return Err(e),
            }
        }

        // Ephemeral store is down: still record the transition durably so
        // readers falling back to the durable row see progress.
        self.mirror(id, update).await;
        Err(last_error.unwrap_or_else(|| {
            OrchestratorError::TransientStore("status write attempts exhausted".into())
        }))
    }

    async fn swap_ephemeral(&self, id: Uuid, update: &StatusRecord) -> Result<StatusWrite> {
        let key = status_key(id);

        for _ in 0..MAX_SWAP_CONFLICTS {
            let current_raw = self.ephemeral.get(&key).await?;
            let current: Option<StatusRecord> = match &current_raw {
                Some(raw) => Some(serde_json::from_str(raw)?),
                None => None,
            };

            // An expired ephemeral record must not let a stale writer
            // resurrect a job the durable store already finished.
            let current_status = match &current {
                Some(record) => Some(record.status),
                None => self.durable.get_job(id).await.ok().flatten().map(|r| r.status),
            };
            if let Some(status) = current_status {
                if !status.can_transition_to(update.status) {
                    return Ok(StatusWrite::Rejected { current: status });
                }
            }

            let mut next = update.clone();
            if next.workload_ref.is_none() {
                next.workload_ref = current.and_then(|c| c.workload_ref);
            }

            if self
                .ephemeral
                .compare_and_swap(
                    &key,
                    current_raw.as_deref(),
                    serde_json::to_string(&next)?,
                    self.ttl,
                )
                .await?
            {
                return Ok(StatusWrite::Applied);
            }
            tracing::debug!(job_id = %id, "Concurrent status write, retrying");
        }

        Err(OrchestratorError::TransientStore(format!(
            "status of job {} kept changing under compare-and-swap",
            id
        )))
    }

    /// The record as it now stands in the ephemeral slot, so the durable row
    /// receives the carried-forward workload reference too.
    async fn merged_for_mirror(&self, id: Uuid, update: &StatusRecord) -> StatusRecord {
        match self.ephemeral_status(id).await {
            Ok(Some(record)) if record.status == update.status => record,
            _ => update.clone(),
        }
    }

    async fn mirror(&self, id: Uuid, update: StatusRecord) {
        let status = update.status;
        match tokio::time::timeout(self.durable_timeout, self.durable.update_status(id, update))
            .await
        {
            Ok(Ok(StatusWrite::Applied)) => {}
            Ok(Ok(outcome)) => {
                tracing::debug!(job_id = %id, status = %status, outcome = ?outcome, "Durable mirror skipped");
            }
            Ok(Err(e)) => {
                tracing::warn!(job_id = %id, status = %status, error = %e, "Durable mirror failed");
            }
            Err(_) => {
                tracing::warn!(job_id = %id, status = %status, "Durable mirror timed out");
            }
        }
    }
}
