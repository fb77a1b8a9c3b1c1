use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::scheduler::job::{JobData, JobRecord, JobView, StatusRecord, StatusWrite, ViewSource};
use crate::store::{job_key, status_key, DurableStore, EphemeralStore};

/// Upper bound on the durable lookup that fills in an ephemeral view.
const DURABLE_LOOKUP_TIMEOUT: Duration = Duration::from_millis(250);

/// What a read-triggered repair did to the durable row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    InSync,
    /// Durable row was missing and was rebuilt from the ephemeral record
    Inserted,
    Updated,
    /// Durable row could not be repaired (no payload to rebuild from, or the
    /// row is ahead of the ephemeral record)
    Skipped,
}

/// Answers job queries by merging the two stores.
///
/// The ephemeral status wins when present. In that case the durable row is
/// brought in line by a background repair so the read never waits on a
/// durable write. Jobs whose ephemeral records expired are served from the
/// durable row.
#[derive(Clone)]
pub struct StatusReader {
    ephemeral: Arc<dyn EphemeralStore>,
    durable: Arc<dyn DurableStore>,
}

impl StatusReader {
    pub fn new(ephemeral: Arc<dyn EphemeralStore>, durable: Arc<dyn DurableStore>) -> Self {
        Self { ephemeral, durable }
    }

    pub async fn get(&self, id: Uuid) -> Result<JobView> {
        if let Some(status) = self.ephemeral_status(id).await {
            let data = self.ephemeral_data(id).await;

            let reader = self.clone();
            let repair_status = status.clone();
            let repair_data = data.clone();
            tokio::spawn(async move {
                match reader.repair(id, repair_status, repair_data).await {
                    Ok(RepairOutcome::InSync) => {}
                    Ok(outcome) => tracing::debug!(job_id = %id, ?outcome, "Durable row repaired"),
                    Err(e) => tracing::warn!(job_id = %id, error = %e, "Durable repair failed"),
                }
            });

            return Ok(self.ephemeral_view(id, status, data).await);
        }

        match self.durable.get_job(id).await? {
            Some(record) => Ok(JobView::from_record(record)),
            None => Err(OrchestratorError::NotFound(id)),
        }
    }

    /// Bring the durable row in line with the ephemeral status record.
    pub async fn repair(
        &self,
        id: Uuid,
        status: StatusRecord,
        data: Option<JobData>,
    ) -> Result<RepairOutcome> {
        match self.durable.get_job(id).await? {
            None => match data {
                Some(data) => {
                    let record = JobRecord::from_ephemeral(id, data.payload, &status);
                    if self.durable.insert_job_if_absent(record).await? {
                        Ok(RepairOutcome::Inserted)
                    } else {
                        Ok(RepairOutcome::Skipped)
                    }
                }
                None => Ok(RepairOutcome::Skipped),
            },
            Some(row) if row.status == status.status => Ok(RepairOutcome::InSync),
            Some(_) => match self.durable.update_status(id, status).await? {
                StatusWrite::Applied => Ok(RepairOutcome::Updated),
                StatusWrite::Rejected { .. } | StatusWrite::Missing => Ok(RepairOutcome::Skipped),
            },
        }
    }

    /// Status fields come from the ephemeral record. Lifecycle timestamps
    /// (and the payload, if it expired first) come from the durable row
    /// when it answers within [`DURABLE_LOOKUP_TIMEOUT`]; otherwise they are
    /// left empty.
    async fn ephemeral_view(&self, id: Uuid, status: StatusRecord, data: Option<JobData>) -> JobView {
        let row = match tokio::time::timeout(DURABLE_LOOKUP_TIMEOUT, self.durable.get_job(id)).await {
            Ok(Ok(row)) => row,
            Ok(Err(e)) => {
                tracing::debug!(job_id = %id, error = %e, "Durable row unavailable for view");
                None
            }
            Err(_) => {
                tracing::debug!(job_id = %id, "Durable lookup timed out");
                None
            }
        };

        let (name, config) = match (data, &row) {
            (Some(data), _) => (data.payload.name, data.payload.config),
            (None, Some(row)) => (row.name.clone(), row.config.clone()),
            (None, None) => (None, serde_json::Value::Null),
        };
        let (created_at, started_at, finished_at) = match row {
            Some(row) => (Some(row.created_at), row.started_at, row.finished_at),
            None => (None, None, None),
        };
        JobView {
            id,
            name,
            status: status.status,
            config,
            workload_ref: status.workload_ref,
            error: status.error,
            created_at,
            started_at,
            finished_at,
            source: ViewSource::Ephemeral,
        }
    }

    async fn ephemeral_status(&self, id: Uuid) -> Option<StatusRecord> {
        match self.ephemeral.get(&status_key(id)).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Unreadable ephemeral status record");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::warn!(job_id = %id, error = %e, "Ephemeral store unavailable, reading durable row");
                None
            }
        }
    }

    async fn ephemeral_data(&self, id: Uuid) -> Option<JobData> {
        match self.ephemeral.get(&job_key(id)).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            _ => None,
        }
    }
}
