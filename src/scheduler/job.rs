use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::OrchestratorError;

/// Job lifecycle status.
///
/// Statuses form a monotone lattice: QUEUED < PENDING < RUNNING < terminal.
/// A write may keep or advance the rank of a non-terminal job; terminal
/// jobs accept no further writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn rank(self) -> u8 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Pending => 1,
            JobStatus::Running => 2,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether a job currently in `self` may be moved to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        !self.is_terminal() && next.rank() >= self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            other => Err(OrchestratorError::Internal(format!(
                "unknown job status: {}",
                other
            ))),
        }
    }
}

/// Caller-supplied part of a job: display name plus an opaque config document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct JobPayload {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub config: Value,
}

impl JobPayload {
    pub fn new(name: Option<String>, config: Value) -> Self {
        Self { name, config }
    }
}

/// Ephemeral `job:<id>` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobData {
    pub status: JobStatus,
    #[serde(flatten)]
    pub payload: JobPayload,
}

/// Ephemeral `job_status:<id>` record, also the unit of a status write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workload_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StatusRecord {
    pub fn new(status: JobStatus) -> Self {
        Self {
            status,
            workload_ref: None,
            error: None,
        }
    }

    pub fn with_workload(mut self, workload_ref: impl Into<String>) -> Self {
        self.workload_ref = Some(workload_ref.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Outcome of a guarded status write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusWrite {
    Applied,
    /// The write would have moved the job backward or out of a terminal state.
    Rejected { current: JobStatus },
    /// No record exists to update.
    Missing,
}

/// Durable job row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: Uuid,
    pub name: Option<String>,
    pub status: JobStatus,
    pub config: Value,
    pub workload_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub fn new(id: Uuid, payload: JobPayload) -> Self {
        let now = Utc::now();
        Self {
            id,
            name: payload.name,
            status: JobStatus::Queued,
            config: payload.config,
            workload_ref: None,
            error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Minimal row for a job only known through its metrics.
    pub fn placeholder(id: Uuid) -> Self {
        let mut record = Self::new(id, JobPayload::new(None, Value::Object(Default::default())));
        record.status = JobStatus::Running;
        record
    }

    /// Row rebuilt from ephemeral state when the durable insert was lost.
    pub fn from_ephemeral(id: Uuid, payload: JobPayload, status: &StatusRecord) -> Self {
        let mut record = Self::new(id, payload);
        record.apply(status);
        record
    }

    /// Apply a status write to this row, maintaining the lifecycle timestamps.
    pub fn apply(&mut self, update: &StatusRecord) {
        let now = Utc::now();
        self.status = update.status;
        if update.workload_ref.is_some() {
            self.workload_ref = update.workload_ref.clone();
        }
        if update.error.is_some() {
            self.error = update.error.clone();
        }
        if update.status == JobStatus::Running && self.started_at.is_none() {
            self.started_at = Some(now);
        }
        if update.status.is_terminal() && self.finished_at.is_none() {
            self.finished_at = Some(now);
        }
        self.updated_at = now;
    }

    pub fn payload(&self) -> JobPayload {
        JobPayload::new(self.name.clone(), self.config.clone())
    }
}

/// Which store a [`JobView`] was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ViewSource {
    Ephemeral,
    Durable,
}

/// Merged, read-side view of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobView {
    pub id: Uuid,
    pub name: Option<String>,
    pub status: JobStatus,
    pub config: Value,
    pub workload_ref: Option<String>,
    pub error: Option<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub source: ViewSource,
}

impl JobView {
    pub fn from_record(record: JobRecord) -> Self {
        Self {
            id: record.id,
            name: record.name,
            status: record.status,
            config: record.config,
            workload_ref: record.workload_ref,
            error: record.error,
            created_at: Some(record.created_at),
            started_at: record.started_at,
            finished_at: record.finished_at,
            source: ViewSource::Durable,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn forward_transitions_allowed() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Pending));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Succeeded));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Failed));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
    }

    #[test]
    fn same_rank_rewrite_allowed_for_live_jobs() {
        assert!(JobStatus::Running.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Pending));
    }

    #[test]
    fn backward_and_post_terminal_transitions_rejected() {
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Pending));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Failed.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Cancelled.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&JobStatus::Succeeded).unwrap(), "\"succeeded\"");
        assert_eq!("RUNNING".parse::<JobStatus>().unwrap(), JobStatus::Running);
        assert!("bogus".parse::<JobStatus>().is_err());
    }

    #[test]
    fn status_record_omits_empty_fields() {
        let encoded = serde_json::to_value(StatusRecord::new(JobStatus::Pending)).unwrap();
        assert_eq!(encoded, json!({"status": "pending"}));

        let encoded = serde_json::to_value(
            StatusRecord::new(JobStatus::Failed).with_error("boom"),
        )
        .unwrap();
        assert_eq!(encoded, json!({"status": "failed", "error": "boom"}));
    }

    #[test]
    fn job_data_flattens_payload() {
        let data = JobData {
            status: JobStatus::Queued,
            payload: JobPayload::new(Some("mnist".into()), json!({"epochs": 1})),
        };
        let encoded = serde_json::to_value(&data).unwrap();
        assert_eq!(
            encoded,
            json!({"status": "queued", "name": "mnist", "config": {"epochs": 1}})
        );
    }

    #[test]
    fn apply_sets_lifecycle_timestamps() {
        let mut record = JobRecord::new(Uuid::new_v4(), JobPayload::default());
        assert!(record.started_at.is_none());

        record.apply(&StatusRecord::new(JobStatus::Running).with_workload("ml-train-abc"));
        assert!(record.started_at.is_some());
        assert!(record.finished_at.is_none());
        assert_eq!(record.workload_ref.as_deref(), Some("ml-train-abc"));

        record.apply(&StatusRecord::new(JobStatus::Succeeded));
        assert!(record.finished_at.is_some());
        // workload reference survives a write that doesn't carry one
        assert_eq!(record.workload_ref.as_deref(), Some("ml-train-abc"));
    }

    #[test]
    fn placeholder_is_running_with_empty_config() {
        let record = JobRecord::placeholder(Uuid::new_v4());
        assert_eq!(record.status, JobStatus::Running);
        assert_eq!(record.config, json!({}));
        assert!(record.name.is_none());
    }
}
