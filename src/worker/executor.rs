use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::config::{ExecutorConfig, ResourceQuantities};
use crate::error::Result;

/// Workload reference recorded for jobs resolved without a cluster.
pub const SIMULATED_WORKLOAD_REF: &str = "(simulated)";

/// Everything the cluster needs to run one training job to completion.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkloadSpec {
    pub job_id: Uuid,
    /// Deterministic per job, so a second create for the same job conflicts
    pub name: String,
    pub namespace: String,
    pub image: String,
    pub command: Vec<String>,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub requests: ResourceQuantities,
    pub limits: ResourceQuantities,
    pub backoff_limit: i32,
    pub ttl_seconds_after_finished: i32,
}

impl WorkloadSpec {
    /// `<prefix><first 8 characters of the job id>`
    pub fn workload_name(prefix: &str, job_id: Uuid) -> String {
        let id = job_id.to_string();
        format!("{}{}", prefix, &id[..8])
    }

    pub fn for_job(job_id: Uuid, config: &Value, executor: &ExecutorConfig) -> Result<Self> {
        let args = vec![
            "--job-id".to_string(),
            job_id.to_string(),
            "--config".to_string(),
            serde_json::to_string(config)?,
        ];

        Ok(Self {
            job_id,
            name: Self::workload_name(&executor.name_prefix, job_id),
            namespace: executor.namespace.clone(),
            image: executor.image.clone(),
            command: executor.command.clone(),
            args,
            env: executor.env.clone(),
            requests: executor.requests.clone(),
            limits: executor.limits.clone(),
            backoff_limit: executor.backoff_limit,
            ttl_seconds_after_finished: executor.ttl_seconds_after_finished,
        })
    }
}

/// Observed state of a workload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadCondition {
    Running,
    Succeeded,
    Failed(String),
}

/// A cluster scheduler able to run a workload to completion.
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    /// Submit the workload and return its reference.
    ///
    /// Fails with `WorkloadConflict` when a workload with the same name
    /// already exists and with `Submission` when the cluster rejects it.
    async fn create(&self, spec: &WorkloadSpec) -> Result<String>;

    /// Query the workload. Errors are transient (`Cluster`).
    async fn poll(&self, workload: &str) -> Result<WorkloadCondition>;
}
