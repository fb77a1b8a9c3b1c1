use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::batch::v1::{Job as K8sJob, JobSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec, ResourceRequirements};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::PostParams;
use kube::Api;
use tokio::sync::OnceCell;

use crate::config::ResourceQuantities;
use crate::error::{OrchestratorError, Result};
use crate::worker::executor::{ClusterExecutor, WorkloadCondition, WorkloadSpec};

const CONTAINER_NAME: &str = "trainer";
const JOB_ID_LABEL: &str = "ml-train/job-id";

/// Runs workloads as `batch/v1` Jobs.
///
/// The client is created on first use from the in-cluster environment or
/// the local kubeconfig.
pub struct KubernetesExecutor {
    namespace: String,
    jobs: OnceCell<Api<K8sJob>>,
}

impl KubernetesExecutor {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            jobs: OnceCell::new(),
        }
    }

    async fn jobs(&self) -> std::result::Result<&Api<K8sJob>, kube::Error> {
        self.jobs
            .get_or_try_init(|| async {
                kube::Client::try_default()
                    .await
                    .map(|client| Api::namespaced(client, &self.namespace))
            })
            .await
    }
}

fn quantities(q: &ResourceQuantities) -> BTreeMap<String, Quantity> {
    BTreeMap::from([
        ("memory".to_string(), Quantity(q.memory.clone())),
        ("cpu".to_string(), Quantity(q.cpu.clone())),
    ])
}

/// Build the Job manifest for a workload spec.
pub fn job_manifest(spec: &WorkloadSpec) -> K8sJob {
    let labels = BTreeMap::from([
        ("app".to_string(), "ml-train".to_string()),
        (JOB_ID_LABEL.to_string(), spec.job_id.to_string()),
    ]);

    let env = spec
        .env
        .iter()
        .map(|(name, value)| EnvVar {
            name: name.clone(),
            value: Some(value.clone()),
            value_from: None,
        })
        .collect::<Vec<_>>();

    K8sJob {
        metadata: ObjectMeta {
            name: Some(spec.name.clone()),
            namespace: Some(spec.namespace.clone()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(spec.backoff_limit),
            ttl_seconds_after_finished: Some(spec.ttl_seconds_after_finished),
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    restart_policy: Some("OnFailure".to_string()),
                    containers: vec![Container {
                        name: CONTAINER_NAME.to_string(),
                        image: Some(spec.image.clone()),
                        command: Some(spec.command.clone()),
                        args: Some(spec.args.clone()),
                        env: if env.is_empty() { None } else { Some(env) },
                        resources: Some(ResourceRequirements {
                            requests: Some(quantities(&spec.requests)),
                            limits: Some(quantities(&spec.limits)),
                            ..Default::default()
                        }),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        status: None,
    }
}

/// Terminal condition of a Job, if it has reached one.
///
/// `Complete`/`Failed` conditions are set by the Job controller once the
/// retry budget is resolved; the succeeded counter covers clusters that
/// report completion before the condition appears.
pub fn job_condition(job: &K8sJob) -> WorkloadCondition {
    let Some(status) = &job.status else {
        return WorkloadCondition::Running;
    };

    for condition in status.conditions.iter().flatten() {
        if condition.status != "True" {
            continue;
        }
        match condition.type_.as_str() {
            "Complete" => return WorkloadCondition::Succeeded,
            "Failed" => {
                let reason = condition
                    .message
                    .clone()
                    .or_else(|| condition.reason.clone())
                    .filter(|r| !r.is_empty())
                    .unwrap_or_else(|| "workload failed".to_string());
                return WorkloadCondition::Failed(reason);
            }
            _ => {}
        }
    }

    if status.succeeded.unwrap_or(0) > 0 {
        WorkloadCondition::Succeeded
    } else {
        WorkloadCondition::Running
    }
}

#[async_trait]
impl ClusterExecutor for KubernetesExecutor {
    async fn create(&self, spec: &WorkloadSpec) -> Result<String> {
        let jobs = self
            .jobs()
            .await
            .map_err(|e| OrchestratorError::Submission(format!("cluster client: {}", e)))?;

        match jobs.create(&PostParams::default(), &job_manifest(spec)).await {
            Ok(_) => {
                tracing::info!(job_id = %spec.job_id, workload = %spec.name, namespace = %spec.namespace, "Workload created");
                Ok(spec.name.clone())
            }
            Err(kube::Error::Api(response)) if response.code == 409 => {
                Err(OrchestratorError::WorkloadConflict(spec.name.clone()))
            }
            Err(kube::Error::Api(response)) => Err(OrchestratorError::Submission(format!(
                "{} ({})",
                response.message, response.reason
            ))),
            Err(e) => Err(OrchestratorError::Submission(e.to_string())),
        }
    }

    async fn poll(&self, workload: &str) -> Result<WorkloadCondition> {
        let jobs = self
            .jobs()
            .await
            .map_err(|e| OrchestratorError::Cluster(e.to_string()))?;
        let job = jobs
            .get(workload)
            .await
            .map_err(|e| OrchestratorError::Cluster(e.to_string()))?;
        Ok(job_condition(&job))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use k8s_openapi::api::batch::v1::{JobCondition, JobStatus as K8sJobStatus};
    use serde_json::json;
    use uuid::Uuid;

    fn spec() -> WorkloadSpec {
        let mut config = ExecutorConfig::default();
        config.env.push(("REDIS_URL".to_string(), "redis://redis:6379/0".to_string()));
        WorkloadSpec::for_job(Uuid::new_v4(), &json!({"epochs": 1}), &config).unwrap()
    }

    fn job_with(status: K8sJobStatus) -> K8sJob {
        K8sJob {
            status: Some(status),
            ..Default::default()
        }
    }

    fn condition(type_: &str, status: &str, message: Option<&str>) -> JobCondition {
        JobCondition {
            type_: type_.to_string(),
            status: status.to_string(),
            message: message.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn manifest_matches_workload_spec() {
        let spec = spec();
        let job = job_manifest(&spec);

        assert_eq!(job.metadata.name.as_deref(), Some(spec.name.as_str()));
        assert_eq!(job.metadata.namespace.as_deref(), Some("ml-train"));

        let job_spec = job.spec.unwrap();
        assert_eq!(job_spec.backoff_limit, Some(2));
        assert_eq!(job_spec.ttl_seconds_after_finished, Some(3600));

        let pod = job_spec.template.spec.unwrap();
        assert_eq!(pod.restart_policy.as_deref(), Some("OnFailure"));
        let container = &pod.containers[0];
        assert_eq!(container.name, "trainer");
        assert_eq!(container.image.as_deref(), Some("ml-trainer:latest"));
        assert_eq!(container.args.as_ref().unwrap()[0], "--job-id");
        assert_eq!(container.env.as_ref().unwrap()[0].name, "REDIS_URL");

        let resources = container.resources.as_ref().unwrap();
        let requests = resources.requests.as_ref().unwrap();
        assert_eq!(requests["memory"], Quantity("2Gi".to_string()));
        assert_eq!(requests["cpu"], Quantity("1".to_string()));
        let limits = resources.limits.as_ref().unwrap();
        assert_eq!(limits["memory"], Quantity("4Gi".to_string()));
    }

    #[test]
    fn job_without_status_is_running() {
        assert_eq!(job_condition(&K8sJob::default()), WorkloadCondition::Running);
    }

    #[test]
    fn complete_condition_is_success() {
        let job = job_with(K8sJobStatus {
            conditions: Some(vec![condition("Complete", "True", None)]),
            ..Default::default()
        });
        assert_eq!(job_condition(&job), WorkloadCondition::Succeeded);
    }

    #[test]
    fn failed_condition_carries_message() {
        let job = job_with(K8sJobStatus {
            conditions: Some(vec![condition(
                "Failed",
                "True",
                Some("Job has reached the specified backoff limit"),
            )]),
            ..Default::default()
        });
        assert_eq!(
            job_condition(&job),
            WorkloadCondition::Failed("Job has reached the specified backoff limit".to_string())
        );
    }

    #[test]
    fn failed_pods_within_backoff_are_still_running() {
        let job = job_with(K8sJobStatus {
            failed: Some(1),
            active: Some(1),
            ..Default::default()
        });
        assert_eq!(job_condition(&job), WorkloadCondition::Running);
    }

    #[test]
    fn inactive_conditions_are_ignored() {
        let job = job_with(K8sJobStatus {
            conditions: Some(vec![condition("Failed", "False", None)]),
            succeeded: Some(1),
            ..Default::default()
        });
        assert_eq!(job_condition(&job), WorkloadCondition::Succeeded);
    }
}
