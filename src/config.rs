use std::path::PathBuf;
use std::time::Duration;

/// Fixed task name shared by submission and dispatch.
pub const QUEUE_TASK_NAME: &str = "orchestrator.tasks.process_training_job";

/// Fixed pub/sub channel the training workload publishes metrics on.
pub const METRICS_CHANNEL: &str = "ml_train:metrics";

/// CPU/memory quantities in Kubernetes notation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceQuantities {
    /// Memory quantity (e.g., "2Gi")
    pub memory: String,
    /// CPU quantity (e.g., "1" or "500m")
    pub cpu: String,
}

impl ResourceQuantities {
    pub fn new(memory: impl Into<String>, cpu: impl Into<String>) -> Self {
        Self {
            memory: memory.into(),
            cpu: cpu.into(),
        }
    }
}

/// Configuration for the cluster executor that runs training workloads.
///
/// When `enabled` is false the dispatch controller never contacts the
/// cluster and resolves every job to SUCCEEDED with a sentinel workload
/// reference.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub enabled: bool,
    /// Container image holding the trainer entrypoint
    pub image: String,
    /// Namespace workloads are created in
    pub namespace: String,
    /// Entrypoint command; `--job-id`/`--config` are appended as args
    pub command: Vec<String>,
    pub requests: ResourceQuantities,
    pub limits: ResourceQuantities,
    /// Retries the cluster performs internally before marking the workload failed
    pub backoff_limit: i32,
    /// How long a finished workload is retained before garbage collection
    pub ttl_seconds_after_finished: i32,
    /// Workload names are `<prefix><first 8 chars of job id>`
    pub name_prefix: String,
    /// Extra environment passed into the trainer container
    pub env: Vec<(String, String)>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            image: "ml-trainer:latest".to_string(),
            namespace: "ml-train".to_string(),
            command: vec![
                "python".to_string(),
                "-m".to_string(),
                "training.main".to_string(),
            ],
            requests: ResourceQuantities::new("2Gi", "1"),
            limits: ResourceQuantities::new("4Gi", "2"),
            backoff_limit: 2,
            ttl_seconds_after_finished: 3600,
            name_prefix: "ml-train-".to_string(),
            env: Vec::new(),
        }
    }
}

impl ExecutorConfig {
    /// Executor config for local runs without a cluster.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Number of parallel dispatch workers
    pub workers: usize,
    /// Delay between workload status queries
    pub poll_interval: Duration,
    /// Wall-clock budget before a non-terminal workload is declared timed out
    pub poll_budget: Duration,
    /// Attempts for a status write before the error is handed back to the caller
    pub status_write_attempts: u32,
    /// Upper bound on how long a durable mirror write may hold up the caller
    pub durable_write_timeout: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            poll_interval: Duration::from_secs(5),
            poll_budget: Duration::from_secs(2 * 60 * 60),
            status_write_attempts: 3,
            durable_write_timeout: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// TTL applied to `job:<id>` and `job_status:<id>` ephemeral keys
    pub ephemeral_ttl: Duration,
    /// SQLite file for the durable store. `None` keeps it in memory.
    pub database_path: Option<PathBuf>,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            ephemeral_ttl: Duration::from_secs(24 * 60 * 60),
            database_path: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MetricsConfig {
    pub channel: String,
    /// Delay before the supervised subscriber is restarted after a failure
    pub restart_backoff: Duration,
    /// Attempts per metric write while the durable store is unavailable
    pub write_attempts: u32,
    /// First retry delay; doubles on every further attempt
    pub write_backoff: Duration,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            channel: METRICS_CHANNEL.to_string(),
            restart_backoff: Duration::from_secs(5),
            write_attempts: 6,
            write_backoff: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct OrchestratorConfig {
    pub executor: ExecutorConfig,
    pub dispatch: DispatchConfig,
    pub store: StoreConfig,
    pub metrics: MetricsConfig,
}

impl OrchestratorConfig {
    pub fn new(executor: ExecutorConfig) -> Self {
        Self {
            executor,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.dispatch.workers = workers;
        self
    }

    pub fn with_poll(mut self, interval: Duration, budget: Duration) -> Self {
        self.dispatch.poll_interval = interval;
        self.dispatch.poll_budget = budget;
        self
    }

    pub fn with_database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store.database_path = Some(path.into());
        self
    }

    pub fn with_restart_backoff(mut self, backoff: Duration) -> Self {
        self.metrics.restart_backoff = backoff;
        self
    }

    pub fn with_metrics_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.metrics.write_attempts = attempts;
        self.metrics.write_backoff = backoff;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn executor_config_default() {
        let cfg = ExecutorConfig::default();
        assert!(cfg.enabled);
        assert_eq!(cfg.image, "ml-trainer:latest");
        assert_eq!(cfg.namespace, "ml-train");
        assert_eq!(cfg.requests, ResourceQuantities::new("2Gi", "1"));
        assert_eq!(cfg.limits, ResourceQuantities::new("4Gi", "2"));
        assert_eq!(cfg.backoff_limit, 2);
        assert_eq!(cfg.ttl_seconds_after_finished, 3600);
        assert_eq!(cfg.name_prefix, "ml-train-");
    }

    #[test]
    fn executor_config_disabled_keeps_other_defaults() {
        let cfg = ExecutorConfig::disabled();
        assert!(!cfg.enabled);
        assert_eq!(cfg.image, "ml-trainer:latest");
    }

    #[test]
    fn dispatch_config_default() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.poll_interval, Duration::from_secs(5));
        assert_eq!(cfg.poll_budget, Duration::from_secs(7200));
        assert_eq!(cfg.status_write_attempts, 3);
    }

    #[test]
    fn store_config_default() {
        let cfg = StoreConfig::default();
        assert_eq!(cfg.ephemeral_ttl, Duration::from_secs(86_400));
        assert!(cfg.database_path.is_none());
    }

    #[test]
    fn orchestrator_config_builders() {
        let cfg = OrchestratorConfig::new(ExecutorConfig::disabled())
            .with_workers(2)
            .with_poll(Duration::from_millis(10), Duration::from_millis(100))
            .with_database_path("/tmp/jobs.db")
            .with_restart_backoff(Duration::from_millis(50))
            .with_metrics_retry(3, Duration::from_millis(5));
        assert!(!cfg.executor.enabled);
        assert_eq!(cfg.dispatch.workers, 2);
        assert_eq!(cfg.dispatch.poll_interval, Duration::from_millis(10));
        assert_eq!(cfg.dispatch.poll_budget, Duration::from_millis(100));
        assert_eq!(
            cfg.store.database_path.as_deref(),
            Some(std::path::Path::new("/tmp/jobs.db"))
        );
        assert_eq!(cfg.metrics.restart_backoff, Duration::from_millis(50));
        assert_eq!(cfg.metrics.channel, METRICS_CHANNEL);
        assert_eq!(cfg.metrics.write_attempts, 3);
        assert_eq!(cfg.metrics.write_backoff, Duration::from_millis(5));
    }
}
