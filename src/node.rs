use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::{OrchestratorConfig, QUEUE_TASK_NAME};
use crate::error::Result;
use crate::metrics::{job_metrics, supervise, MetricSeries, MetricsIngestor};
use crate::scheduler::{
    JobPayload, JobRecord, JobRegistry, JobStatus, JobView, MemoryQueue, QueueItem, StatusRecord,
    WorkQueue,
};
use crate::store::{DurableStore, EphemeralStore, MemoryEphemeralStore, SqliteStore};
use crate::worker::{ClusterExecutor, DispatchController, DispatchPool, KubernetesExecutor};

/// Default page size for [`Node::list_jobs`].
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Owns every running component of the orchestrator.
///
/// The process entry point builds one `Node`, calls [`Node::start`] to spawn
/// the dispatch workers and the supervised metrics ingestor, and calls
/// [`Node::shutdown`] when it is time to stop. All background tasks observe
/// the node's cancellation token.
pub struct Node {
    pub config: OrchestratorConfig,
    pub ephemeral: Arc<dyn EphemeralStore>,
    pub durable: Arc<dyn DurableStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub executor: Arc<dyn ClusterExecutor>,
    pub registry: JobRegistry,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn new(
        config: OrchestratorConfig,
        ephemeral: Arc<dyn EphemeralStore>,
        durable: Arc<dyn DurableStore>,
        queue: Arc<dyn WorkQueue>,
        executor: Arc<dyn ClusterExecutor>,
    ) -> Self {
        let registry = JobRegistry::new(
            ephemeral.clone(),
            durable.clone(),
            &config.store,
            &config.dispatch,
        );
        Self {
            config,
            ephemeral,
            durable,
            queue,
            executor,
            registry,
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Build a node on the shipped backends: in-process ephemeral store and
    /// queue, SQLite durable store, Kubernetes executor.
    pub fn from_config(config: OrchestratorConfig) -> Result<Self> {
        let durable: Arc<dyn DurableStore> = match &config.store.database_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(SqliteStore::open_in_memory()?),
        };
        let executor = Arc::new(KubernetesExecutor::new(config.executor.namespace.clone()));

        Ok(Self::new(
            config,
            Arc::new(MemoryEphemeralStore::new()),
            durable,
            Arc::new(MemoryQueue::new(QUEUE_TASK_NAME)),
            executor,
        ))
    }

    /// Token cancelled when the node shuts down. Hand it to signal handlers.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Spawn the dispatch pool and the supervised metrics ingestor.
    pub fn start(&mut self) {
        if !self.tasks.is_empty() {
            tracing::warn!("Node already started");
            return;
        }

        let controller = DispatchController::new(
            self.registry.clone(),
            self.queue.clone(),
            self.executor.clone(),
            self.config.executor.clone(),
            &self.config.dispatch,
        );
        let pool = DispatchPool::new(controller, self.queue.clone(), self.config.dispatch.workers);
        self.tasks.extend(pool.spawn(self.token.clone()));

        let ingestor = Arc::new(
            MetricsIngestor::new(
                self.ephemeral.clone(),
                self.durable.clone(),
                self.config.metrics.channel.clone(),
            )
            .with_retry(self.config.metrics.write_attempts, self.config.metrics.write_backoff),
        );
        let backoff = self.config.metrics.restart_backoff;
        let token = self.token.clone();
        self.tasks.push(tokio::spawn(async move {
            let restarts = supervise("metrics-ingestor", backoff, token, move || {
                let ingestor = ingestor.clone();
                async move { ingestor.run().await }
            })
            .await;
            tracing::info!(restarts, "Metrics ingestor stopped");
        }));

        tracing::info!(
            workers = self.config.dispatch.workers,
            executor_enabled = self.config.executor.enabled,
            "Node started"
        );
    }

    /// Register a job and put it on the queue.
    ///
    /// If the enqueue fails the job is marked FAILED with the queue error
    /// so it never sits in QUEUED with nothing to pick it up.
    pub async fn submit(&self, name: Option<String>, config: Value) -> Result<Uuid> {
        let id = self.registry.create(name.clone(), config.clone()).await?;

        if let Err(e) = self
            .queue
            .enqueue(QueueItem::new(id, JobPayload::new(name, config)))
            .await
        {
            tracing::error!(job_id = %id, error = %e, "Enqueue failed");
            let failed = StatusRecord::new(JobStatus::Failed).with_error(e.to_string());
            if let Err(write_err) = self.registry.update_status(id, failed).await {
                tracing::warn!(job_id = %id, error = %write_err, "Could not record enqueue failure");
            }
            return Err(e);
        }

        tracing::info!(job_id = %id, "Job submitted");
        Ok(id)
    }

    pub async fn get(&self, id: Uuid) -> Result<JobView> {
        self.registry.get(id).await
    }

    /// Newest-first page of durable job rows.
    pub async fn list_jobs(&self, limit: usize, status: Option<JobStatus>) -> Result<Vec<JobRecord>> {
        self.durable.list_jobs(limit, status).await
    }

    pub async fn metrics(&self, id: Uuid, name: Option<&str>) -> Result<MetricSeries> {
        job_metrics(self.durable.as_ref(), &id.to_string(), name).await
    }

    /// Cancel background work and wait up to `grace` for it to finish.
    ///
    /// Jobs being polled keep their last written status. Tasks still running
    /// after the grace period are aborted.
    pub async fn shutdown(&mut self, grace: Duration) {
        tracing::info!("Node shutting down");
        self.token.cancel();
        self.queue.close().await;

        let tasks = std::mem::take(&mut self.tasks);
        let aborts: Vec<_> = tasks.iter().map(|t| t.abort_handle()).collect();
        let joined = tokio::time::timeout(grace, async {
            for task in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Background task panicked");
                    }
                }
            }
        })
        .await;

        if joined.is_err() {
            tracing::warn!(grace = ?grace, "Grace period elapsed, aborting remaining tasks");
            for abort in aborts {
                abort.abort();
            }
        }
        tracing::info!("Node stopped");
    }
}
