use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_stream::StreamExt;

use crate::config::MetricsConfig;
use crate::error::{OrchestratorError, Result};
use crate::metrics::MetricMessage;
use crate::scheduler::job::JobRecord;
use crate::store::{DurableStore, EphemeralStore};

/// Persists metric points published by running workloads.
///
/// Writes are permissive: a point for a dispatched job with no durable row
/// creates a placeholder row (RUNNING, empty config) rather than being
/// dropped. Points reported under an id that is not a job UUID are stored
/// as-is without a job row. Durable writes that fail transiently are
/// retried with a doubling delay.
pub struct MetricsIngestor {
    ephemeral: Arc<dyn EphemeralStore>,
    durable: Arc<dyn DurableStore>,
    channel: String,
    write_attempts: u32,
    write_backoff: Duration,
}

impl MetricsIngestor {
    pub fn new(
        ephemeral: Arc<dyn EphemeralStore>,
        durable: Arc<dyn DurableStore>,
        channel: impl Into<String>,
    ) -> Self {
        let defaults = MetricsConfig::default();
        Self {
            ephemeral,
            durable,
            channel: channel.into(),
            write_attempts: defaults.write_attempts,
            write_backoff: defaults.write_backoff,
        }
    }

    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.write_attempts = attempts.max(1);
        self.write_backoff = backoff;
        self
    }

    /// Subscribe and ingest until the subscription is lost.
    ///
    /// Malformed messages are logged and skipped, as are messages whose
    /// writes still fail after the retry budget.
    /// Always returns an error: the caller is expected to restart it.
    pub async fn run(&self) -> Result<()> {
        let mut subscription = self.ephemeral.subscribe(&self.channel).await?;
        tracing::info!(channel = %self.channel, "Subscribed to metrics channel");

        while let Some(item) = subscription.next().await {
            let raw = match item {
                Ok(raw) => raw,
                Err(e) => {
                    tracing::warn!(channel = %self.channel, error = %e, "Metrics subscription error");
                    continue;
                }
            };

            match self.ingest(&raw).await {
                Ok(stored) => tracing::trace!(stored, "Metrics message ingested"),
                Err(OrchestratorError::MalformedMessage(reason)) => {
                    tracing::warn!(reason = %reason, "Skipping malformed metrics message");
                }
                Err(e) => {
                    tracing::error!(
                        error = %e,
                        attempts = self.write_attempts,
                        "Giving up on metrics message"
                    );
                }
            }
        }

        Err(OrchestratorError::TransientStore(format!(
            "subscription to {} closed",
            self.channel
        )))
    }

    /// Decode one message and persist a point per metric field.
    /// Returns the number of points stored.
    pub async fn ingest(&self, raw: &str) -> Result<usize> {
        let message = MetricMessage::parse(raw)?;

        match message.dispatched_job() {
            Some(job_id) => {
                let inserted = self
                    .retrying(|| self.durable.insert_job_if_absent(JobRecord::placeholder(job_id)))
                    .await?;
                if inserted {
                    tracing::info!(job_id = %job_id, "Created placeholder job row for metrics");
                }
            }
            None => {
                tracing::debug!(job_id = %message.job_id, "Metrics for a job not dispatched here");
            }
        }

        let points = message.into_points();
        let count = points.len();
        for point in points {
            self.retrying(|| self.durable.insert_metric(point.clone()))
                .await?;
        }
        Ok(count)
    }

    async fn retrying<T, F, Fut>(&self, mut write: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut delay = self.write_backoff;
        let mut attempt = 1;
        loop {
            match write().await {
                Err(e) if e.is_transient() && attempt < self.write_attempts => {
                    tracing::warn!(attempt, error = %e, "Metrics write failed, retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
                result => return result,
            }
        }
    }
}
