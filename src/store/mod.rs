//! Access contracts for the two state stores.
//!
//! - [`EphemeralStore`]: low-latency key/value store with per-key TTL and
//!   pub/sub. Authoritative for live jobs; records may expire.
//! - [`DurableStore`]: relational store of record. Holds exactly one row per
//!   job and the full metric history; never expires.
//!
//! The shipped backends are [`MemoryEphemeralStore`] and [`SqliteStore`].

pub mod durable;
pub mod ephemeral;
pub mod schema;

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio_stream::Stream;
use uuid::Uuid;

use crate::error::Result;
use crate::metrics::MetricPoint;
use crate::scheduler::job::{JobRecord, JobStatus, StatusRecord, StatusWrite};

pub use durable::SqliteStore;
pub use ephemeral::MemoryEphemeralStore;

/// Ephemeral key holding the job payload.
pub fn job_key(id: Uuid) -> String {
    format!("job:{}", id)
}

/// Ephemeral key holding the job's latest status record.
pub fn status_key(id: Uuid) -> String {
    format!("job_status:{}", id)
}

/// Messages received on a pub/sub channel. Item errors are recoverable;
/// the end of the stream means the subscription was lost.
pub type Subscription = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<()>;

    /// Atomically replace `key` if its current value equals `expected`
    /// (`None` meaning absent or expired). Returns false on mismatch.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        value: String,
        ttl: Duration,
    ) -> Result<bool>;

    /// Publish to a channel, returning how many subscribers received it.
    async fn publish(&self, channel: &str, message: String) -> Result<usize>;

    async fn subscribe(&self, channel: &str) -> Result<Subscription>;
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a job row unless one already exists. Returns true if inserted.
    /// This is the only way rows are created, so each id has at most one row.
    async fn insert_job_if_absent(&self, record: JobRecord) -> Result<bool>;

    async fn get_job(&self, id: Uuid) -> Result<Option<JobRecord>>;

    /// Apply a status write guarded by the status lattice.
    async fn update_status(&self, id: Uuid, update: StatusRecord) -> Result<StatusWrite>;

    /// Newest jobs first, optionally filtered by status.
    async fn list_jobs(&self, limit: usize, status: Option<JobStatus>) -> Result<Vec<JobRecord>>;

    async fn insert_metric(&self, point: MetricPoint) -> Result<()>;

    /// Metric points reported under `job_id`, ordered by step, then arrival.
    async fn metrics(&self, job_id: &str, name: Option<&str>) -> Result<Vec<MetricPoint>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_layout() {
        let id = Uuid::nil();
        assert_eq!(job_key(id), "job:00000000-0000-0000-0000-000000000000");
        assert_eq!(
            status_key(id),
            "job_status:00000000-0000-0000-0000-000000000000"
        );
    }
}
