//! Training metric ingestion and query.
//!
//! Running workloads publish JSON documents of the form
//! `{"job_id": .., "step": .., "epoch": .., "<metric>": <number>, ..}` on the
//! metrics channel. The [`MetricsIngestor`] turns each numeric field into one
//! [`MetricPoint`] row in the durable store. Points are append-only and may
//! repeat or arrive out of order; readers group them by name and sort by step.
//!
//! A metric's job id is an opaque reference: it is usually the id of a job
//! this node dispatched, but workloads launched by other tooling may report
//! under any non-empty id.

pub mod ingestor;
pub mod supervisor;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};
use crate::store::DurableStore;

pub use ingestor::MetricsIngestor;
pub use supervisor::supervise;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub job_id: String,
    pub step: i64,
    pub epoch: f64,
    pub name: String,
    pub value: f64,
    /// Assigned at ingestion
    pub created_at: DateTime<Utc>,
}

/// A decoded metrics channel message.
#[derive(Debug, Clone, PartialEq)]
pub struct MetricMessage {
    pub job_id: String,
    pub step: i64,
    pub epoch: f64,
    pub values: Vec<(String, f64)>,
}

impl MetricMessage {
    pub fn parse(raw: &str) -> Result<Self> {
        let doc: Map<String, Value> = serde_json::from_str(raw)
            .map_err(|e| OrchestratorError::MalformedMessage(e.to_string()))?;

        let job_id = doc
            .get("job_id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| OrchestratorError::MalformedMessage("missing job_id".into()))?
            .to_string();

        let step = match doc.get("step") {
            None | Some(Value::Null) => 0,
            Some(v) => v.as_i64().ok_or_else(|| {
                OrchestratorError::MalformedMessage(format!("step is not an integer: {}", v))
            })?,
        };
        let epoch = match doc.get("epoch") {
            None | Some(Value::Null) => 0.0,
            Some(v) => v.as_f64().ok_or_else(|| {
                OrchestratorError::MalformedMessage(format!("epoch is not a number: {}", v))
            })?,
        };

        let mut values = Vec::new();
        for (name, value) in &doc {
            if matches!(name.as_str(), "job_id" | "step" | "epoch") {
                continue;
            }
            let number = value.as_f64().ok_or_else(|| {
                OrchestratorError::MalformedMessage(format!(
                    "metric {:?} is not numeric: {}",
                    name, value
                ))
            })?;
            values.push((name.clone(), number));
        }
        if values.is_empty() {
            return Err(OrchestratorError::MalformedMessage(
                "no metric fields".into(),
            ));
        }

        Ok(Self {
            job_id,
            step,
            epoch,
            values,
        })
    }

    /// The job id as a dispatched job's id, if it is one.
    pub fn dispatched_job(&self) -> Option<Uuid> {
        Uuid::parse_str(&self.job_id).ok()
    }

    /// One point per named value, all stamped with the same ingestion time.
    pub fn into_points(self) -> Vec<MetricPoint> {
        let now = Utc::now();
        self.values
            .into_iter()
            .map(|(name, value)| MetricPoint {
                job_id: self.job_id.clone(),
                step: self.step,
                epoch: self.epoch,
                name,
                value,
                created_at: now,
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub step: i64,
    pub epoch: f64,
    pub value: f64,
}

/// Metric samples keyed by metric name, each series sorted by step.
pub type MetricSeries = BTreeMap<String, Vec<MetricSample>>;

pub fn group_by_name(mut points: Vec<MetricPoint>) -> MetricSeries {
    points.sort_by_key(|p| p.step);
    let mut series = MetricSeries::new();
    for p in points {
        series.entry(p.name).or_default().push(MetricSample {
            step: p.step,
            epoch: p.epoch,
            value: p.value,
        });
    }
    series
}

/// Metric series for a job, optionally restricted to one metric name.
pub async fn job_metrics(
    store: &dyn DurableStore,
    job_id: &str,
    name: Option<&str>,
) -> Result<MetricSeries> {
    Ok(group_by_name(store.metrics(job_id, name).await?))
}
