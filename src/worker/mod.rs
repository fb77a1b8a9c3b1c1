//! Dispatch workers: turn queued jobs into cluster workloads and follow
//! them to completion.
//!
//! # Components
//!
//! - [`DispatchPool`]: N workers consuming the [`WorkQueue`](crate::scheduler::WorkQueue)
//! - [`DispatchController`]: per-item state machine (PENDING, RUNNING, terminal)
//! - [`ClusterExecutor`]: seam to the cluster scheduler
//! - [`KubernetesExecutor`]: `batch/v1` Job backend
//!
//! # Dispatch Flow
//!
//! 1. A worker receives a queue item
//! 2. [`DispatchController::process`] writes PENDING and acks the item
//! 3. The workload is created and the job moves to RUNNING
//! 4. The workload is polled until it succeeds, fails, or the poll budget expires
//!
//! Items are acknowledged before the workload is created. A crash between
//! the ack and the RUNNING write leaves the job PENDING.

pub mod controller;
pub mod executor;
pub mod kubernetes;
pub mod pool;

pub use controller::{DispatchController, DispatchOutcome};
pub use executor::{ClusterExecutor, WorkloadCondition, WorkloadSpec, SIMULATED_WORKLOAD_REF};
pub use kubernetes::KubernetesExecutor;
pub use pool::DispatchPool;
