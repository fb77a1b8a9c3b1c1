//! Job bookkeeping: the job model, the work queue, and the registry that
//! keeps a job's record consistent across the ephemeral and durable stores.
//!
//! # Components
//!
//! - [`JobRegistry`]: create jobs and write guarded status transitions
//! - [`StatusReader`]: merged reads with lazy durable repair
//! - [`WorkQueue`]: at-least-once channel from submission to dispatch

pub mod job;
pub mod queue;
pub mod reader;
pub mod registry;

pub use job::{JobPayload, JobRecord, JobStatus, JobView, StatusRecord, StatusWrite};
pub use queue::{Delivery, MemoryQueue, QueueItem, WorkQueue};
pub use reader::{RepairOutcome, StatusReader};
pub use registry::JobRegistry;
