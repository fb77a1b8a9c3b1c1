pub mod config;
pub mod error;
pub mod metrics;
pub mod node;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod worker;

pub use error::{OrchestratorError, Result};
pub use node::Node;
