//! Core domain models.
//!
//! Task definitions are owned by the service layer. Executions and metrics are
//! written only by the reconciler, the schedule synchronizer and the metrics
//! aggregator.

pub mod execution;
pub mod metrics;
pub mod task;

pub use execution::{ExecutionResult, ExecutionStatus, TaskExecution};
pub use metrics::TaskMetrics;
pub use task::{NewTask, TaskDefinition, TaskId, TaskPatch};
