//! Per-task health counters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// Rolling counters for a task, one row per task definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskMetrics {
    #[serde(skip)]
    pub task_id: TaskId,
    pub total_runs: i64,
    pub failed_runs: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
}

impl TaskMetrics {
    /// Metrics for a task that has never run.
    #[must_use]
    pub fn empty(task_id: TaskId) -> Self {
        Self {
            task_id,
            total_runs: 0,
            failed_runs: 0,
            last_run_at: None,
            next_run_at: None,
        }
    }
}
