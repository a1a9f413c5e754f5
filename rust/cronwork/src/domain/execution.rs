//! Execution records and statuses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::task::TaskId;

/// Lifecycle status of one triggered job instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Queued, not yet picked up by a worker.
    Waiting,
    /// Running on a worker.
    Active,
    /// Finished; the command ran (whatever its exit code).
    Completed,
    /// Finished with a job-level failure.
    Failed,
    /// Scheduled for a later time.
    Delayed,
    /// Lost its worker lock; the broker will retry it.
    Stalled,
}

impl ExecutionStatus {
    /// Statuses whose rows are cleared when a task is disabled or rescheduled.
    pub const PENDING: [Self; 3] = [Self::Waiting, Self::Delayed, Self::Stalled];

    /// Whether no further progress is expected for the job.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a row in this status counts as pending.
    #[must_use]
    pub fn is_pending(self) -> bool {
        Self::PENDING.contains(&self)
    }

    /// Stable storage representation.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Delayed => "delayed",
            Self::Stalled => "stalled",
        }
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "waiting" => Ok(Self::Waiting),
            "active" => Ok(Self::Active),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "delayed" => Ok(Self::Delayed),
            "stalled" => Ok(Self::Stalled),
            other => anyhow::bail!("Unknown execution status: {other}"),
        }
    }
}

/// Outcome of running a command.
///
/// `exit_code` is `None` when the process could not be started or was
/// terminated by a signal.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

/// Durable record of one job instance, keyed by the queue's job ID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    /// Queue job ID.
    pub id: String,
    /// Owning task.
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// `finished_at - started_at`, never negative.
    pub duration_ms: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Zero-based broker attempt the row describes.
    #[serde(skip)]
    pub attempt: u32,
}
