//! Job queue contract.
//!
//! The scheduling core talks to the broker only through [`JobQueue`] and
//! consumes its [`QueueEvent`] stream. [`LocalQueue`] is the in-process
//! implementation used by the binary and the tests.

pub mod local;

pub use local::LocalQueue;

use std::collections::BTreeMap;
use std::sync::LazyLock;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::{ExecutionResult, ExecutionStatus, TaskId};

/// Data carried by every execution job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub task_id: TaskId,
    pub command: String,
    #[serde(default)]
    pub envs: Option<BTreeMap<String, String>>,
    /// Result recorded by the worker once the command ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    /// Set when the owning task vanished; later events for the job are ignored.
    #[serde(default)]
    pub skipped: bool,
}

/// Per-job options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    /// Total attempts before the job is failed for good.
    pub attempts: u32,
    pub remove_on_complete: bool,
    pub remove_on_fail: bool,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            attempts: 1,
            remove_on_complete: false,
            remove_on_fail: false,
        }
    }
}

/// Template used by a job scheduler for every job it produces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTemplate {
    pub name: String,
    pub data: JobPayload,
    pub opts: JobOptions,
}

/// Repeat settings of a job scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepeatOptions {
    /// Cron pattern.
    pub pattern: String,
}

/// Broker-side state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobState {
    Waiting,
    Delayed,
    Prioritized,
    Paused,
    WaitingChildren,
    Active,
    Completed,
    Failed,
}

impl JobState {
    /// States of jobs that are queued but not yet started.
    pub const QUEUED: [Self; 5] = [
        Self::Waiting,
        Self::Delayed,
        Self::Prioritized,
        Self::Paused,
        Self::WaitingChildren,
    ];
}

static REPEAT_JOB_ID: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^repeat:(\d+):(\d+)$").expect("repeat job id pattern is valid"));

/// Build the job ID for a scheduler occurrence: `repeat:<key>:<run at millis>`.
#[must_use]
pub fn repeat_job_id(key: &str, run_at: DateTime<Utc>) -> String {
    format!("repeat:{key}:{}", run_at.timestamp_millis())
}

/// Parse a repeat job ID into its task ID and scheduled run time.
#[must_use]
pub fn parse_repeat_job_id(job_id: &str) -> Option<(TaskId, DateTime<Utc>)> {
    let captures = REPEAT_JOB_ID.captures(job_id)?;
    let task_id = captures[1].parse().ok()?;
    let run_at = DateTime::from_timestamp_millis(captures[2].parse().ok()?)?;
    Some((task_id, run_at))
}

/// A job as seen by the broker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub data: JobPayload,
    pub opts: JobOptions,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Delay from `timestamp` until the job becomes runnable.
    pub delay_ms: i64,
    pub processed_on: Option<DateTime<Utc>>,
    pub finished_on: Option<DateTime<Utc>>,
    pub attempts_made: u32,
    pub state: JobState,
    /// Key of the scheduler that produced the job.
    pub scheduler_key: Option<String>,
}

impl Job {
    /// When the job becomes runnable.
    #[must_use]
    pub fn run_at(&self) -> DateTime<Utc> {
        self.timestamp + Duration::milliseconds(self.delay_ms)
    }

    /// Whether a failed attempt will be retried.
    #[must_use]
    pub fn has_attempts_left(&self) -> bool {
        self.attempts_made < self.opts.attempts
    }
}

/// What happened to a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    Waiting,
    Active,
    Delayed,
    Stalled,
    Completed {
        return_value: Option<ExecutionResult>,
    },
    Failed {
        failed_reason: String,
    },
}

impl EventKind {
    /// Execution status the event reports.
    #[must_use]
    pub fn status(&self) -> ExecutionStatus {
        match self {
            Self::Waiting => ExecutionStatus::Waiting,
            Self::Active => ExecutionStatus::Active,
            Self::Delayed => ExecutionStatus::Delayed,
            Self::Stalled => ExecutionStatus::Stalled,
            Self::Completed { .. } => ExecutionStatus::Completed,
            Self::Failed { .. } => ExecutionStatus::Failed,
        }
    }
}

/// A job lifecycle event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleEvent {
    pub job_id: String,
    pub kind: EventKind,
    /// Job state at emission time, when the broker still had the job.
    pub job: Option<Job>,
}

impl LifecycleEvent {
    #[must_use]
    pub fn new(job_id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            job_id: job_id.into(),
            kind,
            job: None,
        }
    }

    #[must_use]
    pub fn with_job(mut self, job: Job) -> Self {
        self.job = Some(job);
        self
    }
}

/// Everything the broker's event stream carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Lifecycle(LifecycleEvent),
    /// Broker-level failure, not tied to a job.
    Error(String),
}

/// Broker errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    #[error("Job {0} belongs to a job scheduler")]
    JobBelongsToScheduler(String),

    #[error("Job {0} is not in the expected state")]
    JobNotInState(String),

    #[error("Lock for job {0} does not exist")]
    JobLockMissing(String),

    #[error("Lock for job {0} is held by another worker")]
    JobLockMismatch(String),

    #[error("Job {0} not found")]
    JobNotFound(String),

    #[error("Invalid repeat pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Queue is closed")]
    Closed,

    #[error("Queue backend error: {0}")]
    Backend(String),
}

impl QueueError {
    /// Whether a removal failed only because the job moved on concurrently.
    #[must_use]
    pub fn is_removal_race(&self) -> bool {
        matches!(
            self,
            Self::JobBelongsToScheduler(_)
                | Self::JobNotInState(_)
                | Self::JobLockMissing(_)
                | Self::JobLockMismatch(_)
                | Self::JobNotFound(_)
        )
    }
}

/// Broker operations used by the scheduling core.
#[async_trait]
pub trait JobQueue: Send + Sync + std::fmt::Debug {
    /// Install or replace the scheduler stored under `key`.
    async fn upsert_job_scheduler(
        &self,
        key: &str,
        repeat: RepeatOptions,
        template: JobTemplate,
    ) -> Result<(), QueueError>;

    /// Remove a scheduler. Returns whether one existed.
    async fn remove_job_scheduler(&self, key: &str) -> Result<bool, QueueError>;

    /// Jobs currently in any of `states`.
    async fn get_jobs(&self, states: &[JobState]) -> Result<Vec<Job>, QueueError>;

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError>;

    async fn remove_job(&self, job_id: &str) -> Result<(), QueueError>;

    async fn update_job_data(&self, job_id: &str, data: JobPayload) -> Result<(), QueueError>;
}

/// Work run for each job a queue worker picks up.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Run the job. An `Err` counts as a failed attempt.
    async fn process(&self, job: &Job) -> anyhow::Result<Option<ExecutionResult>>;
}
