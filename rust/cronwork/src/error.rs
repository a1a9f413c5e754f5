//! Error types shared across the scheduling layers.

use thiserror::Error;

use crate::domain::TaskId;
use crate::queue::QueueError;

/// What a schedule operation does when the broker call fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    /// Return the failure to the caller.
    Propagate,
    /// Log the failure and report a negative outcome instead.
    LogAndContinue,
}

impl FailurePolicy {
    /// Return `err`, or log it and hand back `fallback`.
    pub fn settle<T>(self, err: ScheduleError, fallback: T) -> ScheduleResult<T> {
        match self {
            Self::Propagate => Err(err),
            Self::LogAndContinue => {
                tracing::error!(error = %err, "Schedule operation failed");
                Ok(fallback)
            }
        }
    }
}

/// Failures of the registrar and synchronizer.
#[derive(Error, Debug)]
pub enum ScheduleError {
    #[error("Failed to register schedule for task {task_id}: {source}")]
    RegistrationFailed { task_id: TaskId, source: QueueError },

    #[error("Failed to remove schedule for task {task_id}: {source}")]
    UnregistrationFailed { task_id: TaskId, source: QueueError },

    #[error("Failed to drain queued jobs for task {task_id}: {source}")]
    DrainFailed { task_id: TaskId, source: QueueError },

    #[error("Schedule storage error: {0}")]
    Storage(#[from] anyhow::Error),
}

/// Result type alias for schedule operations
pub type ScheduleResult<T> = Result<T, ScheduleError>;

/// Failures surfaced by the task service, each with a stable machine code.
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    Validation(String),

    #[error("task not found.")]
    NotFound(TaskId),

    #[error("failed to create task.")]
    CreateFailed(#[source] anyhow::Error),

    #[error("failed to update task.")]
    UpdateFailed(#[source] anyhow::Error),

    #[error("failed to schedule task.")]
    ScheduleFailed(#[source] ScheduleError),

    #[error("failed to sync task schedule.")]
    SyncFailed(#[source] ScheduleError),

    #[error("failed to unschedule task.")]
    UnscheduleFailed(#[source] ScheduleError),

    #[error("failed to delete task.")]
    DeleteFailed(#[source] anyhow::Error),

    #[error("internal server error")]
    Storage(#[from] anyhow::Error),
}

impl ServiceError {
    /// Stable code reported to API clients.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "VALIDATION_ERROR",
            Self::NotFound(_) => "TASK_NOT_FOUND",
            Self::CreateFailed(_) => "TASK_CREATE_FAILED",
            Self::UpdateFailed(_) => "TASK_UPDATE_FAILED",
            Self::ScheduleFailed(_) => "TASK_SCHEDULE_FAILED",
            Self::SyncFailed(_) => "TASK_SCHEDULE_SYNC_FAILED",
            Self::UnscheduleFailed(_) => "TASK_UNSCHEDULE_FAILED",
            Self::DeleteFailed(_) => "TASK_DELETE_FAILED",
            Self::Storage(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Result type alias for service operations
pub type ServiceResult<T> = Result<T, ServiceError>;
