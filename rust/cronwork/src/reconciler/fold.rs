//! Folding a status update into an execution row.
//!
//! Storage backends call [`fold`] inside their write critical section, so the
//! read of the current row and the write of the folded row are atomic per
//! job ID.

use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use crate::domain::{ExecutionStatus, TaskExecution, TaskId};

/// One status observation for a job, ready to be folded into its row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub job_id: String,
    pub task_id: TaskId,
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// When the broker started the job, if known.
    pub job_started_at: Option<DateTime<Utc>>,
    /// When the broker finished the job, if known.
    pub job_finished_at: Option<DateTime<Utc>>,
    /// Zero-based broker attempt the event belongs to, when known. An
    /// update from a later attempt than the row's replaces it.
    pub attempt: Option<u32>,
}

impl StatusUpdate {
    /// An update with no result fields or timestamps.
    #[must_use]
    pub fn new(job_id: impl Into<String>, task_id: TaskId, status: ExecutionStatus) -> Self {
        Self {
            job_id: job_id.into(),
            task_id,
            status,
            exit_code: None,
            stdout: None,
            stderr: None,
            job_started_at: None,
            job_finished_at: None,
            attempt: None,
        }
    }
}

/// Result of folding an update into the current row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fold {
    /// The update is stale or a duplicate; the row stays as it is.
    Keep,
    /// Write this row.
    Write(TaskExecution),
}

/// What an upsert saw and did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpsertOutcome {
    /// Status of the row before the upsert, if it existed.
    pub previous_status: Option<ExecutionStatus>,
    /// `started_at` of the row after the upsert.
    pub started_at: Option<DateTime<Utc>>,
    /// `finished_at` of the row after the upsert.
    pub finished_at: Option<DateTime<Utc>>,
    /// Whether a row was written.
    pub written: bool,
    /// The write replaced a row left by an earlier attempt.
    pub superseded: bool,
}

impl UpsertOutcome {
    /// Build the outcome for `fold`'s decision on `existing`.
    #[must_use]
    pub fn new(existing: Option<&TaskExecution>, folded: &Fold) -> Self {
        let previous_status = existing.map(|row| row.status);
        match folded {
            Fold::Keep => Self {
                previous_status,
                started_at: existing.and_then(|row| row.started_at),
                finished_at: existing.and_then(|row| row.finished_at),
                written: false,
                superseded: false,
            },
            Fold::Write(row) => Self {
                previous_status,
                started_at: row.started_at,
                finished_at: row.finished_at,
                written: true,
                superseded: existing.is_some_and(|previous| row.attempt > previous.attempt),
            },
        }
    }
}

/// Decide what `update` does to `existing`.
///
/// Terminal rows are sticky: stale progress events and duplicate terminal
/// events leave them untouched. Attempts order events across retries: an
/// event from an earlier attempt than the row's is stale, and one from a
/// later attempt starts the row over with no terminal fields carried.
#[must_use]
pub fn fold(existing: Option<&TaskExecution>, update: &StatusUpdate, now: DateTime<Utc>) -> Fold {
    let is_terminal = update.status.is_terminal();
    let attempt_order = existing.and_then(|row| update.attempt.map(|a| a.cmp(&row.attempt)));

    if let Some(row) = existing {
        match attempt_order {
            Some(Ordering::Less) => return Fold::Keep,
            Some(Ordering::Greater) => {}
            Some(Ordering::Equal) | None => {
                let was_terminal = row.status.is_terminal();
                if was_terminal && !is_terminal {
                    return Fold::Keep;
                }
                if was_terminal && row.status == update.status && row.finished_at.is_some() {
                    return Fold::Keep;
                }
                if row.status == update.status
                    && !is_terminal
                    && (update.status != ExecutionStatus::Active || row.started_at.is_some())
                {
                    return Fold::Keep;
                }
            }
        }
    }

    let carried = existing.filter(|row| {
        attempt_order != Some(Ordering::Greater) && !(row.status.is_terminal() && !is_terminal)
    });
    let previous_started = carried.and_then(|row| row.started_at);
    let previous_finished = carried.and_then(|row| row.finished_at);

    let (started_at, finished_at) = if is_terminal {
        let finished = update.job_finished_at.or(previous_finished).unwrap_or(now);
        let started = update.job_started_at.or(previous_started).unwrap_or(now);
        (Some(started.min(finished)), Some(finished))
    } else if update.status == ExecutionStatus::Active {
        (Some(update.job_started_at.unwrap_or(now)), None)
    } else {
        (previous_started, None)
    };

    let duration_ms = match (started_at, finished_at) {
        (Some(started), Some(finished)) => Some((finished - started).num_milliseconds()),
        _ => None,
    };

    let (exit_code, stdout, stderr) = if is_terminal {
        (update.exit_code, update.stdout.clone(), update.stderr.clone())
    } else {
        (None, None, None)
    };

    Fold::Write(TaskExecution {
        id: update.job_id.clone(),
        task_id: update.task_id,
        status: update.status,
        exit_code,
        stdout,
        stderr,
        started_at,
        finished_at,
        duration_ms,
        created_at: existing.map_or(now, |row| row.created_at),
        updated_at: now,
        attempt: update
            .attempt
            .or(existing.map(|row| row.attempt))
            .unwrap_or_default(),
    })
}
