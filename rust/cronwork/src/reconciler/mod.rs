//! Execution event reconciliation.
//!
//! Folds queue lifecycle events into execution rows and task metrics. Events
//! arrive at least once, possibly duplicated and out of order, and are
//! reconciled concurrently. Row stickiness lives in [`fold`], which storage
//! applies atomically per job ID; this module decides what each event means.

pub mod fold;

use std::sync::Arc;

use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::database::{Database, ExecutionRepository, TaskRepository};
use crate::domain::{ExecutionStatus, TaskId};
use crate::error::FailurePolicy;
use crate::metrics::MetricsAggregator;
use crate::queue::{EventKind, Job, JobQueue, LifecycleEvent, QueueEvent, parse_repeat_job_id};
use crate::scheduler::ScheduleRegistrar;

pub use fold::{Fold, StatusUpdate, UpsertOutcome};

/// Per-status work done before the row is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideEffect {
    /// Write the row only.
    None,
    /// Persist the job's run time as the task's next run.
    RefreshNextRun,
    /// Log the event; no row is written.
    LogOnly,
}

impl SideEffect {
    /// Side effect registered for `status`.
    #[must_use]
    pub fn for_status(status: ExecutionStatus) -> Self {
        match status {
            ExecutionStatus::Delayed => Self::RefreshNextRun,
            ExecutionStatus::Stalled => Self::LogOnly,
            ExecutionStatus::Waiting
            | ExecutionStatus::Active
            | ExecutionStatus::Completed
            | ExecutionStatus::Failed => Self::None,
        }
    }
}

/// What reconciling one event did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No task could be resolved for the job.
    Ignored,
    /// The job was already marked skipped.
    Skipped,
    /// The task no longer exists; its schedule was torn down.
    Orphaned,
    /// Logged only.
    Logged,
    /// The row was folded. `counted` when the metrics saw a finished run.
    Recorded {
        status: ExecutionStatus,
        written: bool,
        counted: bool,
    },
}

/// Consumes queue lifecycle events.
#[derive(Debug, Clone)]
pub struct ExecutionReconciler {
    queue: Arc<dyn JobQueue>,
    db: Database,
    registrar: ScheduleRegistrar,
    metrics: MetricsAggregator,
}

impl ExecutionReconciler {
    #[must_use]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        db: Database,
        registrar: ScheduleRegistrar,
        metrics: MetricsAggregator,
    ) -> Self {
        Self {
            queue,
            db,
            registrar,
            metrics,
        }
    }

    /// Reconcile a single lifecycle event.
    pub async fn reconcile(&self, event: &LifecycleEvent) -> anyhow::Result<ReconcileOutcome> {
        let current = match self.queue.get_job(&event.job_id).await {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(job_id = %event.job_id, error = %e, "Failed to look up job");
                None
            }
        };
        let snapshot = event.job.as_ref();
        let job = current.as_ref().or(snapshot);

        if job.is_some_and(|job| job.data.skipped) {
            return Ok(ReconcileOutcome::Skipped);
        }

        let repeat = parse_repeat_job_id(&event.job_id);
        let Some(task_id) = job
            .map(|job| job.data.task_id)
            .filter(|id| *id > 0)
            .or(repeat.map(|(id, _)| id))
        else {
            tracing::debug!(job_id = %event.job_id, "Event without a task; ignoring");
            return Ok(ReconcileOutcome::Ignored);
        };

        if self.db.get_task(task_id).await?.is_none() {
            self.clean_up_orphan(task_id, &event.job_id, current.as_ref())
                .await?;
            return Ok(ReconcileOutcome::Orphaned);
        }

        let status = event.kind.status();
        match SideEffect::for_status(status) {
            SideEffect::None => {}
            SideEffect::RefreshNextRun => {
                let next_run = repeat
                    .map(|(_, run_at)| run_at)
                    .or_else(|| job.map(Job::run_at));
                if let Some(next_run) = next_run {
                    self.metrics.set_next_run_at(task_id, Some(next_run)).await?;
                }
            }
            SideEffect::LogOnly => {
                tracing::warn!(
                    task_id,
                    job_id = %event.job_id,
                    "Execution stalled; job will retry if attempts remain"
                );
                return Ok(ReconcileOutcome::Logged);
            }
        }

        // The event's own snapshot describes the attempt it belongs to; the
        // live job may already be on a later one.
        let attempt_job = snapshot.or(current.as_ref());
        let mut update = StatusUpdate::new(event.job_id.clone(), task_id, status);
        update.job_started_at = attempt_job.and_then(|job| job.processed_on);
        update.job_finished_at = attempt_job.and_then(|job| job.finished_on);
        update.attempt = snapshot.map(|job| attempt_of(&event.kind, job));
        apply_result_fields(&mut update, &event.kind, job);

        let outcome = self.db.upsert_execution(&update).await?;

        let retrying =
            status == ExecutionStatus::Failed && attempt_job.is_some_and(Job::has_attempts_left);
        let was_terminal = !outcome.superseded
            && outcome
                .previous_status
                .is_some_and(ExecutionStatus::is_terminal);
        let finished_at = outcome.finished_at.filter(|_| status.is_terminal());

        let counted = match finished_at {
            Some(finished_at) if !was_terminal && !retrying => {
                self.metrics
                    .record_terminal(task_id, status == ExecutionStatus::Failed, finished_at)
                    .await?;
                true
            }
            _ => false,
        };

        tracing::debug!(
            task_id,
            job_id = %event.job_id,
            status = %status,
            written = outcome.written,
            counted,
            retrying,
            "Execution event reconciled"
        );

        Ok(ReconcileOutcome::Recorded {
            status,
            written: outcome.written,
            counted,
        })
    }

    /// Mark the job skipped and tear down the schedule of a vanished task.
    async fn clean_up_orphan(
        &self,
        task_id: TaskId,
        job_id: &str,
        current: Option<&Job>,
    ) -> anyhow::Result<()> {
        tracing::error!(
            task_id,
            job_id = job_id,
            "Execution event for deleted task; cleaning up schedule and queue"
        );

        if let Some(job) = current {
            let mut data = job.data.clone();
            data.skipped = true;
            if let Err(e) = self.queue.update_job_data(&job.id, data).await {
                tracing::debug!(job_id = job_id, error = %e, "Could not mark job skipped");
            }
        }

        self.registrar
            .unregister(task_id, FailurePolicy::LogAndContinue)
            .await?;
        self.registrar
            .drain_queued(task_id, FailurePolicy::LogAndContinue)
            .await?;
        Ok(())
    }

    /// Reconcile events from `events` until `shutdown` fires or the channel
    /// closes. Buffered events are taken before the shutdown check. Each
    /// event runs on its own task; in-flight ones are awaited before
    /// returning.
    pub async fn run(
        self: Arc<Self>,
        mut events: broadcast::Receiver<QueueEvent>,
        shutdown: CancellationToken,
    ) {
        let mut in_flight = JoinSet::new();
        tracing::info!("Execution reconciler started");

        loop {
            tokio::select! {
                biased;
                received = events.recv() => match received {
                    Ok(QueueEvent::Lifecycle(event)) => {
                        let reconciler = Arc::clone(&self);
                        in_flight.spawn(async move { reconciler.handle(&event).await });
                    }
                    Ok(QueueEvent::Error(message)) => {
                        tracing::error!(error = %message, "Queue reported an error");
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Reconciler fell behind the event stream");
                    }
                    Err(RecvError::Closed) => break,
                },
                Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Reconcile task panicked");
                    }
                }
                () = shutdown.cancelled() => break,
            }
        }

        while in_flight.join_next().await.is_some() {}
        tracing::info!("Execution reconciler stopped");
    }

    async fn handle(&self, event: &LifecycleEvent) {
        if let Err(e) = self.reconcile(event).await {
            tracing::error!(
                job_id = %event.job_id,
                status = %event.kind.status(),
                error = %e,
                "Failed to reconcile execution event"
            );
        }
    }
}

/// Zero-based attempt an event describes. The broker counts a failed
/// attempt before reporting it.
fn attempt_of(kind: &EventKind, job: &Job) -> u32 {
    match kind {
        EventKind::Failed { .. } => job.attempts_made.saturating_sub(1),
        _ => job.attempts_made,
    }
}

/// Fill exit code and output for terminal events.
///
/// A completed event carries the result as its return value; otherwise the
/// result recorded on the job is used. A failure reason stands in for a
/// missing stderr.
fn apply_result_fields(update: &mut StatusUpdate, kind: &EventKind, job: Option<&Job>) {
    let recorded = || job.and_then(|job| job.data.execution_result.clone());
    let (result, failed_reason) = match kind {
        EventKind::Completed { return_value } => (return_value.clone().or_else(recorded), None),
        EventKind::Failed { failed_reason } => (recorded(), Some(failed_reason.clone())),
        _ => return,
    };

    let result = result.unwrap_or_default();
    update.exit_code = result.exit_code;
    update.stdout = result.stdout;
    update.stderr = result.stderr.or(failed_reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, Utc};

    use crate::database::MetricsRepository;
    use crate::domain::{ExecutionResult, NewTask};
    use crate::queue::{JobOptions, JobPayload, JobState, LocalQueue, repeat_job_id};

    struct Harness {
        queue: Arc<LocalQueue>,
        db: Database,
        reconciler: ExecutionReconciler,
    }

    fn harness() -> Harness {
        let queue = Arc::new(LocalQueue::new("test", 64));
        let db = Database::in_memory();
        let dyn_queue: Arc<dyn JobQueue> = Arc::clone(&queue) as Arc<dyn JobQueue>;
        let registrar = ScheduleRegistrar::new(Arc::clone(&dyn_queue), 1);
        let metrics = MetricsAggregator::new(db.clone());
        let reconciler = ExecutionReconciler::new(dyn_queue, db.clone(), registrar, metrics);
        Harness {
            queue,
            db,
            reconciler,
        }
    }

    fn job(id: &str, task_id: TaskId, attempts: u32, attempts_made: u32) -> Job {
        Job {
            id: id.to_string(),
            name: "t".to_string(),
            data: JobPayload {
                task_id,
                command: "echo hi".to_string(),
                ..JobPayload::default()
            },
            opts: JobOptions {
                attempts,
                remove_on_complete: true,
                remove_on_fail: true,
            },
            timestamp: Utc::now(),
            delay_ms: 0,
            processed_on: None,
            finished_on: None,
            attempts_made,
            state: JobState::Active,
            scheduler_key: None,
        }
    }

    fn finished(job: &mut Job, at: DateTime<Utc>) {
        job.processed_on = Some(at - Duration::milliseconds(5));
        job.finished_on = Some(at);
    }

    fn event(job: &Job, kind: EventKind) -> LifecycleEvent {
        LifecycleEvent::new(job.id.clone(), kind).with_job(job.clone())
    }

    fn completed(exit_code: i32) -> EventKind {
        EventKind::Completed {
            return_value: Some(ExecutionResult {
                exit_code: Some(exit_code),
                stdout: Some("hi\n".to_string()),
                stderr: None,
            }),
        }
    }

    async fn task(db: &Database) -> TaskId {
        db.insert_task(&NewTask::new("t", "0 * * * *", "echo hi"))
            .await
            .unwrap()
            .id
    }

    #[test]
    fn test_side_effect_table() {
        assert_eq!(
            SideEffect::for_status(ExecutionStatus::Delayed),
            SideEffect::RefreshNextRun
        );
        assert_eq!(
            SideEffect::for_status(ExecutionStatus::Stalled),
            SideEffect::LogOnly
        );
        assert_eq!(
            SideEffect::for_status(ExecutionStatus::Completed),
            SideEffect::None
        );
    }

    #[tokio::test]
    async fn test_lifecycle_records_row_and_counts_once() {
        let h = harness();
        let task_id = task(&h.db).await;
        let mut j = job("repeat:1:1000", task_id, 1, 0);

        let out = h.reconciler.reconcile(&event(&j, EventKind::Waiting)).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { counted: false, .. }));

        finished(&mut j, Utc::now());
        let done = event(&j, completed(0));
        let out = h.reconciler.reconcile(&done).await.unwrap();
        assert_eq!(
            out,
            ReconcileOutcome::Recorded {
                status: ExecutionStatus::Completed,
                written: true,
                counted: true,
            }
        );

        // Duplicate terminal delivery.
        let out = h.reconciler.reconcile(&done).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { written: false, counted: false, .. }));

        let row = h.db.get_execution(&j.id).await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.exit_code, Some(0));
        assert_eq!(row.stdout.as_deref(), Some("hi\n"));
        assert_eq!(row.duration_ms, Some(5));

        let metrics = h.db.get_metrics(task_id).await.unwrap().unwrap();
        assert_eq!(metrics.total_runs, 1);
        assert_eq!(metrics.failed_runs, 0);
    }

    #[tokio::test]
    async fn test_failure_reason_fills_stderr() {
        let h = harness();
        let task_id = task(&h.db).await;
        let mut j = job("7", task_id, 1, 1);
        finished(&mut j, Utc::now());

        let failed = EventKind::Failed {
            failed_reason: "worker crashed".to_string(),
        };
        h.reconciler.reconcile(&event(&j, failed)).await.unwrap();

        let row = h.db.get_execution("7").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Failed);
        assert_eq!(row.exit_code, None);
        assert_eq!(row.stderr.as_deref(), Some("worker crashed"));

        let metrics = h.db.get_metrics(task_id).await.unwrap().unwrap();
        assert_eq!((metrics.total_runs, metrics.failed_runs), (1, 1));
    }

    #[tokio::test]
    async fn test_retrying_failure_is_not_counted() {
        let h = harness();
        let task_id = task(&h.db).await;
        let mut j = job("9", task_id, 3, 1);
        finished(&mut j, Utc::now());

        let out = h
            .reconciler
            .reconcile(&event(
                &j,
                EventKind::Failed {
                    failed_reason: "boom".to_string(),
                },
            ))
            .await
            .unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { counted: false, .. }));
        assert!(h.db.get_metrics(task_id).await.unwrap().is_none());
    }

    fn failed(reason: &str) -> EventKind {
        EventKind::Failed {
            failed_reason: reason.to_string(),
        }
    }

    #[tokio::test]
    async fn test_retry_events_after_job_removal_count_final_run() {
        let h = harness();
        let task_id = task(&h.db).await;

        let mut first = job("21", task_id, 2, 1);
        finished(&mut first, Utc::now());
        let mut second = job("21", task_id, 2, 1);
        second.processed_on = Some(Utc::now() + Duration::milliseconds(10));
        let active = event(&second, EventKind::Active);
        finished(&mut second, Utc::now() + Duration::milliseconds(30));

        // The job was removed on completion before any of these were handled.
        let out = h.reconciler.reconcile(&event(&first, failed("boom"))).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { counted: false, .. }));
        let out = h.reconciler.reconcile(&active).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { written: true, .. }));
        let out = h.reconciler.reconcile(&event(&second, completed(0))).await.unwrap();
        assert_eq!(
            out,
            ReconcileOutcome::Recorded {
                status: ExecutionStatus::Completed,
                written: true,
                counted: true,
            }
        );

        let row = h.db.get_execution("21").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.stderr, None);
        let metrics = h.db.get_metrics(task_id).await.unwrap().unwrap();
        assert_eq!((metrics.total_runs, metrics.failed_runs), (1, 0));
    }

    #[tokio::test]
    async fn test_reordered_retry_events_count_once() {
        let h = harness();
        let task_id = task(&h.db).await;

        let mut first = job("22", task_id, 2, 1);
        finished(&mut first, Utc::now());
        let mut second = job("22", task_id, 2, 1);
        finished(&mut second, Utc::now() + Duration::milliseconds(30));

        h.reconciler.reconcile(&event(&second, completed(0))).await.unwrap();
        let out = h.reconciler.reconcile(&event(&first, failed("boom"))).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { written: false, counted: false, .. }));

        let row = h.db.get_execution("22").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        let metrics = h.db.get_metrics(task_id).await.unwrap().unwrap();
        assert_eq!((metrics.total_runs, metrics.failed_runs), (1, 0));
    }

    #[tokio::test]
    async fn test_final_failure_after_retried_failure_counts_once() {
        let h = harness();
        let task_id = task(&h.db).await;

        let mut first = job("23", task_id, 2, 1);
        finished(&mut first, Utc::now());
        let mut last = job("23", task_id, 2, 2);
        finished(&mut last, Utc::now() + Duration::milliseconds(30));

        h.reconciler.reconcile(&event(&first, failed("first"))).await.unwrap();
        let out = h.reconciler.reconcile(&event(&last, failed("last"))).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { counted: true, .. }));
        // Duplicate delivery of the final failure.
        let out = h.reconciler.reconcile(&event(&last, failed("last"))).await.unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { written: false, counted: false, .. }));

        let row = h.db.get_execution("23").await.unwrap().unwrap();
        assert_eq!(row.stderr.as_deref(), Some("last"));
        let metrics = h.db.get_metrics(task_id).await.unwrap().unwrap();
        assert_eq!((metrics.total_runs, metrics.failed_runs), (1, 1));
    }

    #[tokio::test]
    async fn test_stalled_is_logged_only() {
        let h = harness();
        let task_id = task(&h.db).await;
        let j = job("11", task_id, 1, 0);
        let out = h.reconciler.reconcile(&event(&j, EventKind::Stalled)).await.unwrap();
        assert_eq!(out, ReconcileOutcome::Logged);
        assert!(h.db.get_execution("11").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_sets_next_run_from_job_id() {
        let h = harness();
        let task_id = task(&h.db).await;
        let run_at = DateTime::from_timestamp_millis(1_900_000_000_000).unwrap();
        let id = repeat_job_id(&task_id.to_string(), run_at);

        let out = h
            .reconciler
            .reconcile(&LifecycleEvent::new(id, EventKind::Delayed))
            .await
            .unwrap();
        assert!(matches!(out, ReconcileOutcome::Recorded { .. }));

        let metrics = h.db.get_metrics(task_id).await.unwrap().unwrap();
        assert_eq!(metrics.next_run_at, Some(run_at));
    }

    #[tokio::test]
    async fn test_unresolvable_job_is_ignored() {
        let h = harness();
        let out = h
            .reconciler
            .reconcile(&LifecycleEvent::new("42", EventKind::Waiting))
            .await
            .unwrap();
        assert_eq!(out, ReconcileOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_orphan_marks_job_skipped() {
        let h = harness();
        let queued = h
            .queue
            .add(
                "t",
                JobPayload {
                    task_id: 77,
                    command: "echo hi".to_string(),
                    ..JobPayload::default()
                },
                JobOptions::default(),
                std::time::Duration::ZERO,
            )
            .unwrap();
        let out = h
            .reconciler
            .reconcile(&event(&queued, EventKind::Waiting))
            .await
            .unwrap();
        assert_eq!(out, ReconcileOutcome::Orphaned);
        assert!(h.db.get_execution(&queued.id).await.unwrap().is_none());
        // Drained along with the rest of the task's queued jobs.
        assert!(h.queue.get_job(&queued.id).await.unwrap().is_none());
    }
}
