//! Schedule synchronization for task definitions.
//!
//! Every task is in one of three scheduling states. A change of task
//! definition plans a [`Transition`] between them, and each transition runs a
//! fixed sequence of broker and storage steps. The steps are independent
//! calls, not one transaction.

use crate::database::{Database, ExecutionRepository};
use crate::domain::TaskDefinition;
use crate::error::{FailurePolicy, ScheduleError, ScheduleResult};
use crate::logging::OpTimer;
use crate::metrics::MetricsAggregator;

use super::cron::next_run_time;
use super::registrar::ScheduleRegistrar;

/// Scheduling state of a task definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleState {
    /// No definition.
    Unscheduled,
    /// Enabled, with its cron pattern.
    Scheduled(String),
    /// Defined but disabled.
    Disabled,
}

impl ScheduleState {
    #[must_use]
    pub fn of(task: Option<&TaskDefinition>) -> Self {
        match task {
            None => Self::Unscheduled,
            Some(task) if !task.enabled => Self::Disabled,
            Some(task) => Self::Scheduled(task.cron.clone()),
        }
    }
}

/// What a sync does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// Unregister, drain, clear pending rows and the next-run estimate.
    Disable,
    /// Unregister, drain, register the new pattern, clear drained and
    /// pending rows, recompute the next-run estimate.
    Reschedule { from: String, to: String },
    /// Register (idempotent) and refresh the next-run estimate.
    Register,
}

impl Transition {
    /// Plan the transition from `previous` to `task`.
    #[must_use]
    pub fn plan(task: &TaskDefinition, previous: Option<&TaskDefinition>) -> Self {
        if ScheduleState::of(Some(task)) == ScheduleState::Disabled {
            return Self::Disable;
        }
        match previous {
            Some(previous) if previous.cron != task.cron => Self::Reschedule {
                from: previous.cron.clone(),
                to: task.cron.clone(),
            },
            _ => Self::Register,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Reschedule { .. } => "reschedule",
            Self::Register => "register",
        }
    }
}

/// Mirrors task definition changes into the queue and execution storage.
#[derive(Debug, Clone)]
pub struct ScheduleSynchronizer {
    registrar: ScheduleRegistrar,
    db: Database,
    metrics: MetricsAggregator,
}

impl ScheduleSynchronizer {
    #[must_use]
    pub fn new(registrar: ScheduleRegistrar, db: Database, metrics: MetricsAggregator) -> Self {
        Self {
            registrar,
            db,
            metrics,
        }
    }

    #[must_use]
    pub fn registrar(&self) -> &ScheduleRegistrar {
        &self.registrar
    }

    /// Bring the schedule of `task` in line with its definition.
    ///
    /// `previous` is the definition before the change, when there was one.
    pub async fn sync(
        &self,
        task: &TaskDefinition,
        previous: Option<&TaskDefinition>,
        policy: FailurePolicy,
    ) -> ScheduleResult<()> {
        let transition = Transition::plan(task, previous);
        let timer = OpTimer::new("synchronizer", transition.name());
        let result = self.apply(task, &transition, policy).await;
        timer.finish_with_result(&result);
        result
    }

    async fn apply(
        &self,
        task: &TaskDefinition,
        transition: &Transition,
        policy: FailurePolicy,
    ) -> ScheduleResult<()> {
        match transition {
            Transition::Disable => {
                self.registrar.unregister(task.id, policy).await?;
                self.registrar.drain_queued(task.id, policy).await?;
                let cleared =
                    storage_step(policy, self.db.delete_pending_executions(task.id)).await?;
                storage_step(policy, self.metrics.set_next_run_at(task.id, None)).await?;
                tracing::info!(task_id = task.id, cleared, "Task schedule disabled");
            }
            Transition::Reschedule { from, to } => {
                self.registrar.unregister(task.id, policy).await?;
                let drained = self.registrar.drain_queued(task.id, policy).await?;
                self.registrar.register(task, policy).await?;
                let removed = storage_step(policy, self.db.delete_executions(&drained)).await?;
                let cleared =
                    storage_step(policy, self.db.delete_pending_executions(task.id)).await?;
                storage_step(
                    policy,
                    self.metrics.set_next_run_at(task.id, next_run_time(to)),
                )
                .await?;
                tracing::info!(
                    task_id = task.id,
                    from = %from,
                    to = %to,
                    drained = drained.len(),
                    cleared = removed + cleared,
                    "Task rescheduled"
                );
            }
            Transition::Register => {
                self.registrar.register(task, policy).await?;
                storage_step(
                    policy,
                    self.metrics.set_next_run_at(task.id, next_run_time(&task.cron)),
                )
                .await?;
            }
        }
        Ok(())
    }
}

/// Run a storage step under `policy`.
async fn storage_step<T: Default>(
    policy: FailurePolicy,
    step: impl Future<Output = anyhow::Result<T>>,
) -> ScheduleResult<T> {
    match step.await {
        Ok(value) => Ok(value),
        Err(e) => policy.settle(ScheduleError::Storage(e), T::default()),
    }
}
