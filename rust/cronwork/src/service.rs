//! Task service: the operations behind the HTTP surface.
//!
//! Task definition writes are mirrored into the queue synchronously. When
//! the mirror fails, the write is compensated before the error is returned.

use futures::FutureExt;
use serde::{Deserialize, Serialize};

use crate::database::{Database, ExecutionRepository, TaskFilter, TaskRepository};
use crate::domain::{NewTask, TaskDefinition, TaskExecution, TaskId, TaskMetrics, TaskPatch};
use crate::error::{FailurePolicy, ScheduleError, ServiceError, ServiceResult};
use crate::logging::OpTimer;
use crate::metrics::MetricsAggregator;
use crate::saga::Saga;
use crate::scheduler::{CronParser, ScheduleSynchronizer, next_run_time};

const MAX_PAGE_SIZE: usize = 100;
const DEFAULT_TASK_PAGE_SIZE: usize = 10;
const DEFAULT_EXECUTION_PAGE_SIZE: usize = 20;

/// Query for listing tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct TaskListQuery {
    /// Name filter. Matched as a substring unless it contains `%` or `_`.
    #[serde(default)]
    pub name: Option<String>,
    /// Return tasks after this ID.
    #[serde(default)]
    pub cursor: Option<TaskId>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One page of tasks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPage {
    pub data: Vec<TaskDefinition>,
    /// Cursor for the following page, when there is one.
    pub next_cursor: Option<TaskId>,
}

/// Query for a task's execution history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ExecutionsQuery {
    #[serde(default)]
    pub page: Option<u64>,
    #[serde(default)]
    pub limit: Option<usize>,
}

/// One page of executions, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExecutionPage {
    pub data: Vec<TaskExecution>,
    pub total: u64,
    pub page: u64,
    pub limit: usize,
}

fn page_size(limit: Option<usize>, default: usize) -> ServiceResult<usize> {
    match limit {
        None => Ok(default),
        Some(limit) if (1..=MAX_PAGE_SIZE).contains(&limit) => Ok(limit),
        Some(_) => Err(ServiceError::validation(format!(
            "limit must be between 1 and {MAX_PAGE_SIZE}"
        ))),
    }
}

fn validate_cron(cron: &str) -> ServiceResult<()> {
    if CronParser::parse(cron).is_ok() {
        Ok(())
    } else {
        Err(ServiceError::validation("invalid cron expression"))
    }
}

fn validate_not_empty(value: &str, field: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        Err(ServiceError::validation(format!("{field} must not be empty")))
    } else {
        Ok(())
    }
}

fn validate_new_task(input: &NewTask) -> ServiceResult<()> {
    validate_not_empty(&input.name, "name")?;
    validate_not_empty(&input.command, "command")?;
    validate_cron(&input.cron)
}

fn validate_patch(patch: &TaskPatch) -> ServiceResult<()> {
    if let Some(name) = &patch.name {
        validate_not_empty(name, "name")?;
    }
    if let Some(command) = &patch.command {
        validate_not_empty(command, "command")?;
    }
    if let Some(cron) = &patch.cron {
        validate_cron(cron)?;
    }
    Ok(())
}

/// `LIKE` pattern for a name filter: substring match unless the caller
/// supplied wildcards.
fn name_pattern(name: Option<&str>) -> Option<String> {
    let trimmed = name.map(str::trim).filter(|name| !name.is_empty())?;
    if trimmed.contains(['%', '_']) {
        Some(trimmed.to_string())
    } else {
        Some(format!("%{trimmed}%"))
    }
}

/// Task CRUD plus schedule mirroring.
#[derive(Debug, Clone)]
pub struct TaskService {
    db: Database,
    synchronizer: ScheduleSynchronizer,
    metrics: MetricsAggregator,
}

impl TaskService {
    #[must_use]
    pub fn new(db: Database, synchronizer: ScheduleSynchronizer, metrics: MetricsAggregator) -> Self {
        Self {
            db,
            synchronizer,
            metrics,
        }
    }

    /// List tasks in ascending ID order with cursor pagination.
    pub async fn list_tasks(&self, query: &TaskListQuery) -> ServiceResult<TaskPage> {
        let limit = page_size(query.limit, DEFAULT_TASK_PAGE_SIZE)?;
        if query.cursor.is_some_and(|cursor| cursor < 1) {
            return Err(ServiceError::validation("cursor must be a positive integer"));
        }

        let filter = TaskFilter {
            name_like: name_pattern(query.name.as_deref()),
            after_id: query.cursor,
            limit: limit + 1,
        };
        let mut data = self.db.list_tasks(&filter).await?;

        let next_cursor = if data.len() > limit {
            data.truncate(limit);
            data.last().map(|task| task.id)
        } else {
            None
        };
        Ok(TaskPage { data, next_cursor })
    }

    /// Create a task and register its schedule.
    ///
    /// The definition is removed again when registration fails.
    pub async fn create_task(&self, input: &NewTask) -> ServiceResult<TaskDefinition> {
        validate_new_task(input)?;

        let task = self
            .db
            .insert_task(input)
            .await
            .map_err(ServiceError::CreateFailed)?;

        let mut saga = Saga::new("create_task");
        let db = self.db.clone();
        let id = task.id;
        saga.record(
            "insert definition",
            async move { db.delete_task(id).await.map(|_| ()) }.boxed(),
        );
        saga.step(
            "register schedule",
            self.synchronizer
                .registrar()
                .register(&task, FailurePolicy::Propagate),
        )
        .await
        .map_err(ServiceError::ScheduleFailed)?;

        if let Err(e) = self
            .metrics
            .set_next_run_at(task.id, next_run_time(&task.cron))
            .await
        {
            tracing::warn!(task_id = task.id, error = %e, "Failed to record next run");
        }

        tracing::info!(task_id = task.id, name = %task.name, cron = %task.cron, "Task created");
        Ok(task)
    }

    pub async fn get_task(&self, id: TaskId) -> ServiceResult<TaskDefinition> {
        self.db
            .get_task(id)
            .await?
            .ok_or(ServiceError::NotFound(id))
    }

    /// Apply a patch and synchronize the schedule.
    ///
    /// When synchronization fails the previous definition is restored and its
    /// schedule re-synced, both best effort.
    pub async fn update_task(&self, id: TaskId, patch: &TaskPatch) -> ServiceResult<TaskDefinition> {
        validate_patch(patch)?;
        let previous = self.get_task(id).await?;
        let next = patch.apply_to(&previous, chrono::Utc::now());

        let updated = self
            .db
            .update_task(&next)
            .await
            .map_err(ServiceError::UpdateFailed)?
            .ok_or_else(|| {
                ServiceError::UpdateFailed(anyhow::anyhow!("task {id} vanished during update"))
            })?;

        let mut saga = Saga::new("update_task");
        saga.record("update definition", {
            let db = self.db.clone();
            let synchronizer = self.synchronizer.clone();
            let previous = previous.clone();
            let updated = updated.clone();
            async move {
                if let Err(e) = db.update_task(&previous).await {
                    tracing::error!(task_id = previous.id, error = %e, "Failed to restore task definition");
                }
                synchronizer
                    .sync(&previous, Some(&updated), FailurePolicy::LogAndContinue)
                    .await?;
                Ok(())
            }
            .boxed()
        });
        saga.step(
            "sync schedule",
            self.synchronizer
                .sync(&updated, Some(&previous), FailurePolicy::Propagate),
        )
        .await
        .map_err(ServiceError::SyncFailed)?;

        tracing::info!(task_id = id, "Task updated");
        Ok(updated)
    }

    /// Tear down the schedule, then delete the definition (cascading to its
    /// executions and metrics). The schedule is restored when the delete
    /// does not happen.
    pub async fn delete_task(&self, id: TaskId) -> ServiceResult<TaskDefinition> {
        let task = self.get_task(id).await?;
        let registrar = self.synchronizer.registrar();

        let mut saga = Saga::new("delete_task");
        saga.step("unschedule", async {
            registrar.unregister(id, FailurePolicy::Propagate).await?;
            registrar.drain_queued(id, FailurePolicy::Propagate).await?;
            Ok::<_, ScheduleError>(())
        })
        .await
        .map_err(ServiceError::UnscheduleFailed)?;

        saga.record("unschedule", {
            let registrar = registrar.clone();
            let task = task.clone();
            async move {
                registrar
                    .register(&task, FailurePolicy::LogAndContinue)
                    .await?;
                Ok(())
            }
            .boxed()
        });

        let deleted = saga
            .step("delete definition", async {
                self.db
                    .delete_task(id)
                    .await
                    .map_err(ServiceError::DeleteFailed)
            })
            .await?;
        // Deleted concurrently: its schedule is already gone and stays gone.
        let Some(deleted) = deleted else {
            tracing::info!(task_id = id, "Task was deleted concurrently");
            return Err(ServiceError::NotFound(id));
        };

        tracing::info!(task_id = id, "Task deleted");
        Ok(deleted)
    }

    /// Run counters of a task; zeroed when it has never run.
    pub async fn task_metrics(&self, id: TaskId) -> ServiceResult<TaskMetrics> {
        self.get_task(id).await?;
        Ok(self.metrics.get(id).await?)
    }

    /// A page of a task's executions, newest first.
    pub async fn task_executions(
        &self,
        id: TaskId,
        query: &ExecutionsQuery,
    ) -> ServiceResult<ExecutionPage> {
        let page = query.page.unwrap_or(1);
        if page < 1 {
            return Err(ServiceError::validation("page must be a positive integer"));
        }
        let limit = page_size(query.limit, DEFAULT_EXECUTION_PAGE_SIZE)?;
        let offset = usize::try_from(page - 1)
            .ok()
            .and_then(|pages| pages.checked_mul(limit))
            .ok_or_else(|| ServiceError::validation("page is out of range"))?;

        let total = self.db.count_executions(id).await?;
        let data = self.db.list_executions(id, limit, offset).await?;
        Ok(ExecutionPage {
            data,
            total,
            page,
            limit,
        })
    }

    /// Register the schedule of every enabled task. Returns how many were
    /// restored; failures are logged per task.
    pub async fn restore_schedules(&self) -> ServiceResult<usize> {
        let timer = OpTimer::new("service", "restore_schedules");
        let tasks = self.db.list_enabled_tasks().await?;

        let mut restored = 0;
        for task in &tasks {
            match self.synchronizer.sync(task, None, FailurePolicy::Propagate).await {
                Ok(()) => restored += 1,
                Err(e) => tracing::error!(task_id = task.id, error = %e, "Failed to restore schedule"),
            }
        }

        timer.finish();
        tracing::info!(restored, total = tasks.len(), "Schedules restored");
        Ok(restored)
    }
}
