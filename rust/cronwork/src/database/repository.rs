//! Repository traits and the backend-dispatching [`Database`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::memory::InMemoryStore;
use super::sqlite::SqliteStore;
use crate::domain::{NewTask, TaskDefinition, TaskExecution, TaskId, TaskMetrics};
use crate::reconciler::fold::{StatusUpdate, UpsertOutcome};

/// Filter for listing task definitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFilter {
    /// SQL `LIKE` pattern on the name (`%` and `_` wildcards).
    pub name_like: Option<String>,
    /// Only tasks with an ID greater than this.
    pub after_id: Option<TaskId>,
    pub limit: usize,
}

/// Repository trait for task definitions.
#[async_trait]
pub trait TaskRepository: Send + Sync {
    /// Insert a task and return it with its assigned ID.
    async fn insert_task(&self, task: &NewTask) -> anyhow::Result<TaskDefinition>;

    /// Get a task by ID.
    async fn get_task(&self, id: TaskId) -> anyhow::Result<Option<TaskDefinition>>;

    /// Overwrite every field of an existing task. `None` when it does not exist.
    async fn update_task(&self, task: &TaskDefinition) -> anyhow::Result<Option<TaskDefinition>>;

    /// Delete a task together with its executions and metrics.
    async fn delete_task(&self, id: TaskId) -> anyhow::Result<Option<TaskDefinition>>;

    /// List tasks in ascending ID order.
    async fn list_tasks(&self, filter: &TaskFilter) -> anyhow::Result<Vec<TaskDefinition>>;

    /// All enabled tasks, in ascending ID order.
    async fn list_enabled_tasks(&self) -> anyhow::Result<Vec<TaskDefinition>>;
}

/// Repository trait for execution rows.
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    async fn get_execution(&self, id: &str) -> anyhow::Result<Option<TaskExecution>>;

    /// Fold `update` into the row for its job ID, atomically per job ID.
    ///
    /// Fails when the owning task does not exist.
    async fn upsert_execution(&self, update: &StatusUpdate) -> anyhow::Result<UpsertOutcome>;

    /// A page of a task's executions, newest first.
    async fn list_executions(
        &self,
        task_id: TaskId,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<TaskExecution>>;

    async fn count_executions(&self, task_id: TaskId) -> anyhow::Result<u64>;

    /// Delete a task's rows in a pending status. Returns the number deleted.
    async fn delete_pending_executions(&self, task_id: TaskId) -> anyhow::Result<u64>;

    /// Delete rows by job ID. Returns the number deleted.
    async fn delete_executions(&self, ids: &[String]) -> anyhow::Result<u64>;
}

/// Repository trait for per-task metrics.
#[async_trait]
pub trait MetricsRepository: Send + Sync {
    async fn get_metrics(&self, task_id: TaskId) -> anyhow::Result<Option<TaskMetrics>>;

    /// Count one finished run in a single atomic increment.
    async fn record_terminal_run(
        &self,
        task_id: TaskId,
        failed: bool,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()>;

    /// Upsert the next-run estimate, leaving the counters alone.
    async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()>;
}

/// Database abstraction over the storage backends.
#[derive(Clone)]
pub enum Database {
    /// SQLite file or in-memory database.
    Sqlite(SqliteStore),
    /// Plain in-memory maps, for tests.
    InMemory(InMemoryStore),
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Sqlite(store) => write!(f, "Database::Sqlite({})", store.path()),
            Self::InMemory(_) => write!(f, "Database::InMemory"),
        }
    }
}

impl Database {
    /// Open (and migrate) the SQLite database at `path`.
    pub async fn open(path: &str) -> anyhow::Result<Self> {
        Ok(Self::Sqlite(SqliteStore::open(path).await?))
    }

    /// Create an in-memory database for testing.
    #[must_use]
    pub fn in_memory() -> Self {
        Self::InMemory(InMemoryStore::new())
    }
}

#[async_trait]
impl TaskRepository for Database {
    async fn insert_task(&self, task: &NewTask) -> anyhow::Result<TaskDefinition> {
        match self {
            Self::Sqlite(store) => store.insert_task(task).await,
            Self::InMemory(store) => store.insert_task(task).await,
        }
    }

    async fn get_task(&self, id: TaskId) -> anyhow::Result<Option<TaskDefinition>> {
        match self {
            Self::Sqlite(store) => store.get_task(id).await,
            Self::InMemory(store) => store.get_task(id).await,
        }
    }

    async fn update_task(&self, task: &TaskDefinition) -> anyhow::Result<Option<TaskDefinition>> {
        match self {
            Self::Sqlite(store) => store.update_task(task).await,
            Self::InMemory(store) => store.update_task(task).await,
        }
    }

    async fn delete_task(&self, id: TaskId) -> anyhow::Result<Option<TaskDefinition>> {
        match self {
            Self::Sqlite(store) => store.delete_task(id).await,
            Self::InMemory(store) => store.delete_task(id).await,
        }
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> anyhow::Result<Vec<TaskDefinition>> {
        match self {
            Self::Sqlite(store) => store.list_tasks(filter).await,
            Self::InMemory(store) => store.list_tasks(filter).await,
        }
    }

    async fn list_enabled_tasks(&self) -> anyhow::Result<Vec<TaskDefinition>> {
        match self {
            Self::Sqlite(store) => store.list_enabled_tasks().await,
            Self::InMemory(store) => store.list_enabled_tasks().await,
        }
    }
}

#[async_trait]
impl ExecutionRepository for Database {
    async fn get_execution(&self, id: &str) -> anyhow::Result<Option<TaskExecution>> {
        match self {
            Self::Sqlite(store) => store.get_execution(id).await,
            Self::InMemory(store) => store.get_execution(id).await,
        }
    }

    async fn upsert_execution(&self, update: &StatusUpdate) -> anyhow::Result<UpsertOutcome> {
        match self {
            Self::Sqlite(store) => store.upsert_execution(update).await,
            Self::InMemory(store) => store.upsert_execution(update).await,
        }
    }

    async fn list_executions(
        &self,
        task_id: TaskId,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<TaskExecution>> {
        match self {
            Self::Sqlite(store) => store.list_executions(task_id, limit, offset).await,
            Self::InMemory(store) => store.list_executions(task_id, limit, offset).await,
        }
    }

    async fn count_executions(&self, task_id: TaskId) -> anyhow::Result<u64> {
        match self {
            Self::Sqlite(store) => store.count_executions(task_id).await,
            Self::InMemory(store) => store.count_executions(task_id).await,
        }
    }

    async fn delete_pending_executions(&self, task_id: TaskId) -> anyhow::Result<u64> {
        match self {
            Self::Sqlite(store) => store.delete_pending_executions(task_id).await,
            Self::InMemory(store) => store.delete_pending_executions(task_id).await,
        }
    }

    async fn delete_executions(&self, ids: &[String]) -> anyhow::Result<u64> {
        match self {
            Self::Sqlite(store) => store.delete_executions(ids).await,
            Self::InMemory(store) => store.delete_executions(ids).await,
        }
    }
}

#[async_trait]
impl MetricsRepository for Database {
    async fn get_metrics(&self, task_id: TaskId) -> anyhow::Result<Option<TaskMetrics>> {
        match self {
            Self::Sqlite(store) => store.get_metrics(task_id).await,
            Self::InMemory(store) => store.get_metrics(task_id).await,
        }
    }

    async fn record_terminal_run(
        &self,
        task_id: TaskId,
        failed: bool,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match self {
            Self::Sqlite(store) => store.record_terminal_run(task_id, failed, finished_at).await,
            Self::InMemory(store) => store.record_terminal_run(task_id, failed, finished_at).await,
        }
    }

    async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        match self {
            Self::Sqlite(store) => store.set_next_run_at(task_id, next_run_at).await,
            Self::InMemory(store) => store.set_next_run_at(task_id, next_run_at).await,
        }
    }
}
