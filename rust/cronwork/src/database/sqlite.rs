//! SQLite storage backend.
//!
//! One connection behind a mutex; every call runs on the blocking pool.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::types::{Type, Value};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params, params_from_iter};

use super::repository::{ExecutionRepository, MetricsRepository, TaskFilter, TaskRepository};
use super::schema::{EXECUTION_COLUMNS, SQLITE_SCHEMA, TASK_COLUMNS};
use crate::domain::{
    ExecutionStatus, NewTask, TaskDefinition, TaskExecution, TaskId, TaskMetrics,
};
use crate::reconciler::fold::{Fold, StatusUpdate, UpsertOutcome, fold};

/// SQLite-backed store for tasks, executions and metrics.
#[derive(Clone)]
pub struct SqliteStore {
    path: Arc<str>,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open the database at `path` (`:memory:` for a private in-memory
    /// database) and apply the schema.
    pub async fn open(path: &str) -> Result<Self> {
        let owned = path.to_string();
        let conn = tokio::task::spawn_blocking(move || -> Result<Connection> {
            let conn = if owned == ":memory:" {
                Connection::open_in_memory()?
            } else {
                if let Some(parent) = Path::new(&owned).parent() {
                    if !parent.as_os_str().is_empty() {
                        std::fs::create_dir_all(parent)
                            .with_context(|| format!("Failed to create {}", parent.display()))?;
                    }
                }
                let conn = Connection::open(&owned)
                    .with_context(|| format!("Failed to open SQLite database at {owned}"))?;
                conn.pragma_update(None, "journal_mode", "WAL")?;
                conn
            };
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(SQLITE_SCHEMA)
                .context("Failed to apply SQLite schema")?;
            Ok(conn)
        })
        .await
        .context("Tokio spawn_blocking failed")??;

        tracing::debug!(path = %path, "SQLite store opened");
        Ok(Self {
            path: Arc::from(path),
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Database path as given to [`Self::open`].
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .context("Tokio spawn_blocking failed")?
    }
}

fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

fn from_millis(idx: usize, millis: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(millis)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, millis))
}

fn optional_millis(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    row.get::<_, Option<i64>>(idx)?
        .map(|millis| from_millis(idx, millis))
        .transpose()
}

fn row_to_task(row: &Row<'_>) -> rusqlite::Result<TaskDefinition> {
    let envs = row
        .get::<_, Option<String>>(6)?
        .map(|raw| serde_json::from_str(&raw))
        .transpose()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(6, Type::Text, Box::new(e)))?;

    Ok(TaskDefinition {
        id: row.get(0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        cron: row.get(3)?,
        icon: row.get(4)?,
        command: row.get(5)?,
        envs,
        enabled: row.get(7)?,
        created_at: from_millis(8, row.get(8)?)?,
        updated_at: from_millis(9, row.get(9)?)?,
    })
}

fn row_to_execution(row: &Row<'_>) -> rusqlite::Result<TaskExecution> {
    let status = row
        .get::<_, String>(2)?
        .parse::<ExecutionStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;

    Ok(TaskExecution {
        id: row.get(0)?,
        task_id: row.get(1)?,
        status,
        exit_code: row.get(3)?,
        stdout: row.get(4)?,
        stderr: row.get(5)?,
        started_at: optional_millis(row, 6)?,
        finished_at: optional_millis(row, 7)?,
        duration_ms: row.get(8)?,
        created_at: from_millis(9, row.get(9)?)?,
        updated_at: from_millis(10, row.get(10)?)?,
        attempt: row.get(11)?,
    })
}

fn envs_json(task_envs: Option<&std::collections::BTreeMap<String, String>>) -> Result<Option<String>> {
    task_envs
        .map(serde_json::to_string)
        .transpose()
        .context("Failed to encode task envs")
}

#[async_trait]
impl TaskRepository for SqliteStore {
    async fn insert_task(&self, task: &NewTask) -> Result<TaskDefinition> {
        let task = task.clone();
        let envs = envs_json(task.envs.as_ref())?;

        self.with_conn(move |conn| {
            let now = Utc::now();
            conn.execute(
                "INSERT INTO task_definitions \
                 (name, description, cron, icon, command, envs, enabled, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    task.name,
                    task.description,
                    task.cron,
                    task.icon,
                    task.command,
                    envs,
                    task.enabled,
                    to_millis(now),
                ],
            )
            .context("Failed to insert task")?;

            Ok(TaskDefinition {
                id: conn.last_insert_rowid(),
                name: task.name,
                description: task.description,
                icon: task.icon,
                cron: task.cron,
                command: task.command,
                envs: task.envs,
                enabled: task.enabled,
                created_at: now,
                updated_at: now,
            })
        })
        .await
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskDefinition>> {
        self.with_conn(move |conn| {
            let task = conn
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_definitions WHERE id = ?1"),
                    params![id],
                    row_to_task,
                )
                .optional()?;
            Ok(task)
        })
        .await
    }

    async fn update_task(&self, task: &TaskDefinition) -> Result<Option<TaskDefinition>> {
        let task = task.clone();
        let envs = envs_json(task.envs.as_ref())?;

        self.with_conn(move |conn| {
            let changed = conn
                .execute(
                    "UPDATE task_definitions SET name = ?2, description = ?3, cron = ?4, \
                     icon = ?5, command = ?6, envs = ?7, enabled = ?8, updated_at = ?9 \
                     WHERE id = ?1",
                    params![
                        task.id,
                        task.name,
                        task.description,
                        task.cron,
                        task.icon,
                        task.command,
                        envs,
                        task.enabled,
                        to_millis(task.updated_at),
                    ],
                )
                .context("Failed to update task")?;
            Ok((changed > 0).then_some(task))
        })
        .await
    }

    async fn delete_task(&self, id: TaskId) -> Result<Option<TaskDefinition>> {
        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let task = tx
                .query_row(
                    &format!("SELECT {TASK_COLUMNS} FROM task_definitions WHERE id = ?1"),
                    params![id],
                    row_to_task,
                )
                .optional()?;
            if task.is_some() {
                tx.execute("DELETE FROM task_definitions WHERE id = ?1", params![id])
                    .context("Failed to delete task")?;
            }
            tx.commit()?;
            Ok(task)
        })
        .await
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskDefinition>> {
        let filter = filter.clone();

        self.with_conn(move |conn| {
            let mut sql = format!("SELECT {TASK_COLUMNS} FROM task_definitions WHERE 1 = 1");
            let mut values: Vec<Value> = Vec::new();
            if let Some(pattern) = filter.name_like {
                sql.push_str(" AND name LIKE ?");
                values.push(Value::Text(pattern));
            }
            if let Some(after) = filter.after_id {
                sql.push_str(" AND id > ?");
                values.push(Value::Integer(after));
            }
            sql.push_str(" ORDER BY id ASC LIMIT ?");
            values.push(Value::Integer(i64::try_from(filter.limit)?));

            let mut stmt = conn.prepare(&sql)?;
            let tasks = stmt
                .query_map(params_from_iter(values.iter()), row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
        .await
    }

    async fn list_enabled_tasks(&self) -> Result<Vec<TaskDefinition>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {TASK_COLUMNS} FROM task_definitions WHERE enabled = 1 ORDER BY id ASC"
            ))?;
            let tasks = stmt
                .query_map([], row_to_task)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
        .await
    }
}

#[async_trait]
impl ExecutionRepository for SqliteStore {
    async fn get_execution(&self, id: &str) -> Result<Option<TaskExecution>> {
        let id = id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                    params![id],
                    row_to_execution,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn upsert_execution(&self, update: &StatusUpdate) -> Result<UpsertOutcome> {
        let update = update.clone();

        self.with_conn(move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let existing = tx
                .query_row(
                    &format!("SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE id = ?1"),
                    params![update.job_id],
                    row_to_execution,
                )
                .optional()?;

            let folded = fold(existing.as_ref(), &update, Utc::now());
            let outcome = UpsertOutcome::new(existing.as_ref(), &folded);

            if let Fold::Write(row) = folded {
                tx.execute(
                    "INSERT INTO task_executions \
                     (id, task_id, status, exit_code, stdout, stderr, started_at, finished_at, \
                      duration_ms, created_at, updated_at, attempt) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                     ON CONFLICT(id) DO UPDATE SET \
                       task_id = excluded.task_id, status = excluded.status, \
                       exit_code = excluded.exit_code, stdout = excluded.stdout, \
                       stderr = excluded.stderr, started_at = excluded.started_at, \
                       finished_at = excluded.finished_at, duration_ms = excluded.duration_ms, \
                       updated_at = excluded.updated_at, attempt = excluded.attempt",
                    params![
                        row.id,
                        row.task_id,
                        row.status.as_str(),
                        row.exit_code,
                        row.stdout,
                        row.stderr,
                        row.started_at.map(to_millis),
                        row.finished_at.map(to_millis),
                        row.duration_ms,
                        to_millis(row.created_at),
                        to_millis(row.updated_at),
                        row.attempt,
                    ],
                )
                .with_context(|| format!("Failed to write execution {}", row.id))?;
            }

            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn list_executions(
        &self,
        task_id: TaskId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TaskExecution>> {
        let limit = i64::try_from(limit)?;
        let offset = i64::try_from(offset)?;

        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXECUTION_COLUMNS} FROM task_executions WHERE task_id = ?1 \
                 ORDER BY created_at DESC, id DESC LIMIT ?2 OFFSET ?3"
            ))?;
            let rows = stmt
                .query_map(params![task_id, limit, offset], row_to_execution)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    async fn count_executions(&self, task_id: TaskId) -> Result<u64> {
        self.with_conn(move |conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM task_executions WHERE task_id = ?1",
                params![task_id],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count)?)
        })
        .await
    }

    async fn delete_pending_executions(&self, task_id: TaskId) -> Result<u64> {
        self.with_conn(move |conn| {
            let statuses = ExecutionStatus::PENDING
                .iter()
                .map(|status| format!("'{}'", status.as_str()))
                .collect::<Vec<_>>()
                .join(", ");
            let deleted = conn.execute(
                &format!(
                    "DELETE FROM task_executions WHERE task_id = ?1 AND status IN ({statuses})"
                ),
                params![task_id],
            )?;
            Ok(u64::try_from(deleted)?)
        })
        .await
    }

    async fn delete_executions(&self, ids: &[String]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let ids = ids.to_vec();

        self.with_conn(move |conn| {
            let placeholders = vec!["?"; ids.len()].join(", ");
            let deleted = conn.execute(
                &format!("DELETE FROM task_executions WHERE id IN ({placeholders})"),
                params_from_iter(ids.iter()),
            )?;
            Ok(u64::try_from(deleted)?)
        })
        .await
    }
}

#[async_trait]
impl MetricsRepository for SqliteStore {
    async fn get_metrics(&self, task_id: TaskId) -> Result<Option<TaskMetrics>> {
        self.with_conn(move |conn| {
            let metrics = conn
                .query_row(
                    "SELECT task_id, total_runs, failed_runs, last_run_at, next_run_at \
                     FROM task_metrics WHERE task_id = ?1",
                    params![task_id],
                    |row| {
                        Ok(TaskMetrics {
                            task_id: row.get(0)?,
                            total_runs: row.get(1)?,
                            failed_runs: row.get(2)?,
                            last_run_at: optional_millis(row, 3)?,
                            next_run_at: optional_millis(row, 4)?,
                        })
                    },
                )
                .optional()?;
            Ok(metrics)
        })
        .await
    }

    async fn record_terminal_run(
        &self,
        task_id: TaskId,
        failed: bool,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_metrics (task_id, total_runs, failed_runs, last_run_at) \
                 VALUES (?1, 1, ?2, ?3) \
                 ON CONFLICT(task_id) DO UPDATE SET \
                   total_runs = total_runs + 1, \
                   failed_runs = failed_runs + excluded.failed_runs, \
                   last_run_at = excluded.last_run_at",
                params![task_id, i64::from(failed), to_millis(finished_at)],
            )
            .context("Failed to record terminal run")?;
            Ok(())
        })
        .await
    }

    async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO task_metrics (task_id, next_run_at) VALUES (?1, ?2) \
                 ON CONFLICT(task_id) DO UPDATE SET next_run_at = excluded.next_run_at",
                params![task_id, next_run_at.map(to_millis)],
            )
            .context("Failed to set next run time")?;
            Ok(())
        })
        .await
    }
}
