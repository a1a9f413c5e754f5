//! In-memory storage backend for tests and throwaway runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use super::repository::{ExecutionRepository, MetricsRepository, TaskFilter, TaskRepository};
use crate::domain::{NewTask, TaskDefinition, TaskExecution, TaskId, TaskMetrics};
use crate::reconciler::fold::{Fold, StatusUpdate, UpsertOutcome, fold};

#[derive(Debug, Default)]
struct Tables {
    next_id: TaskId,
    tasks: BTreeMap<TaskId, TaskDefinition>,
    executions: HashMap<String, TaskExecution>,
    metrics: HashMap<TaskId, TaskMetrics>,
}

/// Map-backed store with the same semantics as the SQLite backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    tables: Arc<RwLock<Tables>>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// SQL `LIKE` matching: `%` is any run, `_` one character, ASCII
/// case-insensitive.
fn like_matches(pattern: &str, value: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let value: Vec<char> = value.chars().collect();

    // Greedy wildcard matching with backtracking to the last `%`.
    let (mut p, mut v) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while v < value.len() {
        if p < pattern.len() && pattern[p] == '%' {
            star = Some((p, v));
            p += 1;
        } else if p < pattern.len()
            && (pattern[p] == '_' || pattern[p].eq_ignore_ascii_case(&value[v]))
        {
            p += 1;
            v += 1;
        } else if let Some((star_p, star_v)) = star {
            p = star_p + 1;
            v = star_v + 1;
            star = Some((star_p, star_v + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '%')
}

#[async_trait]
impl TaskRepository for InMemoryStore {
    async fn insert_task(&self, task: &NewTask) -> Result<TaskDefinition> {
        let mut tables = self.tables.write();
        tables.next_id += 1;
        let now = Utc::now();
        let created = TaskDefinition {
            id: tables.next_id,
            name: task.name.clone(),
            description: task.description.clone(),
            icon: task.icon.clone(),
            cron: task.cron.clone(),
            command: task.command.clone(),
            envs: task.envs.clone(),
            enabled: task.enabled,
            created_at: now,
            updated_at: now,
        };
        tables.tasks.insert(created.id, created.clone());
        Ok(created)
    }

    async fn get_task(&self, id: TaskId) -> Result<Option<TaskDefinition>> {
        Ok(self.tables.read().tasks.get(&id).cloned())
    }

    async fn update_task(&self, task: &TaskDefinition) -> Result<Option<TaskDefinition>> {
        let mut tables = self.tables.write();
        match tables.tasks.get_mut(&task.id) {
            Some(slot) => {
                let created_at = slot.created_at;
                *slot = TaskDefinition {
                    created_at,
                    ..task.clone()
                };
                Ok(Some(slot.clone()))
            }
            None => Ok(None),
        }
    }

    async fn delete_task(&self, id: TaskId) -> Result<Option<TaskDefinition>> {
        let mut tables = self.tables.write();
        let removed = tables.tasks.remove(&id);
        if removed.is_some() {
            tables.executions.retain(|_, row| row.task_id != id);
            tables.metrics.remove(&id);
        }
        Ok(removed)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskDefinition>> {
        let tables = self.tables.read();
        let after = filter.after_id.unwrap_or(TaskId::MIN);
        Ok(tables
            .tasks
            .range(after.saturating_add(1)..)
            .map(|(_, task)| task)
            .filter(|task| {
                filter
                    .name_like
                    .as_deref()
                    .is_none_or(|pattern| like_matches(pattern, &task.name))
            })
            .take(filter.limit)
            .cloned()
            .collect())
    }

    async fn list_enabled_tasks(&self) -> Result<Vec<TaskDefinition>> {
        Ok(self
            .tables
            .read()
            .tasks
            .values()
            .filter(|task| task.enabled)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl ExecutionRepository for InMemoryStore {
    async fn get_execution(&self, id: &str) -> Result<Option<TaskExecution>> {
        Ok(self.tables.read().executions.get(id).cloned())
    }

    async fn upsert_execution(&self, update: &StatusUpdate) -> Result<UpsertOutcome> {
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&update.task_id) {
            bail!(
                "Cannot record execution {} for unknown task {}",
                update.job_id,
                update.task_id
            );
        }

        let existing = tables.executions.get(&update.job_id);
        let folded = fold(existing, update, Utc::now());
        let outcome = UpsertOutcome::new(existing, &folded);
        if let Fold::Write(row) = folded {
            tables.executions.insert(row.id.clone(), row);
        }
        Ok(outcome)
    }

    async fn list_executions(
        &self,
        task_id: TaskId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<TaskExecution>> {
        let tables = self.tables.read();
        let mut rows: Vec<&TaskExecution> = tables
            .executions
            .values()
            .filter(|row| row.task_id == task_id)
            .collect();
        rows.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(rows.into_iter().skip(offset).take(limit).cloned().collect())
    }

    async fn count_executions(&self, task_id: TaskId) -> Result<u64> {
        let tables = self.tables.read();
        let count = tables
            .executions
            .values()
            .filter(|row| row.task_id == task_id)
            .count();
        Ok(u64::try_from(count)?)
    }

    async fn delete_pending_executions(&self, task_id: TaskId) -> Result<u64> {
        let mut tables = self.tables.write();
        let before = tables.executions.len();
        tables
            .executions
            .retain(|_, row| !(row.task_id == task_id && row.status.is_pending()));
        Ok(u64::try_from(before - tables.executions.len())?)
    }

    async fn delete_executions(&self, ids: &[String]) -> Result<u64> {
        let mut tables = self.tables.write();
        let deleted = ids
            .iter()
            .filter(|id| tables.executions.remove(id.as_str()).is_some())
            .count();
        Ok(u64::try_from(deleted)?)
    }
}

#[async_trait]
impl MetricsRepository for InMemoryStore {
    async fn get_metrics(&self, task_id: TaskId) -> Result<Option<TaskMetrics>> {
        Ok(self.tables.read().metrics.get(&task_id).cloned())
    }

    async fn record_terminal_run(
        &self,
        task_id: TaskId,
        failed: bool,
        finished_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&task_id) {
            bail!("Cannot record metrics for unknown task {task_id}");
        }
        let metrics = tables
            .metrics
            .entry(task_id)
            .or_insert_with(|| TaskMetrics::empty(task_id));
        metrics.total_runs += 1;
        metrics.failed_runs += i64::from(failed);
        metrics.last_run_at = Some(finished_at);
        Ok(())
    }

    async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.tables.write();
        if !tables.tasks.contains_key(&task_id) {
            bail!("Cannot set next run for unknown task {task_id}");
        }
        tables
            .metrics
            .entry(task_id)
            .or_insert_with(|| TaskMetrics::empty(task_id))
            .next_run_at = next_run_at;
        Ok(())
    }
}
