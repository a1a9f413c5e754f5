//! Per-task run counters.

use chrono::{DateTime, Utc};

use crate::database::{Database, MetricsRepository};
use crate::domain::{TaskId, TaskMetrics};

/// Maintains the metrics row of each task.
///
/// Counters only move through [`MetricsAggregator::record_terminal`], which
/// the store applies as one atomic increment.
#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    db: Database,
}

impl MetricsAggregator {
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Count one finished run of a task.
    pub async fn record_terminal(
        &self,
        task_id: TaskId,
        failed: bool,
        finished_at: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        self.db
            .record_terminal_run(task_id, failed, finished_at)
            .await?;
        tracing::debug!(task_id, failed, "Terminal run recorded");
        Ok(())
    }

    /// Store the next-run estimate; `None` clears it.
    pub async fn set_next_run_at(
        &self,
        task_id: TaskId,
        next_run_at: Option<DateTime<Utc>>,
    ) -> anyhow::Result<()> {
        self.db.set_next_run_at(task_id, next_run_at).await
    }

    /// Metrics of a task, zeroed when it has none yet.
    pub async fn get(&self, task_id: TaskId) -> anyhow::Result<TaskMetrics> {
        Ok(self
            .db
            .get_metrics(task_id)
            .await?
            .unwrap_or_else(|| TaskMetrics::empty(task_id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::TaskRepository;
    use crate::domain::NewTask;

    #[tokio::test]
    async fn test_counts_failures_separately() {
        let db = Database::in_memory();
        let task = db
            .insert_task(&NewTask::new("t", "* * * * *", "true"))
            .await
            .unwrap();
        let metrics = MetricsAggregator::new(db);

        assert_eq!(metrics.get(task.id).await.unwrap(), TaskMetrics::empty(task.id));

        let finished = Utc::now();
        metrics.record_terminal(task.id, false, finished).await.unwrap();
        metrics.record_terminal(task.id, true, finished).await.unwrap();

        let current = metrics.get(task.id).await.unwrap();
        assert_eq!(current.total_runs, 2);
        assert_eq!(current.failed_runs, 1);
        assert_eq!(current.last_run_at, Some(finished));
    }

    #[tokio::test]
    async fn test_next_run_does_not_touch_counters() {
        let db = Database::in_memory();
        let task = db
            .insert_task(&NewTask::new("t", "* * * * *", "true"))
            .await
            .unwrap();
        let metrics = MetricsAggregator::new(db);

        metrics.record_terminal(task.id, false, Utc::now()).await.unwrap();
        metrics.set_next_run_at(task.id, None).await.unwrap();

        let current = metrics.get(task.id).await.unwrap();
        assert_eq!(current.total_runs, 1);
        assert_eq!(current.next_run_at, None);
    }
}
