#![allow(dead_code, reason = "each test binary uses a different subset")]

use std::time::Duration;

use cronwork::config::AppConfig;
use cronwork::database::{Database, ExecutionRepository};
use cronwork::domain::{TaskExecution, TaskId};
use cronwork::runtime::Runtime;

/// Config tuned for tests: fast polling, no retries.
pub fn test_config() -> AppConfig {
    let mut config = AppConfig::default();
    config.queue.name = "test".to_string();
    config.queue.poll_interval_ms = 20;
    config.queue.attempts = 1;
    config.queue.concurrency = 4;
    config
}

/// Runtime over an in-memory store.
pub fn runtime() -> Runtime {
    Runtime::with_database(&test_config(), Database::in_memory())
}

/// Poll `task_id`'s executions until one satisfies `done`, or give up.
pub async fn wait_for_execution(
    db: &Database,
    task_id: TaskId,
    done: impl Fn(&TaskExecution) -> bool,
) -> Option<TaskExecution> {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while tokio::time::Instant::now() < deadline {
        let rows = db.list_executions(task_id, 100, 0).await.ok()?;
        if let Some(row) = rows.into_iter().find(|row| done(row)) {
            return Some(row);
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    None
}
