//! Queue worker that runs task commands.

use async_trait::async_trait;

use super::executor::CommandExecutor;
use crate::domain::ExecutionResult;
use crate::queue::{Job, JobProcessor};

/// Runs the command carried by each execution job.
#[derive(Debug, Clone)]
pub struct ExecutionWorker {
    executor: CommandExecutor,
}

impl ExecutionWorker {
    #[must_use]
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl JobProcessor for ExecutionWorker {
    async fn process(&self, job: &Job) -> anyhow::Result<Option<ExecutionResult>> {
        let data = &job.data;
        if data.skipped {
            tracing::info!(job_id = %job.id, task_id = data.task_id, "Skipping job of a removed task");
            return Ok(None);
        }
        if data.command.trim().is_empty() {
            tracing::warn!(job_id = %job.id, task_id = data.task_id, "Job has no command");
            return Ok(None);
        }

        tracing::debug!(job_id = %job.id, task_id = data.task_id, "Running task command");
        let result = self.executor.execute(&data.command, data.envs.as_ref()).await;
        tracing::info!(
            job_id = %job.id,
            task_id = data.task_id,
            exit_code = ?result.exit_code,
            "Task command finished"
        );
        Ok(Some(result))
    }
}
