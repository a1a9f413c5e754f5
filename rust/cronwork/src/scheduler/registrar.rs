//! Recurring-job registration for task definitions.

use std::sync::Arc;

use crate::domain::{TaskDefinition, TaskId};
use crate::error::{FailurePolicy, ScheduleError, ScheduleResult};
use crate::queue::{JobOptions, JobPayload, JobQueue, JobState, JobTemplate, RepeatOptions};

/// Installs, removes and drains the queue scheduler of each task.
///
/// The scheduler key is the task ID in decimal form, so every job the queue
/// produces for a task carries the ID `repeat:<task id>:<run at millis>`.
#[derive(Debug, Clone)]
pub struct ScheduleRegistrar {
    queue: Arc<dyn JobQueue>,
    attempts: u32,
}

impl ScheduleRegistrar {
    #[must_use]
    pub fn new(queue: Arc<dyn JobQueue>, attempts: u32) -> Self {
        Self { queue, attempts }
    }

    /// Scheduler key for a task.
    #[must_use]
    pub fn scheduler_key(task_id: TaskId) -> String {
        task_id.to_string()
    }

    fn template(&self, task: &TaskDefinition) -> JobTemplate {
        JobTemplate {
            name: task.name.clone(),
            data: JobPayload {
                task_id: task.id,
                command: task.command.clone(),
                envs: task.envs.clone(),
                ..JobPayload::default()
            },
            opts: JobOptions {
                attempts: self.attempts,
                remove_on_complete: true,
                remove_on_fail: true,
            },
        }
    }

    /// Install or replace the scheduler for `task`.
    ///
    /// A disabled task is left unregistered and reported as success.
    pub async fn register(
        &self,
        task: &TaskDefinition,
        policy: FailurePolicy,
    ) -> ScheduleResult<bool> {
        if !task.enabled {
            return Ok(true);
        }

        let repeat = RepeatOptions {
            pattern: task.cron.clone(),
        };
        match self
            .queue
            .upsert_job_scheduler(&Self::scheduler_key(task.id), repeat, self.template(task))
            .await
        {
            Ok(()) => {
                tracing::debug!(task_id = task.id, cron = %task.cron, "Schedule registered");
                Ok(true)
            }
            Err(source) => {
                let err = ScheduleError::RegistrationFailed {
                    task_id: task.id,
                    source,
                };
                policy.settle(err, false)
            }
        }
    }

    /// Remove the scheduler for a task. Removing an absent scheduler succeeds.
    pub async fn unregister(&self, task_id: TaskId, policy: FailurePolicy) -> ScheduleResult<bool> {
        match self
            .queue
            .remove_job_scheduler(&Self::scheduler_key(task_id))
            .await
        {
            Ok(existed) => {
                tracing::debug!(task_id, existed, "Schedule removed");
                Ok(true)
            }
            Err(source) => {
                policy.settle(ScheduleError::UnregistrationFailed { task_id, source }, false)
            }
        }
    }

    /// Remove every queued, not yet started job of a task and return the IDs
    /// removed. Jobs that move on while being removed are skipped.
    pub async fn drain_queued(
        &self,
        task_id: TaskId,
        policy: FailurePolicy,
    ) -> ScheduleResult<Vec<String>> {
        let jobs = match self.queue.get_jobs(&JobState::QUEUED).await {
            Ok(jobs) => jobs,
            Err(source) => {
                return policy.settle(ScheduleError::DrainFailed { task_id, source }, Vec::new());
            }
        };

        let mut removed = Vec::new();
        for job in jobs.into_iter().filter(|job| job.data.task_id == task_id) {
            match self.queue.remove_job(&job.id).await {
                Ok(()) => removed.push(job.id),
                Err(e) if e.is_removal_race() => {
                    tracing::debug!(task_id, job_id = %job.id, error = %e, "Queued job already moved on");
                }
                Err(source) => {
                    return policy.settle(ScheduleError::DrainFailed { task_id, source }, removed);
                }
            }
        }

        if !removed.is_empty() {
            tracing::debug!(task_id, count = removed.len(), "Drained queued jobs");
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{Job, LocalQueue, QueueError};
    use async_trait::async_trait;
    use chrono::Utc;

    /// Every job is picked up by a worker just before it can be removed.
    #[derive(Debug)]
    struct LockedQueue(Arc<LocalQueue>);

    #[async_trait]
    impl JobQueue for LockedQueue {
        async fn upsert_job_scheduler(
            &self,
            key: &str,
            repeat: RepeatOptions,
            template: JobTemplate,
        ) -> Result<(), QueueError> {
            self.0.upsert_job_scheduler(key, repeat, template).await
        }

        async fn remove_job_scheduler(&self, key: &str) -> Result<bool, QueueError> {
            self.0.remove_job_scheduler(key).await
        }

        async fn get_jobs(&self, states: &[JobState]) -> Result<Vec<Job>, QueueError> {
            self.0.get_jobs(states).await
        }

        async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
            self.0.get_job(job_id).await
        }

        async fn remove_job(&self, job_id: &str) -> Result<(), QueueError> {
            Err(QueueError::JobLockMismatch(job_id.to_string()))
        }

        async fn update_job_data(&self, job_id: &str, data: JobPayload) -> Result<(), QueueError> {
            self.0.update_job_data(job_id, data).await
        }
    }

    fn task(id: TaskId, cron: &str, enabled: bool) -> TaskDefinition {
        let now = Utc::now();
        TaskDefinition {
            id,
            name: format!("task-{id}"),
            description: None,
            icon: None,
            cron: cron.to_string(),
            command: "echo hi".to_string(),
            envs: None,
            enabled,
            created_at: now,
            updated_at: now,
        }
    }

    fn setup() -> (Arc<LocalQueue>, ScheduleRegistrar) {
        let queue = Arc::new(LocalQueue::new("test", 64));
        let registrar = ScheduleRegistrar::new(Arc::clone(&queue) as Arc<dyn JobQueue>, 1);
        (queue, registrar)
    }

    #[tokio::test]
    async fn test_register_twice_keeps_one_scheduler() {
        let (queue, registrar) = setup();
        let task = task(1, "0 0 1 1 *", true);
        assert!(registrar.register(&task, FailurePolicy::Propagate).await.unwrap());
        assert!(registrar.register(&task, FailurePolicy::Propagate).await.unwrap());
        assert_eq!(queue.scheduler_count(), 1);
        assert_eq!(queue.get_jobs(&JobState::QUEUED).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_register_disabled_is_noop() {
        let (queue, registrar) = setup();
        let task = task(1, "0 0 1 1 *", false);
        assert!(registrar.register(&task, FailurePolicy::Propagate).await.unwrap());
        assert_eq!(queue.scheduler_count(), 0);
    }

    #[tokio::test]
    async fn test_register_failure_follows_policy() {
        let (queue, registrar) = setup();
        queue.close();
        let task = task(1, "0 0 1 1 *", true);

        let err = registrar
            .register(&task, FailurePolicy::Propagate)
            .await
            .unwrap_err();
        assert!(matches!(err, ScheduleError::RegistrationFailed { task_id: 1, .. }));

        let swallowed = registrar
            .register(&task, FailurePolicy::LogAndContinue)
            .await
            .unwrap();
        assert!(!swallowed);
    }

    #[tokio::test]
    async fn test_unregister_absent_succeeds() {
        let (_queue, registrar) = setup();
        assert!(registrar.unregister(9, FailurePolicy::Propagate).await.unwrap());
    }

    #[tokio::test]
    async fn test_drain_only_touches_own_jobs() {
        let (queue, registrar) = setup();
        registrar
            .register(&task(1, "0 0 1 1 *", true), FailurePolicy::Propagate)
            .await
            .unwrap();
        registrar
            .register(&task(2, "0 0 1 1 *", true), FailurePolicy::Propagate)
            .await
            .unwrap();
        registrar.unregister(1, FailurePolicy::Propagate).await.unwrap();
        queue
            .add(
                "manual",
                JobPayload {
                    task_id: 1,
                    command: "echo hi".to_string(),
                    ..JobPayload::default()
                },
                JobOptions::default(),
                std::time::Duration::from_secs(3600),
            )
            .unwrap();

        let drained = registrar.drain_queued(1, FailurePolicy::Propagate).await.unwrap();
        assert_eq!(drained.len(), 1);

        let remaining = queue.get_jobs(&JobState::QUEUED).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].data.task_id, 2);
    }

    #[tokio::test]
    async fn test_drain_skips_jobs_that_moved_on() {
        let inner = Arc::new(LocalQueue::new("test", 64));
        let registrar = ScheduleRegistrar::new(Arc::new(LockedQueue(Arc::clone(&inner))), 1);
        let job = inner
            .add(
                "manual",
                JobPayload {
                    task_id: 1,
                    command: "echo hi".to_string(),
                    ..JobPayload::default()
                },
                JobOptions::default(),
                std::time::Duration::ZERO,
            )
            .unwrap();

        let drained = registrar.drain_queued(1, FailurePolicy::Propagate).await.unwrap();
        assert!(drained.is_empty());
        assert!(inner.get_job(&job.id).await.unwrap().is_some());
    }
}
