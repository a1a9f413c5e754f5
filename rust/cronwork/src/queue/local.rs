//! In-process job queue.
//!
//! Keeps one scheduler per key and materializes its next occurrence as a
//! delayed job. A polling loop promotes due jobs to waiting and runs waiting
//! jobs on a bounded worker pool. Every state change is broadcast as a
//! [`QueueEvent`]. Nothing is persisted: schedulers are re-registered from
//! storage at startup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::{Semaphore, broadcast};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use super::{
    EventKind, Job, JobOptions, JobPayload, JobProcessor, JobQueue, JobState, JobTemplate,
    LifecycleEvent, QueueError, QueueEvent, RepeatOptions, repeat_job_id,
};
use crate::domain::ExecutionResult;
use crate::scheduler::cron::{CronExpression, CronParser};

#[derive(Debug)]
struct Scheduler {
    pattern: String,
    cron: CronExpression,
    template: JobTemplate,
    /// The delayed job holding the next occurrence.
    next_job_id: Option<String>,
}

#[derive(Debug, Default)]
struct QueueState {
    schedulers: HashMap<String, Scheduler>,
    jobs: HashMap<String, Job>,
    next_manual_id: u64,
    closed: bool,
}

impl QueueState {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    /// Create the delayed job for the scheduler's next occurrence after `now`.
    fn schedule_next(&mut self, key: &str, now: DateTime<Utc>, events: &mut Vec<QueueEvent>) {
        let Some(scheduler) = self.schedulers.get_mut(key) else {
            return;
        };
        let Some(run_at) = scheduler.cron.next_after(&now) else {
            tracing::warn!(key = key, pattern = %scheduler.pattern, "Schedule has no future occurrence");
            scheduler.next_job_id = None;
            return;
        };

        let job_id = repeat_job_id(key, run_at);
        scheduler.next_job_id = Some(job_id.clone());
        let template = scheduler.template.clone();

        if let Some(existing) = self.jobs.get_mut(&job_id) {
            existing.name = template.name;
            existing.data = template.data;
            existing.opts = template.opts;
            return;
        }

        // Round the delay up and back-date the creation time so that
        // `run_at()` is exactly the occurrence.
        let gap = run_at - now;
        let mut delay_ms = gap.num_milliseconds().max(0);
        if gap > chrono::Duration::milliseconds(delay_ms) {
            delay_ms += 1;
        }
        let job = Job {
            id: job_id.clone(),
            name: template.name,
            data: template.data,
            opts: template.opts,
            timestamp: run_at - chrono::Duration::milliseconds(delay_ms),
            delay_ms,
            processed_on: None,
            finished_on: None,
            attempts_made: 0,
            state: JobState::Delayed,
            scheduler_key: Some(key.to_string()),
        };
        events.push(lifecycle(&job, EventKind::Delayed));
        self.jobs.insert(job_id, job);
    }
}

fn lifecycle(job: &Job, kind: EventKind) -> QueueEvent {
    QueueEvent::Lifecycle(LifecycleEvent::new(job.id.clone(), kind).with_job(job.clone()))
}

/// In-process [`JobQueue`] with its own worker pool.
#[derive(Debug)]
pub struct LocalQueue {
    name: String,
    state: Mutex<QueueState>,
    events: broadcast::Sender<QueueEvent>,
}

impl LocalQueue {
    /// Create a queue whose event channel buffers `event_capacity` events.
    #[must_use]
    pub fn new(name: impl Into<String>, event_capacity: usize) -> Self {
        let (events, _) = broadcast::channel(event_capacity.max(1));
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            events,
        }
    }

    /// Subscribe to the event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.events.subscribe()
    }

    /// Reject further operations and stop the worker loop on its next tick.
    pub fn close(&self) {
        self.state.lock().closed = true;
    }

    /// Whether a scheduler is installed under `key`.
    #[must_use]
    pub fn has_scheduler(&self, key: &str) -> bool {
        self.state.lock().schedulers.contains_key(key)
    }

    /// Cron pattern of the scheduler under `key`.
    #[must_use]
    pub fn scheduler_pattern(&self, key: &str) -> Option<String> {
        self.state
            .lock()
            .schedulers
            .get(key)
            .map(|scheduler| scheduler.pattern.clone())
    }

    /// Number of installed schedulers.
    #[must_use]
    pub fn scheduler_count(&self) -> usize {
        self.state.lock().schedulers.len()
    }

    fn emit(&self, events: Vec<QueueEvent>) {
        for event in events {
            // No subscribers is fine.
            let _ = self.events.send(event);
        }
    }

    /// Add a one-off job, runnable after `delay`.
    pub fn add(
        &self,
        name: impl Into<String>,
        data: JobPayload,
        opts: JobOptions,
        delay: Duration,
    ) -> Result<Job, QueueError> {
        let now = Utc::now();
        let mut events = Vec::new();
        let job = {
            let mut state = self.state.lock();
            state.ensure_open()?;
            state.next_manual_id += 1;
            let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
            let job = Job {
                id: state.next_manual_id.to_string(),
                name: name.into(),
                data,
                opts,
                timestamp: now,
                delay_ms,
                processed_on: None,
                finished_on: None,
                attempts_made: 0,
                state: if delay_ms > 0 {
                    JobState::Delayed
                } else {
                    JobState::Waiting
                },
                scheduler_key: None,
            };
            let kind = if delay_ms > 0 {
                EventKind::Delayed
            } else {
                EventKind::Waiting
            };
            events.push(lifecycle(&job, kind));
            state.jobs.insert(job.id.clone(), job.clone());
            job
        };
        self.emit(events);
        Ok(job)
    }

    /// Move every delayed job due at `now` to waiting. Returns how many moved.
    ///
    /// A promoted scheduler occurrence immediately schedules the following one.
    pub fn promote_due(&self, now: DateTime<Utc>) -> usize {
        let mut events = Vec::new();
        let promoted = {
            let mut state = self.state.lock();
            if state.closed {
                return 0;
            }

            let mut due: Vec<(DateTime<Utc>, String)> = state
                .jobs
                .values()
                .filter(|job| job.state == JobState::Delayed && job.run_at() <= now)
                .map(|job| (job.run_at(), job.id.clone()))
                .collect();
            due.sort();

            for (run_at, job_id) in &due {
                let Some(job) = state.jobs.get_mut(job_id) else {
                    continue;
                };
                job.state = JobState::Waiting;
                events.push(lifecycle(job, EventKind::Waiting));

                let Some(key) = job.scheduler_key.clone() else {
                    continue;
                };
                let owns_schedule = state
                    .schedulers
                    .get(&key)
                    .is_some_and(|scheduler| scheduler.next_job_id.as_deref() == Some(job_id));
                if owns_schedule {
                    state.schedule_next(&key, now.max(*run_at), &mut events);
                }
            }
            due.len()
        };
        self.emit(events);
        promoted
    }

    /// Claim the oldest waiting job, marking it active.
    fn claim_next(&self, now: DateTime<Utc>) -> Option<Job> {
        let mut events = Vec::new();
        let claimed = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            let job_id = state
                .jobs
                .values()
                .filter(|job| job.state == JobState::Waiting)
                .min_by(|a, b| a.run_at().cmp(&b.run_at()).then_with(|| a.id.cmp(&b.id)))
                .map(|job| job.id.clone())?;
            let job = state.jobs.get_mut(&job_id)?;
            job.state = JobState::Active;
            job.processed_on = Some(now);
            job.finished_on = None;
            events.push(lifecycle(job, EventKind::Active));
            job.clone()
        };
        self.emit(events);
        Some(claimed)
    }

    /// Record the outcome of an attempt.
    fn finish(&self, job_id: &str, outcome: Result<Option<ExecutionResult>, String>) {
        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            let Some(job) = state.jobs.get_mut(job_id) else {
                tracing::warn!(queue = %self.name, job_id = job_id, "Finished job is no longer in the queue");
                return;
            };
            job.finished_on = Some(now);

            let remove = match outcome {
                Ok(result) => {
                    job.state = JobState::Completed;
                    job.data.execution_result.clone_from(&result);
                    events.push(lifecycle(
                        job,
                        EventKind::Completed {
                            return_value: result,
                        },
                    ));
                    job.opts.remove_on_complete
                }
                Err(reason) => {
                    job.attempts_made += 1;
                    job.state = JobState::Failed;
                    events.push(lifecycle(
                        job,
                        EventKind::Failed {
                            failed_reason: reason,
                        },
                    ));
                    if job.has_attempts_left() {
                        job.state = JobState::Waiting;
                        job.processed_on = None;
                        job.finished_on = None;
                        events.push(lifecycle(job, EventKind::Waiting));
                        false
                    } else {
                        job.opts.remove_on_fail
                    }
                }
            };

            if remove {
                state.jobs.remove(job_id);
            }
        }
        self.emit(events);
    }

    /// Run due jobs with at most `concurrency` in flight until `shutdown` fires.
    ///
    /// In-flight jobs are awaited before returning.
    pub async fn run(
        self: Arc<Self>,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
        poll_interval: Duration,
        shutdown: CancellationToken,
    ) {
        let concurrency = concurrency.max(1);
        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut ticker = tokio::time::interval(poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(queue = %self.name, concurrency = concurrency, "Queue worker started");

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            if self.state.lock().closed {
                break;
            }

            self.promote_due(Utc::now());

            loop {
                let Ok(permit) = Arc::clone(&semaphore).try_acquire_owned() else {
                    break;
                };
                let Some(job) = self.claim_next(Utc::now()) else {
                    break;
                };

                let queue = Arc::clone(&self);
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    let _permit = permit;
                    let job_id = job.id.clone();
                    let attempt = tokio::spawn(async move { processor.process(&job).await });
                    let outcome = match attempt.await {
                        Ok(Ok(result)) => Ok(result),
                        Ok(Err(e)) => Err(e.to_string()),
                        Err(join_error) => {
                            let message = format!("job processor panicked: {join_error}");
                            let _ = queue.events.send(QueueEvent::Error(message.clone()));
                            Err(message)
                        }
                    };
                    queue.finish(&job_id, outcome);
                });
            }
        }

        let permits = u32::try_from(concurrency).unwrap_or(u32::MAX);
        let _ = semaphore.acquire_many(permits).await;
        tracing::info!(queue = %self.name, "Queue worker stopped");
    }
}

#[async_trait]
impl JobQueue for LocalQueue {
    async fn upsert_job_scheduler(
        &self,
        key: &str,
        repeat: RepeatOptions,
        template: JobTemplate,
    ) -> Result<(), QueueError> {
        let cron = CronParser::parse(&repeat.pattern).map_err(|e| QueueError::InvalidPattern {
            pattern: repeat.pattern.clone(),
            reason: e.to_string(),
        })?;

        let now = Utc::now();
        let mut events = Vec::new();
        {
            let mut state = self.state.lock();
            state.ensure_open()?;

            let previous_job = state
                .schedulers
                .insert(
                    key.to_string(),
                    Scheduler {
                        pattern: repeat.pattern,
                        cron,
                        template,
                        next_job_id: None,
                    },
                )
                .and_then(|previous| previous.next_job_id);

            state.schedule_next(key, now, &mut events);

            let replaced = previous_job.filter(|id| {
                state.schedulers.get(key).and_then(|s| s.next_job_id.as_ref()) != Some(id)
            });
            if let Some(job_id) = replaced {
                if state
                    .jobs
                    .get(&job_id)
                    .is_some_and(|job| job.state == JobState::Delayed)
                {
                    state.jobs.remove(&job_id);
                }
            }
        }
        self.emit(events);
        Ok(())
    }

    async fn remove_job_scheduler(&self, key: &str) -> Result<bool, QueueError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let Some(scheduler) = state.schedulers.remove(key) else {
            return Ok(false);
        };
        if let Some(job_id) = scheduler.next_job_id {
            if state
                .jobs
                .get(&job_id)
                .is_some_and(|job| job.state == JobState::Delayed)
            {
                state.jobs.remove(&job_id);
            }
        }
        Ok(true)
    }

    async fn get_jobs(&self, states: &[JobState]) -> Result<Vec<Job>, QueueError> {
        let state = self.state.lock();
        state.ensure_open()?;

        let mut jobs: Vec<Job> = state
            .jobs
            .values()
            .filter(|job| states.contains(&job.state))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, QueueError> {
        let state = self.state.lock();
        state.ensure_open()?;
        Ok(state.jobs.get(job_id).cloned())
    }

    async fn remove_job(&self, job_id: &str) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let Some(job) = state.jobs.get(job_id) else {
            return Err(QueueError::JobNotFound(job_id.to_string()));
        };
        if job.state == JobState::Active {
            return Err(QueueError::JobLockMismatch(job_id.to_string()));
        }
        let owned_by_scheduler = job.scheduler_key.as_ref().is_some_and(|key| {
            state
                .schedulers
                .get(key)
                .is_some_and(|s| s.next_job_id.as_deref() == Some(job_id))
        });
        if owned_by_scheduler && job.state == JobState::Delayed {
            return Err(QueueError::JobBelongsToScheduler(job_id.to_string()));
        }

        state.jobs.remove(job_id);
        Ok(())
    }

    async fn update_job_data(&self, job_id: &str, data: JobPayload) -> Result<(), QueueError> {
        let mut state = self.state.lock();
        state.ensure_open()?;

        let job = state
            .jobs
            .get_mut(job_id)
            .ok_or_else(|| QueueError::JobNotFound(job_id.to_string()))?;
        job.data = data;
        Ok(())
    }
}
