//! End-to-end: queue worker, command executor, reconciler and metrics.

mod common;

use std::time::Duration;

use cronwork::domain::{ExecutionStatus, NewTask, TaskPatch};
use cronwork::queue::{JobOptions, JobPayload};
use cronwork::scheduler::ScheduleRegistrar;
use tokio_util::sync::CancellationToken;

use common::{runtime, wait_for_execution};

const YEARLY: &str = "0 0 1 1 *";

fn one_shot(task_id: i64, command: &str) -> JobPayload {
    JobPayload {
        task_id,
        command: command.to_string(),
        ..JobPayload::default()
    }
}

fn remove_when_done() -> JobOptions {
    JobOptions {
        attempts: 1,
        remove_on_complete: true,
        remove_on_fail: true,
    }
}

#[tokio::test]
async fn test_echo_job_records_completed_execution() {
    let runtime = runtime();
    let task = runtime
        .service
        .create_task(&NewTask::new("greet", YEARLY, "echo hi"))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handles = runtime.start(&shutdown);

    runtime
        .queue
        .add("greet", one_shot(task.id, "echo hi"), remove_when_done(), Duration::ZERO)
        .unwrap();

    let row = wait_for_execution(&runtime.db, task.id, |row| {
        row.status == ExecutionStatus::Completed
    })
    .await
    .expect("execution should complete");

    shutdown.cancel();
    handles.join().await;

    assert_eq!(row.exit_code, Some(0));
    assert_eq!(row.stdout.as_deref(), Some("hi\n"));
    assert!(row.started_at.is_some());
    assert!(row.finished_at.is_some());
    assert!(row.duration_ms.is_some_and(|ms| ms >= 0));

    let metrics = runtime.service.task_metrics(task.id).await.unwrap();
    assert_eq!(metrics.total_runs, 1);
    assert_eq!(metrics.failed_runs, 0);
    assert_eq!(metrics.last_run_at, row.finished_at);
}

#[tokio::test]
async fn test_non_zero_exit_is_captured_not_thrown() {
    let runtime = runtime();
    let task = runtime
        .service
        .create_task(&NewTask::new("broken", YEARLY, "true"))
        .await
        .unwrap();

    let shutdown = CancellationToken::new();
    let handles = runtime.start(&shutdown);

    runtime
        .queue
        .add(
            "broken",
            one_shot(task.id, "echo oops >&2; exit 3"),
            remove_when_done(),
            Duration::ZERO,
        )
        .unwrap();

    let row = wait_for_execution(&runtime.db, task.id, |row| row.status.is_terminal())
        .await
        .expect("execution should finish");

    shutdown.cancel();
    handles.join().await;

    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.exit_code, Some(3));
    assert_eq!(row.stderr.as_deref(), Some("oops\n"));
}

#[tokio::test]
async fn test_every_second_schedule_fires_until_disabled() {
    let runtime = runtime();
    let task = runtime
        .service
        .create_task(&NewTask::new("tick", "* * * * * *", "echo tick"))
        .await
        .unwrap();
    let key = ScheduleRegistrar::scheduler_key(task.id);
    assert!(runtime.queue.has_scheduler(&key));

    let shutdown = CancellationToken::new();
    let handles = runtime.start(&shutdown);

    let prefix = format!("repeat:{key}:");
    let row = wait_for_execution(&runtime.db, task.id, |row| {
        row.status == ExecutionStatus::Completed && row.id.starts_with(&prefix)
    })
    .await
    .expect("scheduled occurrence should run");
    assert_eq!(row.stdout.as_deref(), Some("tick\n"));

    let metrics = runtime.service.task_metrics(task.id).await.unwrap();
    assert!(metrics.next_run_at.is_some());

    runtime
        .service
        .update_task(task.id, &TaskPatch::enabled(false))
        .await
        .unwrap();
    assert!(!runtime.queue.has_scheduler(&key));

    shutdown.cancel();
    handles.join().await;

    let metrics = runtime.service.task_metrics(task.id).await.unwrap();
    assert!(metrics.total_runs >= 1);
}

#[tokio::test]
async fn test_restore_registers_enabled_tasks_only() {
    let runtime = runtime();
    let enabled = runtime
        .service
        .create_task(&NewTask::new("on", YEARLY, "true"))
        .await
        .unwrap();
    let disabled = runtime
        .service
        .create_task(&NewTask::new("off", YEARLY, "true").with_enabled(false))
        .await
        .unwrap();

    // A fresh process starts with an empty embedded queue over the same store.
    let restarted = cronwork::Runtime::with_database(&common::test_config(), runtime.db.clone());
    assert_eq!(restarted.queue.scheduler_count(), 0);

    let restored = restarted.service.restore_schedules().await.unwrap();
    assert_eq!(restored, 1);
    assert!(restarted
        .queue
        .has_scheduler(&ScheduleRegistrar::scheduler_key(enabled.id)));
    assert!(!restarted
        .queue
        .has_scheduler(&ScheduleRegistrar::scheduler_key(disabled.id)));
}
