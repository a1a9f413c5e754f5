//! SQLite store on a real file.

use chrono::{Duration, Utc};
use tokio::task::JoinSet;

use cronwork::database::{Database, ExecutionRepository, MetricsRepository, TaskRepository};
use cronwork::domain::{ExecutionStatus, NewTask};
use cronwork::reconciler::StatusUpdate;

async fn open(dir: &tempfile::TempDir) -> Database {
    let path = dir.path().join("data").join("cronwork.db");
    Database::open(path.to_str().unwrap()).await.unwrap()
}

#[tokio::test]
async fn test_data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let task_id = {
        let db = open(&dir).await;
        let task = db
            .insert_task(&NewTask::new("nightly", "0 2 * * *", "echo nightly"))
            .await
            .unwrap();
        let mut done = StatusUpdate::new("repeat:1:1700000000000", task.id, ExecutionStatus::Completed);
        done.exit_code = Some(0);
        done.stdout = Some("nightly\n".to_string());
        db.upsert_execution(&done).await.unwrap();
        db.record_terminal_run(task.id, false, Utc::now()).await.unwrap();
        task.id
    };

    let db = open(&dir).await;
    let task = db.get_task(task_id).await.unwrap().unwrap();
    assert_eq!(task.command, "echo nightly");

    let row = db.get_execution("repeat:1:1700000000000").await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.stdout.as_deref(), Some("nightly\n"));

    let metrics = db.get_metrics(task_id).await.unwrap().unwrap();
    assert_eq!(metrics.total_runs, 1);
}

#[tokio::test]
async fn test_concurrent_terminal_runs_are_not_lost() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    let task = db
        .insert_task(&NewTask::new("busy", "* * * * *", "true"))
        .await
        .unwrap();

    let mut set = JoinSet::new();
    for n in 0..20 {
        let db = db.clone();
        set.spawn(async move { db.record_terminal_run(task.id, n % 4 == 0, Utc::now()).await });
    }
    while let Some(joined) = set.join_next().await {
        joined.unwrap().unwrap();
    }

    let metrics = db.get_metrics(task.id).await.unwrap().unwrap();
    assert_eq!(metrics.total_runs, 20);
    assert_eq!(metrics.failed_runs, 5);
    assert!(metrics.last_run_at.is_some());
}

#[tokio::test]
async fn test_terminal_row_is_sticky_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    let task = db
        .insert_task(&NewTask::new("sticky", "* * * * *", "true"))
        .await
        .unwrap();

    let finished = Utc::now();
    let mut done = StatusUpdate::new("job-1", task.id, ExecutionStatus::Completed);
    done.exit_code = Some(0);
    done.job_started_at = Some(finished - Duration::milliseconds(250));
    done.job_finished_at = Some(finished);
    let first = db.upsert_execution(&done).await.unwrap();
    assert!(first.written);

    let late = db
        .upsert_execution(&StatusUpdate::new("job-1", task.id, ExecutionStatus::Active))
        .await
        .unwrap();
    assert!(!late.written);
    assert_eq!(late.previous_status, Some(ExecutionStatus::Completed));

    let row = db.get_execution("job-1").await.unwrap().unwrap();
    assert_eq!(row.status, ExecutionStatus::Completed);
    assert_eq!(row.exit_code, Some(0));
    assert_eq!(row.duration_ms, Some(250));
}

#[tokio::test]
async fn test_name_filter_honours_wildcards() {
    let dir = tempfile::tempdir().unwrap();
    let db = open(&dir).await;
    for name in ["backup-db", "backup-files", "rotate-logs"] {
        db.insert_task(&NewTask::new(name, "* * * * *", "true"))
            .await
            .unwrap();
    }

    let filter = cronwork::database::TaskFilter {
        name_like: Some("backup-%".to_string()),
        after_id: None,
        limit: 10,
    };
    let names: Vec<String> = db
        .list_tasks(&filter)
        .await
        .unwrap()
        .into_iter()
        .map(|task| task.name)
        .collect();
    assert_eq!(names, vec!["backup-db", "backup-files"]);
}
