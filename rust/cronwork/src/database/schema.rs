//! SQLite schema.
//!
//! Timestamps are stored as Unix epoch milliseconds.

/// Schema applied on every open. Statements are idempotent.
pub const SQLITE_SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS task_definitions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    description TEXT,
    cron TEXT NOT NULL,
    icon TEXT,
    command TEXT NOT NULL,
    envs TEXT, -- JSON object
    enabled INTEGER NOT NULL DEFAULT 1,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS task_executions (
    id TEXT PRIMARY KEY, -- queue job ID
    task_id INTEGER NOT NULL REFERENCES task_definitions(id) ON DELETE CASCADE,
    status TEXT NOT NULL
        CHECK (status IN ('waiting', 'active', 'completed', 'failed', 'delayed', 'stalled')),
    exit_code INTEGER,
    stdout TEXT,
    stderr TEXT,
    started_at INTEGER,
    finished_at INTEGER,
    duration_ms INTEGER,
    created_at INTEGER NOT NULL,
    updated_at INTEGER NOT NULL,
    attempt INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_task_exec_by_task_and_status
    ON task_executions(task_id, status);
CREATE INDEX IF NOT EXISTS idx_task_exec_by_status_created_at
    ON task_executions(status, created_at);
CREATE INDEX IF NOT EXISTS idx_task_exec_by_status_started_at
    ON task_executions(status, started_at);

CREATE TABLE IF NOT EXISTS task_metrics (
    task_id INTEGER PRIMARY KEY REFERENCES task_definitions(id) ON DELETE CASCADE,
    total_runs INTEGER NOT NULL DEFAULT 0,
    failed_runs INTEGER NOT NULL DEFAULT 0,
    last_run_at INTEGER,
    next_run_at INTEGER
);
";

/// Columns selected for a task definition, in `row_to_task` order.
pub const TASK_COLUMNS: &str =
    "id, name, description, cron, icon, command, envs, enabled, created_at, updated_at";

/// Columns selected for an execution, in `row_to_execution` order.
pub const EXECUTION_COLUMNS: &str = "id, task_id, status, exit_code, stdout, stderr, \
     started_at, finished_at, duration_ms, created_at, updated_at, attempt";
