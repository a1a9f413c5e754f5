//! Scheduling: cron evaluation, schedule registration and synchronization,
//! and command execution for queued jobs.

pub mod cron;
pub mod executor;
pub mod registrar;
pub mod synchronizer;
pub mod worker;

pub use cron::{CronExpression, CronParser, next_run_time, next_run_time_after};
pub use executor::{CommandExecutor, truncate_output};
pub use registrar::ScheduleRegistrar;
pub use synchronizer::{ScheduleState, ScheduleSynchronizer, Transition};
pub use worker::ExecutionWorker;
