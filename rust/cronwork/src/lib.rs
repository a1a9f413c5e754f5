//! Cronwork - cron-triggered shell command scheduler
//!
//! Task definitions (a cron expression, a shell command and optional
//! environment variables) live in SQLite. Each enabled task has a repeating
//! scheduler on a job queue; every queue lifecycle event is folded into a
//! durable execution row, and terminal runs feed per-task health metrics.
//!
//! # Architecture
//!
//! - [`config`]: Configuration loading and validation
//! - [`domain`]: Task, execution and metrics models
//! - [`database`]: Repository traits with SQLite and in-memory stores
//! - [`queue`]: Broker contract and the embedded [`queue::LocalQueue`]
//! - [`scheduler`]: Cron evaluation, schedule registration and sync, command execution
//! - [`reconciler`]: Lifecycle events to execution rows
//! - [`metrics`]: Per-task run counters
//! - [`service`]: Task operations with compensation on schedule failure
//! - [`api`]: HTTP endpoints
//! - [`runtime`]: Component wiring and background loops
//!
//! # Example
//!
//! ```rust,ignore
//! use cronwork::{config::AppConfig, runtime::Runtime};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let runtime = Runtime::build(&config).await?;
//!     let shutdown = CancellationToken::new();
//!     let handles = runtime.start(&shutdown);
//!     runtime.service.restore_schedules().await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:3030").await?;
//!     axum::serve(listener, cronwork::api::app(runtime.service.clone())).await?;
//!
//!     shutdown.cancel();
//!     handles.join().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod queue;
pub mod reconciler;
pub mod runtime;
pub mod saga;
pub mod scheduler;
pub mod service;

pub use error::{FailurePolicy, ScheduleError, ServiceError};
pub use runtime::Runtime;
pub use service::TaskService;
