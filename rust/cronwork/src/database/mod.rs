//! Storage layer: task definitions, execution history and metrics.

pub mod memory;
pub mod repository;
pub mod schema;
pub mod sqlite;

pub use memory::InMemoryStore;
pub use repository::{
    Database, ExecutionRepository, MetricsRepository, TaskFilter, TaskRepository,
};
pub use sqlite::SqliteStore;
