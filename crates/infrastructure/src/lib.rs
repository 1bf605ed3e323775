pub mod database;
pub mod error_handling;
pub mod observability;

pub use database::{
    with_transaction, DatabaseManager, SqliteExecutionRepository, SqliteJobStore,
    SqliteTaskRegistry,
};
pub use observability::{MetricsCollector, StructuredLogger};
