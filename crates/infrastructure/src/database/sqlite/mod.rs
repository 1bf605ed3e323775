pub mod sqlite_execution_repository;
pub mod sqlite_job_store;
pub mod sqlite_task_registry;

pub use sqlite_execution_repository::SqliteExecutionRepository;
pub use sqlite_job_store::SqliteJobStore;
pub use sqlite_task_registry::SqliteTaskRegistry;
