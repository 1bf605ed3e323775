pub mod config;
pub mod errors;
pub mod models;
pub mod traits;

pub use config::{
    AppConfig, DatabaseConfig, ExecutorConfig, ObservabilityConfig, ScheduleTimezone,
    SchedulerConfig,
};
pub use errors::SchedulerError;
pub use models::{
    ExecutionCompletedMessage, ExecutionResult, ExecutionStatus, JobState, ScheduledJob, Task,
    TaskExecution, TaskExecutionMessage, TaskFilter, Trigger, TriggerType,
};
pub use traits::{
    ExecutionRepository, ExecutionRequest, JobStore, TaskExecutor, TaskRegistry,
};

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
