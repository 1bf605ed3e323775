use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use super::{ExecutionResult, Task};

/// 调度循环交给工作池的执行请求
///
/// 任务为触发时刻的快照；`cancel_token` 由调度器保留一份，
/// 用于 `cancel(execution_id)` 和关闭时的取消。
#[derive(Debug, Clone)]
pub struct TaskExecutionMessage {
    pub execution_id: String,
    pub task: Task,
    pub scheduled_time: DateTime<Utc>,
    pub cancel_token: CancellationToken,
}

/// 工作池执行完成后发往完成通道的消息
#[derive(Debug, Clone)]
pub struct ExecutionCompletedMessage {
    pub execution_id: String,
    pub task_id: String,
    pub result: ExecutionResult,
    pub finished_at: DateTime<Utc>,
}
