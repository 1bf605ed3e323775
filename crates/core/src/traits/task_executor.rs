use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::models::{ExecutionResult, Task};

/// 执行请求
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub task: Task,
}

/// 单个任务的执行器
///
/// `execute` 总是返回一个结果：启动失败、非零退出、超时、取消都编码在
/// [`ExecutionResult::status`] 中，不会以错误的形式传给调用方。
///
/// ```rust,ignore
/// #[async_trait]
/// impl TaskExecutor for EchoExecutor {
///     async fn execute(&self, request: &ExecutionRequest, cancel: CancellationToken) -> ExecutionResult {
///         ExecutionResult::from_exit(Some(0), request.task.name.clone(), None, 0.0)
///     }
///
///     fn name(&self) -> &str {
///         "echo"
///     }
/// }
/// ```
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    async fn execute(&self, request: &ExecutionRequest, cancel: CancellationToken) -> ExecutionResult;

    fn name(&self) -> &str;
}
