use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use scheduler_core::ExecutionCompletedMessage;

use crate::tracker::ExecutionTracker;

/// 完成通道的消费者
///
/// 从工作池接收 [`ExecutionCompletedMessage`] 并交给执行追踪器落库。
/// 所有发送端关闭后 `run` 返回。
pub struct StateListener {
    tracker: Arc<ExecutionTracker>,
}

impl StateListener {
    pub fn new(tracker: Arc<ExecutionTracker>) -> Self {
        Self { tracker }
    }

    pub async fn run(&self, mut completions: mpsc::Receiver<ExecutionCompletedMessage>) {
        info!("状态监听器启动");
        while let Some(message) = completions.recv().await {
            self.process_completion(&message).await;
        }
        info!("完成通道已关闭，状态监听器停止");
    }

    pub async fn process_completion(&self, message: &ExecutionCompletedMessage) {
        debug!(
            execution_id = %message.execution_id,
            status = %message.result.status,
            "处理执行完成消息"
        );
        match self.tracker.on_finish(message).await {
            Ok(Some(_)) => {}
            Ok(None) => debug!(execution_id = %message.execution_id, "重复的完成消息已忽略"),
            Err(e) => error!(
                execution_id = %message.execution_id,
                task_id = %message.task_id,
                "写入执行结果失败: {}", e
            ),
        }
    }
}
