use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    ExecutionCompletedMessage, ExecutionRequest, ExecutionResult, TaskExecutionMessage,
    TaskExecutor,
};

/// 工作池
///
/// 消费调度通道中的执行请求，每个请求在独立的 tokio 任务中执行，
/// 并发数受信号量限制；执行结果发往完成通道，由执行追踪器落库。
/// 慢脚本只占用自己的并发槽位，不会拖慢调度循环。
pub struct WorkerPool {
    executor: Arc<dyn TaskExecutor>,
    semaphore: Arc<Semaphore>,
    max_concurrent: usize,
    completions: mpsc::Sender<ExecutionCompletedMessage>,
}

impl WorkerPool {
    pub fn new(
        executor: Arc<dyn TaskExecutor>,
        max_concurrent: usize,
        completions: mpsc::Sender<ExecutionCompletedMessage>,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            executor,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            completions,
        }
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// 当前空闲的并发槽位数
    pub fn available_slots(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// 运行工作池，直到收到关闭信号或调度通道关闭
    ///
    /// 关闭时取消所有运行中的执行并在 `shutdown_timeout` 内等待其结束，
    /// 通道中尚未开始的请求以 `cancelled` 结束。超时仍未结束的执行会被丢弃，
    /// 其进程随之被杀死，执行记录在下次启动时按中断处理。
    pub async fn run(
        &self,
        mut dispatch_rx: mpsc::Receiver<TaskExecutionMessage>,
        shutdown: CancellationToken,
        shutdown_timeout: Duration,
    ) {
        info!(
            executor = self.executor.name(),
            max_concurrent = self.max_concurrent,
            "工作池启动"
        );

        let mut running: JoinSet<String> = JoinSet::new();
        let mut in_flight: HashMap<String, CancellationToken> = HashMap::new();

        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("工作池收到停止信号");
                    break;
                }
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    self.on_joined(joined, &mut in_flight);
                }
                message = dispatch_rx.recv() => {
                    let Some(message) = message else {
                        info!("调度通道已关闭，工作池不再接收新的执行");
                        break;
                    };

                    let permit = tokio::select! {
                        permit = self.semaphore.clone().acquire_owned() => permit,
                        _ = shutdown.cancelled() => {
                            self.reject(message, "调度器关闭，执行未开始").await;
                            break;
                        }
                    };
                    let Ok(permit) = permit else {
                        self.reject(message, "工作池已关闭").await;
                        break;
                    };

                    in_flight.insert(message.execution_id.clone(), message.cancel_token.clone());
                    let executor = self.executor.clone();
                    let completions = self.completions.clone();
                    running.spawn(async move {
                        let execution_id = execute_one(executor, message, completions).await;
                        drop(permit);
                        execution_id
                    });
                }
            }
        }

        dispatch_rx.close();
        while let Ok(message) = dispatch_rx.try_recv() {
            self.reject(message, "调度器关闭，执行未开始").await;
        }

        if running.is_empty() {
            info!("工作池已停止");
            return;
        }

        info!("取消 {} 个运行中的执行", in_flight.len());
        for token in in_flight.values() {
            token.cancel();
        }

        let drained = tokio::time::timeout(shutdown_timeout, async {
            while let Some(joined) = running.join_next().await {
                self.on_joined(joined, &mut in_flight);
            }
        })
        .await;

        if drained.is_err() {
            warn!(
                remaining = running.len(),
                "关闭超时，放弃仍在运行的执行，下次启动时按中断处理"
            );
            running.abort_all();
        }
        info!("工作池已停止");
    }

    fn on_joined(
        &self,
        joined: Result<String, tokio::task::JoinError>,
        in_flight: &mut HashMap<String, CancellationToken>,
    ) {
        match joined {
            Ok(execution_id) => {
                in_flight.remove(&execution_id);
            }
            Err(e) => error!("执行任务异常退出: {}", e),
        }
    }

    /// 以 `cancelled` 结束一个未开始的执行
    async fn reject(&self, message: TaskExecutionMessage, reason: &str) {
        debug!(execution_id = %message.execution_id, "{}", reason);
        let completed = ExecutionCompletedMessage {
            execution_id: message.execution_id,
            task_id: message.task.id,
            result: ExecutionResult::cancelled(reason),
            finished_at: Utc::now(),
        };
        if self.completions.send(completed).await.is_err() {
            warn!("完成通道已关闭，无法上报未开始的执行");
        }
    }
}

async fn execute_one(
    executor: Arc<dyn TaskExecutor>,
    message: TaskExecutionMessage,
    completions: mpsc::Sender<ExecutionCompletedMessage>,
) -> String {
    let TaskExecutionMessage {
        execution_id,
        task,
        scheduled_time,
        cancel_token,
    } = message;
    debug!(
        execution_id = %execution_id,
        task_id = %task.id,
        scheduled_time = %scheduled_time,
        "开始执行任务"
    );

    let request = ExecutionRequest {
        execution_id: execution_id.clone(),
        task,
    };
    let result = executor.execute(&request, cancel_token).await;

    let completed = ExecutionCompletedMessage {
        execution_id: execution_id.clone(),
        task_id: request.task.id,
        result,
        finished_at: Utc::now(),
    };
    if completions.send(completed).await.is_err() {
        error!(execution_id = %execution_id, "完成通道已关闭，执行结果丢失");
    }
    execution_id
}
