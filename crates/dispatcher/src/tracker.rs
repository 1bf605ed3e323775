//! 执行追踪器
//!
//! 独占执行记录与任务计数器的写入。内存中维护"每个任务至多一个运行中执行"的表，
//! 调度核心据此做单实例检查；完成消息到达后持久化终态并释放该任务的占位。
//!
//! 存储层的插入同样带单实例守卫，覆盖共用同一数据库的其他进程（如前台运行的CLI）。
//! 终态写入失败时占位保留，完成消息留待 [`ExecutionTracker::retry_pending_finishes`] 重试。

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scheduler_core::{
    ExecutionCompletedMessage, ExecutionRepository, ExecutionResult, ExecutionStatus,
    SchedulerError, SchedulerResult, Task, TaskExecution,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};

/// 运行中的执行
#[derive(Debug, Clone)]
pub struct RunningExecution {
    pub execution_id: String,
    pub task_id: String,
    pub task_name: String,
    pub start_time: DateTime<Utc>,
    cancel_token: CancellationToken,
}

/// 启动成功后交给调度核心的句柄
#[derive(Debug, Clone)]
pub struct StartedExecution {
    pub execution: TaskExecution,
    pub cancel_token: CancellationToken,
}

pub struct ExecutionTracker {
    repo: Arc<dyn ExecutionRepository>,
    running: Mutex<HashMap<String, RunningExecution>>,
    /// 终态写入失败、等待重试的完成消息，按执行ID索引
    pending_finishes: Mutex<HashMap<String, ExecutionCompletedMessage>>,
    /// 所有执行取消令牌的父令牌，关闭时统一取消
    root_token: CancellationToken,
    retry_attempts: u32,
    retry_backoff: Duration,
    metrics: Arc<MetricsCollector>,
}

impl ExecutionTracker {
    pub fn new(repo: Arc<dyn ExecutionRepository>, metrics: Arc<MetricsCollector>) -> Self {
        Self {
            repo,
            running: Mutex::new(HashMap::new()),
            pending_finishes: Mutex::new(HashMap::new()),
            root_token: CancellationToken::new(),
            retry_attempts: 3,
            retry_backoff: Duration::from_millis(100),
            metrics,
        }
    }

    /// 设置完成写入的重试策略
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.retry_attempts = attempts.max(1);
        self.retry_backoff = backoff;
        self
    }

    /// 开始一次执行
    ///
    /// 任务已有运行中的执行时返回 `None`（单实例约束），不创建任何记录。
    /// 本进程内的占位表与存储中的运行中记录都会检查。
    pub async fn on_start(
        &self,
        task: &Task,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<StartedExecution>> {
        let execution = TaskExecution::start(task, now);
        let cancel_token = self.root_token.child_token();

        {
            let mut running = self.lock_running()?;
            if running.contains_key(&task.id) {
                return Ok(None);
            }
            running.insert(
                task.id.clone(),
                RunningExecution {
                    execution_id: execution.id.clone(),
                    task_id: task.id.clone(),
                    task_name: task.name.clone(),
                    start_time: execution.start_time,
                    cancel_token: cancel_token.clone(),
                },
            );
            self.metrics.update_executions_in_flight(running.len());
        }

        match self.repo.start(&execution).await {
            Ok(true) => {}
            Ok(false) => {
                self.release(&task.id, &execution.id);
                debug!(task_id = %task.id, "存储中已有该任务运行中的执行");
                return Ok(None);
            }
            Err(e) => {
                self.release(&task.id, &execution.id);
                return Err(e);
            }
        }

        StructuredLogger::log_execution_started(
            &execution.id,
            &task.id,
            &task.name,
            &task.script_path,
        );
        Ok(Some(StartedExecution {
            execution,
            cancel_token,
        }))
    }

    /// 写入执行结果并递增计数器，然后释放该任务的运行占位
    ///
    /// 重复的完成消息返回 `Ok(None)`，不会重复计数。
    /// 存储写入失败时返回错误但保留占位，消息进入重试队列，
    /// 在终态落盘之前该任务不会再次启动。
    pub async fn on_finish(
        &self,
        message: &ExecutionCompletedMessage,
    ) -> SchedulerResult<Option<TaskExecution>> {
        let outcome = self.persist_finish(message).await;
        self.settle(message, &outcome);
        outcome
    }

    /// 重试此前写入失败的完成消息，返回本轮成功落盘的数量
    pub async fn retry_pending_finishes(&self) -> usize {
        let pending: Vec<ExecutionCompletedMessage> = self
            .pending_finishes
            .lock()
            .map(|pending| pending.values().cloned().collect())
            .unwrap_or_default();

        let mut settled = 0;
        for message in pending {
            let outcome = self.persist_finish(&message).await;
            if !matches!(&outcome, Err(e) if e.is_persistence_error()) {
                settled += 1;
            }
            self.settle(&message, &outcome);
        }
        settled
    }

    pub fn pending_finish_count(&self) -> usize {
        self.pending_finishes
            .lock()
            .map(|pending| pending.len())
            .unwrap_or(0)
    }

    fn settle(
        &self,
        message: &ExecutionCompletedMessage,
        outcome: &SchedulerResult<Option<TaskExecution>>,
    ) {
        match outcome {
            Err(e) if e.is_persistence_error() => {
                warn!(
                    execution_id = %message.execution_id,
                    task_id = %message.task_id,
                    "执行结果写入失败，保留运行占位等待重试: {}", e
                );
                if let Ok(mut pending) = self.pending_finishes.lock() {
                    pending.insert(message.execution_id.clone(), message.clone());
                }
                return;
            }
            Ok(Some(execution)) => {
                let duration = execution.duration.unwrap_or(message.result.elapsed_seconds);
                StructuredLogger::log_execution_finished(
                    &execution.id,
                    &execution.task_id,
                    execution.status.as_str(),
                    execution.exit_code,
                    duration,
                    execution.error.as_deref(),
                );
                self.metrics
                    .record_execution_finished(execution.status.as_str(), duration);
            }
            _ => {}
        }

        if let Ok(mut pending) = self.pending_finishes.lock() {
            pending.remove(&message.execution_id);
        }
        self.release(&message.task_id, &message.execution_id);
    }

    async fn persist_finish(
        &self,
        message: &ExecutionCompletedMessage,
    ) -> SchedulerResult<Option<TaskExecution>> {
        let mut execution = self
            .repo
            .get(&message.execution_id)
            .await?
            .ok_or_else(|| SchedulerError::ExecutionNotFound {
                id: message.execution_id.clone(),
            })?;

        if execution.status.is_terminal() {
            debug!(execution_id = %execution.id, "执行已处于终态，忽略重复的完成消息");
            return Ok(None);
        }

        execution.finish(&message.result, message.finished_at)?;

        let mut attempt = 1;
        loop {
            match self.repo.finish(&execution).await {
                Ok(true) => return Ok(Some(execution)),
                Ok(false) => return Ok(None),
                Err(e) if attempt < self.retry_attempts => {
                    warn!(
                        execution_id = %execution.id,
                        attempt,
                        "写入执行结果失败，准备重试: {}", e
                    );
                    tokio::time::sleep(self.retry_backoff * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 以失败结束一次尚未交给工作池的执行
    pub async fn abort(
        &self,
        execution_id: &str,
        task_id: &str,
        reason: &str,
    ) -> SchedulerResult<Option<TaskExecution>> {
        self.on_finish(&ExecutionCompletedMessage {
            execution_id: execution_id.to_string(),
            task_id: task_id.to_string(),
            result: ExecutionResult::failed(reason),
            finished_at: Utc::now(),
        })
        .await
    }

    /// 记录一次错过宽限期的一次性触发，不影响计数器
    pub async fn record_missed(
        &self,
        task: &Task,
        scheduled_time: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<TaskExecution> {
        let execution = TaskExecution::missed(task, scheduled_time, now);
        self.repo.create(&execution).await?;
        self.metrics
            .record_execution_finished(ExecutionStatus::Missed.as_str(), 0.0);
        Ok(execution)
    }

    /// 启动时关闭上次进程遗留的 `pending` / `running` 执行，按失败计数
    ///
    /// 执行者进程仍然存活的记录（例如另一个进程正在前台运行）保持不动。
    pub async fn recover_interrupted(&self, now: DateTime<Utc>) -> SchedulerResult<usize> {
        let leftovers = self.repo.list_running().await?;
        let own_pid = i64::from(std::process::id());
        let mut recovered = 0;

        for mut execution in leftovers {
            if self.is_running(&execution.task_id) {
                continue;
            }
            if let Some(pid) = execution.runner_pid.filter(|pid| *pid != own_pid) {
                if process_alive(pid) {
                    debug!(
                        execution_id = %execution.id,
                        runner_pid = pid,
                        "执行者进程仍在运行，跳过恢复"
                    );
                    continue;
                }
            }
            execution.finish(
                &ExecutionResult::failed("调度器重启，执行被中断"),
                now,
            )?;
            if self.repo.finish(&execution).await? {
                warn!(
                    execution_id = %execution.id,
                    task_id = %execution.task_id,
                    "已关闭被中断的执行"
                );
                recovered += 1;
            }
        }

        if recovered > 0 {
            info!("共恢复 {} 个被中断的执行", recovered);
        }
        Ok(recovered)
    }

    /// 任务自 `since` 起是否已有执行记录（包括错过记录）
    pub async fn has_run_since(&self, task_id: &str, since: DateTime<Utc>) -> SchedulerResult<bool> {
        let latest = self.repo.list_by_task(task_id, 1, None).await?;
        Ok(latest.first().is_some_and(|e| e.start_time >= since))
    }

    pub async fn list(
        &self,
        task_id: &str,
        limit: i64,
        status: Option<ExecutionStatus>,
    ) -> SchedulerResult<Vec<TaskExecution>> {
        self.repo.list_by_task(task_id, limit, status).await
    }

    pub fn is_running(&self, task_id: &str) -> bool {
        self.running
            .lock()
            .map(|running| running.contains_key(task_id))
            .unwrap_or(false)
    }

    pub fn running(&self) -> Vec<RunningExecution> {
        let mut running: Vec<RunningExecution> = self
            .running
            .lock()
            .map(|running| running.values().cloned().collect())
            .unwrap_or_default();
        running.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        running
    }

    /// 取消一个运行中的执行，执行不存在时返回 `false`
    pub fn cancel(&self, execution_id: &str) -> bool {
        let token = self.running.lock().ok().and_then(|running| {
            running
                .values()
                .find(|r| r.execution_id == execution_id)
                .map(|r| r.cancel_token.clone())
        });

        match token {
            Some(token) => {
                info!(execution_id, "取消执行");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// 取消全部运行中的执行，用于关闭流程
    pub fn cancel_all(&self) {
        self.root_token.cancel();
    }

    fn release(&self, task_id: &str, execution_id: &str) {
        if let Ok(mut running) = self.running.lock() {
            if running
                .get(task_id)
                .is_some_and(|r| r.execution_id == execution_id)
            {
                running.remove(task_id);
            }
            self.metrics.update_executions_in_flight(running.len());
        }
    }

    fn lock_running(
        &self,
    ) -> SchedulerResult<std::sync::MutexGuard<'_, HashMap<String, RunningExecution>>> {
        self.running
            .lock()
            .map_err(|_| SchedulerError::Internal("执行追踪表锁已损坏".to_string()))
    }
}

#[cfg(unix)]
fn process_alive(pid: i64) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }
    // SAFETY: 信号0只检查进程是否存在，不发送任何信号
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: i64) -> bool {
    false
}
