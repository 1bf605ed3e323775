use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use scheduler_core::{
    ExecutionStatus, SchedulerError, SchedulerResult, Task, TaskExecution, TaskFilter,
    TaskRegistry,
};

use crate::scheduler::TaskScheduler;
use crate::trigger::TriggerResolver;

const MAX_NAME_CHARS: usize = 100;
const MAX_SCRIPT_PATH_CHARS: usize = 500;
const MAX_DESCRIPTION_CHARS: usize = 500;
const MAX_CRON_CHARS: usize = 100;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TaskStatusSummary {
    pub running: usize,
    pub success: usize,
    pub failed: usize,
    pub timeout: usize,
    pub cancelled: usize,
    pub missed: usize,
}

impl TaskStatusSummary {
    pub fn total(&self) -> usize {
        self.running + self.finished()
    }

    pub fn finished(&self) -> usize {
        self.success + self.failed + self.timeout + self.cancelled + self.missed
    }
}

/// 任务控制器
///
/// 协调任务注册表与调度核心：先做形状校验（失败时不修改任何状态），
/// 再写注册表并同步调度记录。
pub struct TaskController {
    registry: Arc<dyn TaskRegistry>,
    scheduler: Arc<TaskScheduler>,
}

impl TaskController {
    pub fn new(registry: Arc<dyn TaskRegistry>, scheduler: Arc<TaskScheduler>) -> Self {
        Self {
            registry,
            scheduler,
        }
    }

    /// 校验任务定义
    pub fn validate_task(task: &Task) -> SchedulerResult<()> {
        let name_len = task.name.trim().chars().count();
        if name_len == 0 || name_len > MAX_NAME_CHARS {
            return Err(SchedulerError::InvalidTask(format!(
                "任务名称长度必须在1到{MAX_NAME_CHARS}个字符之间"
            )));
        }

        if task.script_path.trim().is_empty() {
            return Err(SchedulerError::InvalidTask("脚本路径不能为空".to_string()));
        }
        if task.script_path.chars().count() > MAX_SCRIPT_PATH_CHARS {
            return Err(SchedulerError::InvalidTask(format!(
                "脚本路径不能超过{MAX_SCRIPT_PATH_CHARS}个字符"
            )));
        }

        if let Some(description) = &task.description {
            if description.chars().count() > MAX_DESCRIPTION_CHARS {
                return Err(SchedulerError::InvalidTask(format!(
                    "任务描述不能超过{MAX_DESCRIPTION_CHARS}个字符"
                )));
            }
        }

        if let Some(expression) = &task.cron_expression {
            if expression.chars().count() > MAX_CRON_CHARS {
                return Err(SchedulerError::InvalidTask(format!(
                    "cron表达式不能超过{MAX_CRON_CHARS}个字符"
                )));
            }
        }

        if task.timeout_seconds < 1 {
            return Err(SchedulerError::InvalidTask(
                "超时时间必须大于等于1秒".to_string(),
            ));
        }

        TriggerResolver::validate(&task.trigger()?)
    }

    pub async fn get_task(&self, task_id: &str) -> SchedulerResult<Task> {
        self.registry
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })
    }

    pub async fn list_tasks(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        self.registry.list(filter).await
    }

    /// 创建任务，启用时同步创建调度记录
    pub async fn create_task(&self, task: &Task) -> SchedulerResult<Task> {
        Self::validate_task(task)?;

        let created = self.registry.create(task).await?;
        info!(task_id = %created.id, name = %created.name, "任务已创建");

        if created.is_schedulable() {
            self.scheduler.add(&created).await?;
        }
        Ok(created)
    }

    pub async fn update_task(&self, task: &Task) -> SchedulerResult<Task> {
        Self::validate_task(task)?;

        let updated = self.registry.update(task).await?;
        self.scheduler.update(&updated).await?;
        info!(task_id = %updated.id, "任务已更新");
        Ok(updated)
    }

    /// 逻辑删除：先移除调度记录，再标记删除
    pub async fn delete_task(&self, task_id: &str) -> SchedulerResult<()> {
        self.get_task(task_id).await?;
        self.scheduler.remove(task_id).await?;
        self.registry.soft_delete(task_id).await?;
        info!(task_id, "任务已删除");
        Ok(())
    }

    pub async fn restore_task(&self, task_id: &str) -> SchedulerResult<Task> {
        self.registry.restore(task_id).await?;
        let task = self.get_task(task_id).await?;
        if task.is_schedulable() {
            self.scheduler.add(&task).await?;
        }
        info!(task_id, "任务已恢复");
        Ok(task)
    }

    pub async fn set_enabled(&self, task_id: &str, enabled: bool) -> SchedulerResult<()> {
        if enabled {
            self.resume_task(task_id).await.map(|_| ())
        } else {
            self.pause_task(task_id).await
        }
    }

    /// 暂停任务：删除调度记录并禁用任务，重启后依旧保持暂停
    pub async fn pause_task(&self, task_id: &str) -> SchedulerResult<()> {
        self.get_task(task_id).await?;
        self.scheduler.pause(task_id).await?;
        self.registry.set_enabled(task_id, false).await?;
        info!(task_id, "任务已暂停");
        Ok(())
    }

    pub async fn resume_task(&self, task_id: &str) -> SchedulerResult<Option<DateTime<Utc>>> {
        let task = self.get_task(task_id).await?;
        if task.deleted {
            return Err(SchedulerError::InvalidTask(format!(
                "任务 {task_id} 已删除，请先恢复"
            )));
        }
        // 校验在前：触发器无效时不启用任务
        Self::validate_task(&task)?;

        self.registry.set_enabled(task_id, true).await?;
        self.scheduler.resume(task_id).await
    }

    /// 立即执行一次；已有运行中的执行时返回 `None`
    ///
    /// 执行期失败不会以错误返回，只体现在执行记录中。
    pub async fn run_task_now(&self, task_id: &str) -> SchedulerResult<Option<String>> {
        let execution_id = self.scheduler.run_now(task_id).await?;
        if execution_id.is_none() {
            warn!(task_id, "任务已有正在运行的实例，跳过手动触发");
        }
        Ok(execution_id)
    }

    pub fn cancel_execution(&self, execution_id: &str) -> bool {
        self.scheduler.cancel(execution_id)
    }

    pub async fn list_executions(
        &self,
        task_id: &str,
        limit: i64,
        status: Option<ExecutionStatus>,
    ) -> SchedulerResult<Vec<TaskExecution>> {
        self.scheduler.tracker().list(task_id, limit, status).await
    }

    /// 最近 `limit` 次执行的状态分布
    pub async fn get_task_status_summary(
        &self,
        task_id: &str,
        limit: i64,
    ) -> SchedulerResult<TaskStatusSummary> {
        let executions = self.list_executions(task_id, limit, None).await?;
        let mut summary = TaskStatusSummary::default();

        for execution in executions {
            match execution.status {
                ExecutionStatus::Pending | ExecutionStatus::Running => summary.running += 1,
                ExecutionStatus::Success => summary.success += 1,
                ExecutionStatus::Failed => summary.failed += 1,
                ExecutionStatus::Timeout => summary.timeout += 1,
                ExecutionStatus::Cancelled => summary.cancelled += 1,
                ExecutionStatus::Missed => summary.missed += 1,
            }
        }
        Ok(summary)
    }
}
