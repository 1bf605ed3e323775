//! 持久化协作者接口定义
//!
//! - [`TaskRegistry`] - 任务注册表，任务定义的 CRUD 与逻辑删除
//! - [`JobStore`] - 调度记录的持久化存储，调度核心独占
//! - [`ExecutionRepository`] - 执行记录存储，执行追踪器独占
//!
//! 所有方法都是异步的，返回 `SchedulerResult<T>`，实现需满足 `Send + Sync`。
//! 写操作必须可以安全重试：保存调度记录是 upsert，删除是幂等的，
//! 完成执行记录带状态守卫，重复完成不会重复计数。

use async_trait::async_trait;

use crate::models::{ExecutionStatus, ScheduledJob, Task, TaskExecution, TaskFilter};
use crate::SchedulerResult;

/// 任务注册表
///
/// 调度核心只在对账时读取注册表，不复制其存储。
/// `update` 不得修改运行计数器，计数器只由执行追踪器维护。
#[async_trait]
pub trait TaskRegistry: Send + Sync {
    async fn get(&self, id: &str) -> SchedulerResult<Option<Task>>;

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>>;

    async fn create(&self, task: &Task) -> SchedulerResult<Task>;

    /// 更新任务定义，任务不存在时返回 `TaskNotFound`
    async fn update(&self, task: &Task) -> SchedulerResult<Task>;

    async fn soft_delete(&self, id: &str) -> SchedulerResult<()>;

    async fn restore(&self, id: &str) -> SchedulerResult<()>;

    async fn set_enabled(&self, id: &str, enabled: bool) -> SchedulerResult<()>;
}

/// 调度记录存储
///
/// 崩溃安全：`save` 返回成功后记录必须已持久化。
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn load_all(&self) -> SchedulerResult<Vec<ScheduledJob>>;

    /// 插入或覆盖
    async fn save(&self, job: &ScheduledJob) -> SchedulerResult<()>;

    /// 删除记录，记录不存在时同样返回成功
    async fn delete(&self, id: &str) -> SchedulerResult<()>;

    async fn health_check(&self) -> SchedulerResult<()>;
}

/// 执行记录存储
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// 直接插入一条记录，用于不参与单实例约束的终态记录（如 `missed`）
    async fn create(&self, execution: &TaskExecution) -> SchedulerResult<()>;

    /// 插入一条运行中的记录，前提是该任务没有任何 `pending` / `running` 记录
    ///
    /// 检查与插入是同一条语句，多个进程共用一个数据库时同样成立。
    /// 返回 `false` 表示任务已有运行中的执行，未插入任何内容。
    async fn start(&self, execution: &TaskExecution) -> SchedulerResult<bool>;

    async fn get(&self, id: &str) -> SchedulerResult<Option<TaskExecution>>;

    /// 写入终态并在同一事务中递增所属任务的计数器
    ///
    /// 只有处于 `pending` / `running` 的记录会被更新；
    /// 返回 `false` 表示记录已是终态（重复完成），此时不做任何修改。
    async fn finish(&self, execution: &TaskExecution) -> SchedulerResult<bool>;

    /// 按开始时间倒序返回某任务的执行记录
    async fn list_by_task(
        &self,
        task_id: &str,
        limit: i64,
        status: Option<ExecutionStatus>,
    ) -> SchedulerResult<Vec<TaskExecution>>;

    /// 所有仍处于 `pending` / `running` 的记录
    async fn list_running(&self) -> SchedulerResult<Vec<TaskExecution>>;
}
