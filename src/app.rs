use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use scheduler_core::{
    AppConfig, ExecutionCompletedMessage, ExecutionRequest, ExecutionRepository, JobStore,
    TaskExecution, TaskExecutionMessage, TaskExecutor, TaskRegistry,
};
use scheduler_dispatcher::{
    ExecutionTracker, RecoveryService, StateListener, TaskController, TaskScheduler,
};
use scheduler_infrastructure::{DatabaseManager, MetricsCollector};
use scheduler_worker::{ScriptExecutor, WorkerPool};

/// 完成通道容量
const COMPLETION_CHANNEL_CAPACITY: usize = 1024;
/// 工作池等待进程组终止之外的额外关闭时间
const SHUTDOWN_MARGIN_SECONDS: u64 = 10;
/// 工作池停止后等待剩余完成消息落库的时间
const LISTENER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// 主应用程序
///
/// 组合根：打开数据库，构造调度核心、执行追踪器、工作池和完成监听器，
/// 并用两条通道把它们连接起来：
///
/// ```text
/// TaskScheduler --dispatch--> WorkerPool --completion--> StateListener -> ExecutionTracker
/// ```
pub struct Application {
    config: AppConfig,
    tracker: Arc<ExecutionTracker>,
    scheduler: Arc<TaskScheduler>,
    controller: TaskController,
    executor: Arc<ScriptExecutor>,
    dispatch_rx: mpsc::Receiver<TaskExecutionMessage>,
    completion_tx: mpsc::Sender<ExecutionCompletedMessage>,
    completion_rx: mpsc::Receiver<ExecutionCompletedMessage>,
}

impl Application {
    pub async fn new(config: AppConfig) -> Result<Self> {
        let database = DatabaseManager::new(&config.database)
            .await
            .with_context(|| format!("连接数据库失败: {}", config.database.url))?;
        Ok(Self::with_database(config, database))
    }

    /// 使用已打开的数据库构造应用（测试中传入内存数据库）
    ///
    /// 各仓储持有连接池的句柄，最后一个句柄释放时连接池关闭。
    pub fn with_database(config: AppConfig, database: DatabaseManager) -> Self {
        let metrics = Arc::new(MetricsCollector::new());
        let registry: Arc<dyn TaskRegistry> = Arc::new(database.task_registry());
        let job_store: Arc<dyn JobStore> = Arc::new(database.job_store());
        let executions: Arc<dyn ExecutionRepository> = Arc::new(database.execution_repository());

        let (dispatch_tx, dispatch_rx) =
            mpsc::channel(config.scheduler.dispatch_channel_capacity.max(1));
        let (completion_tx, completion_rx) = mpsc::channel(COMPLETION_CHANNEL_CAPACITY);

        let tracker = Arc::new(ExecutionTracker::new(executions, metrics.clone()).with_retry(
            config.scheduler.persistence_retry_attempts,
            Duration::from_millis(config.scheduler.persistence_retry_backoff_ms),
        ));
        let scheduler = Arc::new(TaskScheduler::new(
            config.scheduler.clone(),
            job_store,
            registry.clone(),
            tracker.clone(),
            dispatch_tx,
            metrics,
        ));
        let controller = TaskController::new(registry, scheduler.clone());
        let executor = Arc::new(ScriptExecutor::new(config.executor.clone()));

        Self {
            config,
            tracker,
            scheduler,
            controller,
            executor,
            dispatch_rx,
            completion_tx,
            completion_rx,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn controller(&self) -> &TaskController {
        &self.controller
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    /// 载入持久化的调度记录（只读命令也需要，用于展示下一次触发时间）
    pub async fn restore_schedule(&self) -> Result<()> {
        self.scheduler
            .restore()
            .await
            .context("载入调度记录失败")?;
        Ok(())
    }

    /// 在前台执行一次任务，不经过调度循环和工作池
    ///
    /// `cancel` 被取消时终止脚本，执行记录为 `cancelled`。
    pub async fn run_task_foreground(
        &self,
        task_id: &str,
        cancel: CancellationToken,
    ) -> Result<TaskExecution> {
        let task = self.controller.get_task(task_id).await?;
        let started = self
            .tracker
            .on_start(&task, Utc::now())
            .await?
            .ok_or_else(|| anyhow!("任务 {task_id} 已有正在运行的执行"))?;

        let execution_id = started.execution.id.clone();
        let request = ExecutionRequest {
            execution_id: execution_id.clone(),
            task,
        };

        let token = started.cancel_token.clone();
        let forward = tokio::spawn(async move {
            cancel.cancelled().await;
            token.cancel();
        });
        let result = self.executor.execute(&request, started.cancel_token).await;
        forward.abort();

        self.tracker
            .on_finish(&ExecutionCompletedMessage {
                execution_id: execution_id.clone(),
                task_id: request.task.id.clone(),
                result,
                finished_at: Utc::now(),
            })
            .await?
            .ok_or_else(|| anyhow!("执行 {execution_id} 已被其他进程结束"))
    }

    /// 运行调度服务，直到 `shutdown` 被取消
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let Self {
            config,
            tracker,
            scheduler,
            executor,
            dispatch_rx,
            completion_tx,
            completion_rx,
            ..
        } = self;

        let report = RecoveryService::new(scheduler.clone())
            .recover_system_state()
            .await
            .context("启动恢复失败")?;
        info!(
            interrupted = report.interrupted_executions,
            jobs = report.reconcile.loaded,
            added = report.reconcile.added,
            removed = report.reconcile.removed,
            duration_ms = report.recovery_duration_ms,
            "系统状态恢复完成"
        );

        let listener = StateListener::new(tracker.clone());
        let listener_handle = tokio::spawn(async move { listener.run(completion_rx).await });

        let pool = WorkerPool::new(
            executor,
            config.executor.max_concurrent_executions,
            completion_tx,
        );
        let pool_timeout =
            Duration::from_secs(config.executor.kill_grace_period_seconds + SHUTDOWN_MARGIN_SECONDS);
        let pool_shutdown = shutdown.clone();
        let pool_handle =
            tokio::spawn(async move { pool.run(dispatch_rx, pool_shutdown, pool_timeout).await });

        scheduler.run(shutdown).await;

        info!("调度循环已停止，取消运行中的执行");
        tracker.cancel_all();
        if let Err(e) = pool_handle.await {
            error!("工作池异常退出: {}", e);
        }

        match tokio::time::timeout(LISTENER_DRAIN_TIMEOUT, listener_handle).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!("状态监听器异常退出: {}", e),
            Err(_) => warn!("等待完成消息落库超时"),
        }

        info!("应用已停止");
        Ok(())
    }
}
