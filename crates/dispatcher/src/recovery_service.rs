use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use tracing::{error, info};

use scheduler_core::SchedulerResult;

use crate::scheduler::{ReconcileReport, TaskScheduler};

/// 恢复报告
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// 上次进程遗留、已按失败关闭的执行数
    pub interrupted_executions: usize,
    pub reconcile: ReconcileReport,
    pub recovery_duration_ms: u64,
}

/// 启动恢复服务
///
/// 在调度循环启动前执行：先关闭被中断的执行（保证每个任务至多一个 `running`），
/// 再载入持久化的调度记录并与任务注册表对账。
pub struct RecoveryService {
    scheduler: Arc<TaskScheduler>,
}

impl RecoveryService {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        Self { scheduler }
    }

    pub async fn recover_system_state(&self) -> SchedulerResult<RecoveryReport> {
        let started = Instant::now();
        info!("开始系统状态恢复");

        let interrupted_executions = self
            .scheduler
            .tracker()
            .recover_interrupted(Utc::now())
            .await
            .inspect_err(|e| error!("恢复被中断的执行失败: {}", e))?;

        let reconcile = self
            .scheduler
            .restore()
            .await
            .inspect_err(|e| error!("恢复调度记录失败: {}", e))?;

        let report = RecoveryReport {
            interrupted_executions,
            reconcile,
            recovery_duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(
            interrupted = report.interrupted_executions,
            loaded = report.reconcile.loaded,
            added = report.reconcile.added,
            removed = report.reconcile.removed,
            duration_ms = report.recovery_duration_ms,
            "系统状态恢复完成"
        );
        Ok(report)
    }
}
