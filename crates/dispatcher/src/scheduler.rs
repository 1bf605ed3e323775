//! 调度核心
//!
//! [`TaskScheduler`] 维护内存中的调度记录索引（与 [`JobStore`] 中的持久化记录一一对应），
//! 对外提供 add / update / remove / pause / resume，并运行单一的调度循环。
//!
//! 所有对索引的修改都在同一把异步锁内完成，并且先写存储、后改内存：
//! 存储写入失败时内存状态保持不变，调度记录既不会触发也不会前移。

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use scheduler_core::{
    JobStore, ScheduledJob, SchedulerConfig, SchedulerError, SchedulerResult, Task,
    TaskExecutionMessage, TaskFilter, TaskRegistry, Trigger,
};
use scheduler_infrastructure::{MetricsCollector, StructuredLogger};

use crate::tracker::{ExecutionTracker, RunningExecution};
use crate::trigger::{FireDecision, TriggerResolver};

/// 执行结果写入失败后的重试间隔
const PENDING_FINISH_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// 调度记录的只读视图
#[derive(Debug, Clone, PartialEq)]
pub struct JobInfo {
    pub task_id: String,
    pub task_name: String,
    pub trigger: Trigger,
    pub next_run_time: DateTime<Utc>,
    pub previous_fire_time: Option<DateTime<Utc>>,
}

/// 一轮调度的统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub fired: usize,
    pub skipped: usize,
    pub misfired: usize,
    /// 持久化失败而未处理的到期记录
    pub failed: usize,
    /// 存储不可用，本轮未做任何处理
    pub halted: bool,
}

/// 与任务注册表对账的结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub loaded: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failed: usize,
}

/// 任务存储健康状态
///
/// 连续失败达到阈值后进入停止状态，之后的调度变更在存储健康检查通过前一律拒绝。
pub struct StoreHealth {
    consecutive_failures: AtomicU32,
    threshold: u32,
}

impl StoreHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            consecutive_failures: AtomicU32::new(0),
            threshold: threshold.max(1),
        }
    }

    pub fn is_halted(&self) -> bool {
        self.consecutive_failures.load(Ordering::SeqCst) >= self.threshold
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    fn record_success(&self) {
        let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
        if previous >= self.threshold {
            info!("任务存储已恢复，重新接受调度变更");
        }
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        if failures == self.threshold {
            error!(failures, "任务存储连续写入失败，停止接受调度变更");
        }
    }
}

struct JobEntry {
    job: ScheduledJob,
    task: Task,
}

#[derive(Default)]
struct SchedulerState {
    jobs: HashMap<String, JobEntry>,
    paused: HashSet<String>,
}

pub struct TaskScheduler {
    config: SchedulerConfig,
    resolver: TriggerResolver,
    job_store: Arc<dyn JobStore>,
    registry: Arc<dyn TaskRegistry>,
    tracker: Arc<ExecutionTracker>,
    dispatch_tx: mpsc::Sender<TaskExecutionMessage>,
    state: Mutex<SchedulerState>,
    health: StoreHealth,
    wakeup: Notify,
    metrics: Arc<MetricsCollector>,
}

impl TaskScheduler {
    pub fn new(
        config: SchedulerConfig,
        job_store: Arc<dyn JobStore>,
        registry: Arc<dyn TaskRegistry>,
        tracker: Arc<ExecutionTracker>,
        dispatch_tx: mpsc::Sender<TaskExecutionMessage>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            resolver: TriggerResolver::from_config(&config),
            health: StoreHealth::new(config.persistence_failure_threshold),
            config,
            job_store,
            registry,
            tracker,
            dispatch_tx,
            state: Mutex::new(SchedulerState::default()),
            wakeup: Notify::new(),
            metrics,
        }
    }

    pub fn resolver(&self) -> &TriggerResolver {
        &self.resolver
    }

    pub fn tracker(&self) -> &Arc<ExecutionTracker> {
        &self.tracker
    }

    pub fn store_health(&self) -> &StoreHealth {
        &self.health
    }

    /// 为启用的任务创建（或替换）调度记录，返回首次触发时间
    ///
    /// 返回前调度记录已经持久化。触发器永远不会再触发时返回 `None`。
    pub async fn add(&self, task: &Task) -> SchedulerResult<Option<DateTime<Utc>>> {
        let trigger = validated_trigger(task)?;
        if !task.is_schedulable() {
            return Err(SchedulerError::InvalidTask(format!(
                "任务 {} 已禁用或已删除，不能调度",
                task.id
            )));
        }
        self.ensure_accepting().await?;

        let mut state = self.state.lock().await;
        let next = self.schedule_locked(&mut state, task, trigger).await?;
        state.paused.remove(&task.id);
        self.metrics.update_scheduled_jobs(state.jobs.len());
        drop(state);

        self.wakeup.notify_one();
        Ok(next)
    }

    /// 任务定义变更后同步调度记录
    ///
    /// 触发器未变时保留原有的下一次触发时间；任务已禁用或删除时移除记录。
    /// 启用状态的任务总会被调度，此前的暂停随之解除。
    pub async fn update(&self, task: &Task) -> SchedulerResult<Option<DateTime<Utc>>> {
        if !task.is_schedulable() {
            self.remove(&task.id).await?;
            return Ok(None);
        }
        let trigger = validated_trigger(task)?;
        self.ensure_accepting().await?;

        let mut state = self.state.lock().await;
        if state.paused.remove(&task.id) {
            info!(task_id = %task.id, "任务以启用状态更新，解除暂停");
        }

        let unchanged = state
            .jobs
            .get(&task.id)
            .is_some_and(|entry| *entry.job.trigger() == trigger);
        let next = if unchanged {
            state.jobs.get_mut(&task.id).map(|entry| {
                entry.task = task.clone();
                entry.job.next_run_time
            })
        } else {
            self.schedule_locked(&mut state, task, trigger).await?
        };
        self.metrics.update_scheduled_jobs(state.jobs.len());
        drop(state);

        self.wakeup.notify_one();
        Ok(next)
    }

    /// 删除调度记录，记录不存在时同样成功；返回记录此前是否存在
    pub async fn remove(&self, task_id: &str) -> SchedulerResult<bool> {
        self.ensure_accepting().await?;

        let mut state = self.state.lock().await;
        self.delete_job(task_id).await?;
        let existed = state.jobs.remove(task_id).is_some();
        state.paused.remove(task_id);
        self.metrics.update_scheduled_jobs(state.jobs.len());

        if existed {
            info!(task_id, "调度记录已移除");
        }
        Ok(existed)
    }

    /// 暂停：删除调度记录，并在恢复前忽略对账
    pub async fn pause(&self, task_id: &str) -> SchedulerResult<()> {
        self.ensure_accepting().await?;

        let mut state = self.state.lock().await;
        self.delete_job(task_id).await?;
        state.jobs.remove(task_id);
        state.paused.insert(task_id.to_string());
        self.metrics.update_scheduled_jobs(state.jobs.len());

        info!(task_id, "任务已暂停");
        Ok(())
    }

    /// 恢复：从任务注册表读取最新定义并重新调度
    pub async fn resume(&self, task_id: &str) -> SchedulerResult<Option<DateTime<Utc>>> {
        let task = self
            .registry
            .get(task_id)
            .await?
            .ok_or_else(|| SchedulerError::TaskNotFound {
                id: task_id.to_string(),
            })?;

        let next = self.add(&task).await?;
        info!(task_id, next_run_time = ?next, "任务已恢复");
        Ok(next)
    }

    /// 立即执行一次，不影响调度记录
    ///
    /// 任务已有运行中的执行时返回 `None`。
    pub async fn run_now(&self, task_id: &str) -> SchedulerResult<Option<String>> {
        let cached = {
            let state = self.state.lock().await;
            state.jobs.get(task_id).map(|entry| entry.task.clone())
        };
        let task = match cached {
            Some(task) => task,
            None => self
                .registry
                .get(task_id)
                .await?
                .ok_or_else(|| SchedulerError::TaskNotFound {
                    id: task_id.to_string(),
                })?,
        };

        if task.deleted {
            return Err(SchedulerError::InvalidTask(format!(
                "任务 {task_id} 已删除"
            )));
        }

        let execution_id = self.fire(&task, Utc::now()).await?;
        if execution_id.is_none() {
            StructuredLogger::log_job_skipped(task_id, "上一次执行仍在运行");
            self.metrics.record_job_skipped("still_running");
        }
        Ok(execution_id)
    }

    /// 取消运行中的执行
    pub fn cancel(&self, execution_id: &str) -> bool {
        self.tracker.cancel(execution_id)
    }

    pub async fn next_run_time(&self, task_id: &str) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.jobs.get(task_id).map(|entry| entry.job.next_run_time)
    }

    pub async fn list_jobs(&self) -> Vec<JobInfo> {
        let state = self.state.lock().await;
        let mut jobs: Vec<JobInfo> = state
            .jobs
            .values()
            .map(|entry| JobInfo {
                task_id: entry.job.id.clone(),
                task_name: entry.task.name.clone(),
                trigger: entry.job.trigger().clone(),
                next_run_time: entry.job.next_run_time,
                previous_fire_time: entry.job.state.previous_fire_time,
            })
            .collect();
        jobs.sort_by(|a, b| a.next_run_time.cmp(&b.next_run_time));
        jobs
    }

    pub fn running_executions(&self) -> Vec<RunningExecution> {
        self.tracker.running()
    }

    /// 启动恢复：载入持久化的调度记录，再与任务注册表对账
    pub async fn restore(&self) -> SchedulerResult<ReconcileReport> {
        let persisted = self.job_store.load_all().await?;
        let loaded = persisted.len();
        info!("从任务存储载入 {} 条调度记录", loaded);

        let mut state = self.state.lock().await;
        let known = persisted
            .into_iter()
            .map(|job| (job.id.clone(), job))
            .collect();
        let mut report = self.reconcile_locked(&mut state, known).await?;
        report.loaded = loaded;
        drop(state);

        self.wakeup.notify_one();
        Ok(report)
    }

    /// 与任务注册表对账，拾取其他进程对任务定义的修改
    pub async fn reconcile(&self) -> SchedulerResult<ReconcileReport> {
        let mut state = self.state.lock().await;
        let known = state
            .jobs
            .iter()
            .map(|(id, entry)| (id.clone(), entry.job.clone()))
            .collect();
        let report = self.reconcile_locked(&mut state, known).await?;
        drop(state);

        if report.added + report.updated > 0 {
            self.wakeup.notify_one();
        }
        Ok(report)
    }

    async fn reconcile_locked(
        &self,
        state: &mut SchedulerState,
        known: HashMap<String, ScheduledJob>,
    ) -> SchedulerResult<ReconcileReport> {
        let tasks: HashMap<String, Task> = self
            .registry
            .list(&TaskFilter::all())
            .await?
            .into_iter()
            .map(|task| (task.id.clone(), task))
            .collect();
        let mut report = ReconcileReport::default();
        let now = Utc::now();

        // 已在注册表中禁用或删除的任务由注册表状态代表暂停，
        // 之后无论由哪个进程重新启用，都按正常任务调度
        state
            .paused
            .retain(|task_id| tasks.get(task_id).is_some_and(Task::is_schedulable));

        for (task_id, job) in &known {
            let wanted = tasks
                .get(task_id)
                .filter(|task| task.is_schedulable() && !state.paused.contains(task_id));

            let Some(task) = wanted else {
                match self.delete_job(task_id).await {
                    Ok(()) => {
                        state.jobs.remove(task_id);
                        report.removed += 1;
                        info!(task_id = %task_id, "任务已删除或禁用，移除调度记录");
                    }
                    Err(_) => report.failed += 1,
                }
                continue;
            };

            match validated_trigger(task) {
                Ok(trigger) if trigger == *job.trigger() => {
                    state.jobs.insert(
                        task_id.clone(),
                        JobEntry {
                            job: job.clone(),
                            task: task.clone(),
                        },
                    );
                    report.unchanged += 1;
                }
                Ok(trigger) => match self.schedule_locked(state, task, trigger).await {
                    Ok(_) => report.updated += 1,
                    Err(_) => report.failed += 1,
                },
                Err(e) => {
                    warn!(task_id = %task_id, "任务触发器无效，移除调度记录: {}", e);
                    match self.delete_job(task_id).await {
                        Ok(()) => {
                            state.jobs.remove(task_id);
                            report.removed += 1;
                        }
                        Err(_) => report.failed += 1,
                    }
                }
            }
        }

        for task in tasks.values() {
            if known.contains_key(&task.id)
                || !task.is_schedulable()
                || state.paused.contains(&task.id)
            {
                continue;
            }

            let trigger = match validated_trigger(task) {
                Ok(trigger) => trigger,
                Err(e) => {
                    warn!(task_id = %task.id, "任务触发器无效，跳过调度: {}", e);
                    continue;
                }
            };

            // 已经触发过（或已记为错过）的一次性任务不再调度
            if let Trigger::Date { run_at } = &trigger {
                if *run_at <= now && self.tracker.has_run_since(&task.id, *run_at).await? {
                    continue;
                }
            }

            match self.schedule_locked(state, task, trigger).await {
                Ok(_) => report.added += 1,
                Err(_) => report.failed += 1,
            }
        }

        self.metrics.update_scheduled_jobs(state.jobs.len());
        info!(
            added = report.added,
            updated = report.updated,
            removed = report.removed,
            unchanged = report.unchanged,
            failed = report.failed,
            "调度记录与任务注册表对账完成"
        );
        Ok(report)
    }

    /// 处理所有 `next_run_time <= now` 的调度记录
    pub async fn dispatch_due(&self, now: DateTime<Utc>) -> DispatchSummary {
        let started = Instant::now();
        let mut summary = DispatchSummary::default();

        if let Err(e) = self.ensure_accepting().await {
            warn!("{}", e);
            self.metrics.record_job_skipped("halted");
            summary.halted = true;
            return summary;
        }

        let mut state = self.state.lock().await;
        let mut due: Vec<(String, DateTime<Utc>)> = state
            .jobs
            .values()
            .filter(|entry| entry.job.next_run_time <= now)
            .map(|entry| (entry.job.id.clone(), entry.job.next_run_time))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1));

        for (task_id, _) in due {
            let Some(entry) = state.jobs.get(&task_id) else {
                continue;
            };
            let job = entry.job.clone();
            let task = entry.task.clone();

            let decision = match self.resolver.classify(&job, now) {
                Ok(decision) => decision,
                Err(e) => {
                    error!(task_id = %task_id, "计算下一次触发时间失败: {}", e);
                    summary.failed += 1;
                    continue;
                }
            };

            match decision {
                FireDecision::NotDue => {}
                FireDecision::Misfire {
                    scheduled_time,
                    next_run_time,
                    late_seconds,
                } => {
                    if self
                        .store_next_locked(&mut state, job.clone(), next_run_time)
                        .await
                        .is_err()
                    {
                        summary.failed += 1;
                        continue;
                    }
                    StructuredLogger::log_job_misfired(&task_id, scheduled_time, late_seconds);
                    self.metrics.record_job_misfired();
                    summary.misfired += 1;

                    if matches!(job.trigger(), Trigger::Date { .. }) {
                        if let Err(e) = self.tracker.record_missed(&task, scheduled_time, now).await
                        {
                            error!(task_id = %task_id, "记录错过的执行失败: {}", e);
                        }
                    }
                }
                FireDecision::Fire {
                    scheduled_time,
                    next_run_time,
                } => {
                    if self.tracker.is_running(&task_id) {
                        // 合并本次触发：不排队，只推进到下一次
                        if self
                            .store_next_locked(&mut state, job, next_run_time)
                            .await
                            .is_err()
                        {
                            summary.failed += 1;
                            continue;
                        }
                        StructuredLogger::log_job_skipped(&task_id, "上一次执行仍在运行");
                        self.metrics.record_job_skipped("still_running");
                        summary.skipped += 1;
                        continue;
                    }

                    let mut fired_job = job;
                    match next_run_time {
                        Some(next) => fired_job.advance(scheduled_time, next),
                        None => fired_job.state.previous_fire_time = Some(scheduled_time),
                    }
                    if self
                        .store_next_locked(&mut state, fired_job, next_run_time)
                        .await
                        .is_err()
                    {
                        summary.failed += 1;
                        continue;
                    }

                    match self.fire(&task, scheduled_time).await {
                        Ok(Some(_)) => summary.fired += 1,
                        Ok(None) => {
                            StructuredLogger::log_job_skipped(&task_id, "上一次执行仍在运行");
                            self.metrics.record_job_skipped("still_running");
                            summary.skipped += 1;
                        }
                        Err(e) => {
                            error!(task_id = %task_id, "分发执行失败: {}", e);
                            summary.failed += 1;
                        }
                    }
                }
            }
        }

        self.metrics.update_scheduled_jobs(state.jobs.len());
        self.metrics
            .record_dispatch_loop_duration(started.elapsed().as_secs_f64());
        summary
    }

    /// 调度循环
    ///
    /// 睡眠到最早的触发时间（不超过 `max_idle_seconds`），或被 add / update / resume 提前唤醒。
    pub async fn run(&self, shutdown: CancellationToken) {
        let max_idle = Duration::from_secs(self.config.max_idle_seconds.max(1));
        let reconcile_every = (self.config.reconcile_interval_seconds > 0)
            .then(|| Duration::from_secs(self.config.reconcile_interval_seconds));
        let mut last_reconcile = Instant::now();

        info!("调度循环启动");
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if self.tracker.pending_finish_count() > 0 {
                let settled = self.tracker.retry_pending_finishes().await;
                if settled > 0 {
                    info!(settled, "重试写入执行结果成功");
                }
            }

            if let Some(every) = reconcile_every {
                if last_reconcile.elapsed() >= every {
                    if let Err(e) = self.reconcile().await {
                        warn!("周期性对账失败: {}", e);
                    }
                    last_reconcile = Instant::now();
                }
            }

            let summary = self.dispatch_due(Utc::now()).await;
            if summary.fired + summary.skipped + summary.misfired > 0 {
                debug!(?summary, "本轮调度完成");
            }

            let mut sleep_for = match self.next_wakeup().await {
                Some(next) => (next - Utc::now()).to_std().unwrap_or(Duration::ZERO),
                None => max_idle,
            }
            .min(max_idle);
            if let Some(every) = reconcile_every {
                sleep_for = sleep_for.min(every.saturating_sub(last_reconcile.elapsed()));
            }
            if self.tracker.pending_finish_count() > 0 {
                sleep_for = sleep_for.min(PENDING_FINISH_RETRY_INTERVAL);
            }
            if summary.failed > 0 || summary.halted {
                sleep_for = sleep_for.max(Duration::from_secs(1));
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = self.wakeup.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
        info!("调度循环已停止");
    }

    async fn next_wakeup(&self) -> Option<DateTime<Utc>> {
        let state = self.state.lock().await;
        state.jobs.values().map(|entry| entry.job.next_run_time).min()
    }

    async fn fire(&self, task: &Task, scheduled_time: DateTime<Utc>) -> SchedulerResult<Option<String>> {
        let Some(started) = self.tracker.on_start(task, Utc::now()).await? else {
            return Ok(None);
        };
        let execution_id = started.execution.id.clone();

        StructuredLogger::log_job_fired(&task.id, &execution_id, scheduled_time);
        self.metrics.record_job_fired();

        let message = TaskExecutionMessage {
            execution_id: execution_id.clone(),
            task: task.clone(),
            scheduled_time,
            cancel_token: started.cancel_token,
        };
        if self.dispatch_tx.send(message).await.is_err() {
            self.tracker
                .abort(&execution_id, &task.id, "工作池已关闭，执行未能分发")
                .await?;
            return Err(SchedulerError::Internal("工作池已关闭".to_string()));
        }
        Ok(Some(execution_id))
    }

    /// 计算首次触发时间并持久化，成功后才写入内存
    async fn schedule_locked(
        &self,
        state: &mut SchedulerState,
        task: &Task,
        trigger: Trigger,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        let Some(next) = self.resolver.first_run_time(&trigger, Utc::now())? else {
            warn!(task_id = %task.id, trigger = %trigger, "触发器不会再触发，不创建调度记录");
            self.delete_job(&task.id).await?;
            state.jobs.remove(&task.id);
            return Ok(None);
        };

        let job = ScheduledJob::new(task.id.clone(), trigger, next);
        self.save_job(&job).await?;
        StructuredLogger::log_job_scheduled(&task.id, &job.trigger().to_string(), next);
        state.jobs.insert(
            task.id.clone(),
            JobEntry {
                job,
                task: task.clone(),
            },
        );
        Ok(Some(next))
    }

    /// 推进（或在触发器耗尽时删除）调度记录，持久化成功后才修改内存
    async fn store_next_locked(
        &self,
        state: &mut SchedulerState,
        mut job: ScheduledJob,
        next_run_time: Option<DateTime<Utc>>,
    ) -> SchedulerResult<()> {
        match next_run_time {
            Some(next) => {
                job.next_run_time = next;
                self.save_job(&job).await?;
                if let Some(entry) = state.jobs.get_mut(&job.id) {
                    entry.job = job;
                }
            }
            None => {
                self.delete_job(&job.id).await?;
                state.jobs.remove(&job.id);
                debug!(task_id = %job.id, "触发器已耗尽，调度记录已删除");
            }
        }
        Ok(())
    }

    async fn save_job(&self, job: &ScheduledJob) -> SchedulerResult<()> {
        self.with_persistence_retry("save", &job.id, || self.job_store.save(job))
            .await
    }

    async fn delete_job(&self, task_id: &str) -> SchedulerResult<()> {
        self.with_persistence_retry("delete", task_id, || self.job_store.delete(task_id))
            .await
    }

    async fn with_persistence_retry<F, Fut>(
        &self,
        operation: &str,
        task_id: &str,
        mut op: F,
    ) -> SchedulerResult<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<()>>,
    {
        let attempts = self.config.persistence_retry_attempts.max(1);
        let backoff = Duration::from_millis(self.config.persistence_retry_backoff_ms);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match op().await {
                Ok(()) => {
                    self.health.record_success();
                    return Ok(());
                }
                Err(e) => {
                    warn!(task_id, operation, attempt, "任务存储写入失败: {}", e);
                    last_error = e.to_string();
                    if attempt < attempts {
                        tokio::time::sleep(backoff * attempt).await;
                    }
                }
            }
        }

        self.health.record_failure();
        self.metrics.record_job_store_failure();
        StructuredLogger::log_persistence_failure(operation, task_id, &last_error);
        Err(SchedulerError::SchedulePersistence(format!(
            "{operation} {task_id}: {last_error}"
        )))
    }

    async fn ensure_accepting(&self) -> SchedulerResult<()> {
        if !self.health.is_halted() {
            return Ok(());
        }
        match self.job_store.health_check().await {
            Ok(()) => {
                self.health.record_success();
                Ok(())
            }
            Err(e) => Err(SchedulerError::SchedulePersistence(format!(
                "任务存储不可用，暂停接受调度变更: {e}"
            ))),
        }
    }
}

fn validated_trigger(task: &Task) -> SchedulerResult<Trigger> {
    let trigger = task.trigger()?;
    TriggerResolver::validate(&trigger)?;
    Ok(trigger)
}
