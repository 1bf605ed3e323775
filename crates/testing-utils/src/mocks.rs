//! Mock implementations for the persistence and execution collaborators
//!
//! In-memory stand-ins that behave like the SQLite implementations closely
//! enough for scheduler and worker unit tests: upserts, idempotent deletes,
//! guarded execution finishes and counter bookkeeping.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{
    ExecutionRepository, ExecutionRequest, ExecutionResult, ExecutionStatus, JobStore,
    ScheduledJob, SchedulerError, SchedulerResult, Task, TaskExecution, TaskExecutor,
    TaskFilter, TaskRegistry,
};
use tokio_util::sync::CancellationToken;

/// Mock implementation of TaskRegistry for testing
#[derive(Debug, Clone, Default)]
pub struct MockTaskRegistry {
    tasks: Arc<Mutex<HashMap<String, Task>>>,
}

impl MockTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tasks(tasks: Vec<Task>) -> Self {
        let registry = Self::new();
        {
            let mut map = registry.tasks.lock().unwrap();
            for task in tasks {
                map.insert(task.id.clone(), task);
            }
        }
        registry
    }

    pub fn count(&self) -> usize {
        self.tasks.lock().unwrap().len()
    }

    /// Snapshot of a task, bypassing the async trait
    pub fn task(&self, id: &str) -> Option<Task> {
        self.tasks.lock().unwrap().get(id).cloned()
    }

    /// Counter bookkeeping used by [`MockExecutionRepository::finish`]
    pub fn bump_counters(&self, id: &str, succeeded: bool) {
        if let Some(task) = self.tasks.lock().unwrap().get_mut(id) {
            task.run_count += 1;
            if succeeded {
                task.success_count += 1;
            } else {
                task.failed_count += 1;
            }
        }
    }

    fn modify<F>(&self, id: &str, f: F) -> SchedulerResult<()>
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.lock().unwrap();
        let task = tasks
            .get_mut(id)
            .ok_or_else(|| SchedulerError::TaskNotFound { id: id.to_string() })?;
        f(task);
        task.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl TaskRegistry for MockTaskRegistry {
    async fn get(&self, id: &str) -> SchedulerResult<Option<Task>> {
        Ok(self.task(id))
    }

    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let mut tasks: Vec<Task> = self
            .tasks
            .lock()
            .unwrap()
            .values()
            .filter(|task| filter.matches(task))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(tasks)
    }

    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        if tasks.contains_key(&task.id) {
            return Err(SchedulerError::InvalidTask(format!(
                "task {} already exists",
                task.id
            )));
        }
        tasks.insert(task.id.clone(), task.clone());
        Ok(task.clone())
    }

    async fn update(&self, task: &Task) -> SchedulerResult<Task> {
        let mut tasks = self.tasks.lock().unwrap();
        let existing = tasks.get(&task.id).ok_or_else(|| SchedulerError::TaskNotFound {
            id: task.id.clone(),
        })?;

        let mut updated = task.clone();
        updated.run_count = existing.run_count;
        updated.success_count = existing.success_count;
        updated.failed_count = existing.failed_count;
        updated.created_at = existing.created_at;
        updated.updated_at = Utc::now();
        tasks.insert(updated.id.clone(), updated.clone());
        Ok(updated)
    }

    async fn soft_delete(&self, id: &str) -> SchedulerResult<()> {
        self.modify(id, |task| task.deleted = true)
    }

    async fn restore(&self, id: &str) -> SchedulerResult<()> {
        self.modify(id, |task| task.deleted = false)
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> SchedulerResult<()> {
        self.modify(id, |task| task.enabled = enabled)
    }
}

/// Mock implementation of JobStore with write-failure injection
#[derive(Debug, Clone, Default)]
pub struct MockJobStore {
    jobs: Arc<Mutex<HashMap<String, ScheduledJob>>>,
    fail_writes: Arc<AtomicBool>,
    fail_health_check: Arc<AtomicBool>,
    write_calls: Arc<AtomicUsize>,
}

impl MockJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent save/delete fail with `SchedulePersistence`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_health_check(&self, fail: bool) {
        self.fail_health_check.store(fail, Ordering::SeqCst);
    }

    /// Number of attempted writes, failed ones included
    pub fn write_calls(&self) -> usize {
        self.write_calls.load(Ordering::SeqCst)
    }

    pub fn job(&self, id: &str) -> Option<ScheduledJob> {
        self.jobs.lock().unwrap().get(id).cloned()
    }

    pub fn count(&self) -> usize {
        self.jobs.lock().unwrap().len()
    }

    fn check_write(&self) -> SchedulerResult<()> {
        self.write_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SchedulerError::SchedulePersistence(
                "injected write failure".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for MockJobStore {
    async fn load_all(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        let mut jobs: Vec<ScheduledJob> = self.jobs.lock().unwrap().values().cloned().collect();
        jobs.sort_by(|a, b| a.next_run_time.cmp(&b.next_run_time).then(a.id.cmp(&b.id)));
        Ok(jobs)
    }

    async fn save(&self, job: &ScheduledJob) -> SchedulerResult<()> {
        self.check_write()?;
        self.jobs.lock().unwrap().insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn delete(&self, id: &str) -> SchedulerResult<()> {
        self.check_write()?;
        self.jobs.lock().unwrap().remove(id);
        Ok(())
    }

    async fn health_check(&self) -> SchedulerResult<()> {
        if self.fail_health_check.load(Ordering::SeqCst) {
            return Err(SchedulerError::SchedulePersistence(
                "injected health check failure".to_string(),
            ));
        }
        Ok(())
    }
}

/// Mock implementation of ExecutionRepository
///
/// When built with [`MockExecutionRepository::with_registry`], a successful
/// `finish` bumps the owning task's counters the way the SQLite repository does.
/// `start` applies the same one-open-execution-per-task guard as the SQLite insert.
#[derive(Debug, Clone, Default)]
pub struct MockExecutionRepository {
    executions: Arc<Mutex<HashMap<String, TaskExecution>>>,
    registry: Option<MockTaskRegistry>,
    fail_finish: Arc<AtomicBool>,
    finish_calls: Arc<AtomicUsize>,
}

impl MockExecutionRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_registry(registry: MockTaskRegistry) -> Self {
        Self {
            registry: Some(registry),
            ..Self::default()
        }
    }

    /// Make every subsequent `finish` fail with a database error
    pub fn set_fail_finish(&self, fail: bool) {
        self.fail_finish.store(fail, Ordering::SeqCst);
    }

    /// Number of attempted finishes, failed ones included
    pub fn finish_calls(&self) -> usize {
        self.finish_calls.load(Ordering::SeqCst)
    }

    /// Insert a record directly, bypassing the open-execution guard
    pub fn insert(&self, execution: TaskExecution) {
        self.executions
            .lock()
            .unwrap()
            .insert(execution.id.clone(), execution);
    }

    pub fn running_for(&self, task_id: &str) -> usize {
        self.executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.task_id == task_id && e.is_running())
            .count()
    }

    pub fn all(&self) -> Vec<TaskExecution> {
        let mut all: Vec<TaskExecution> =
            self.executions.lock().unwrap().values().cloned().collect();
        all.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        all
    }

    pub fn count_with_status(&self, status: ExecutionStatus) -> usize {
        self.executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.status == status)
            .count()
    }
}

#[async_trait]
impl ExecutionRepository for MockExecutionRepository {
    async fn create(&self, execution: &TaskExecution) -> SchedulerResult<()> {
        self.executions
            .lock()
            .unwrap()
            .insert(execution.id.clone(), execution.clone());
        Ok(())
    }

    async fn start(&self, execution: &TaskExecution) -> SchedulerResult<bool> {
        let mut executions = self.executions.lock().unwrap();
        if executions
            .values()
            .any(|e| e.task_id == execution.task_id && e.is_running())
        {
            return Ok(false);
        }
        executions.insert(execution.id.clone(), execution.clone());
        Ok(true)
    }

    async fn get(&self, id: &str) -> SchedulerResult<Option<TaskExecution>> {
        Ok(self.executions.lock().unwrap().get(id).cloned())
    }

    async fn finish(&self, execution: &TaskExecution) -> SchedulerResult<bool> {
        self.finish_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_finish.load(Ordering::SeqCst) {
            return Err(SchedulerError::Database(sqlx::Error::PoolTimedOut));
        }
        {
            let mut executions = self.executions.lock().unwrap();
            let stored = executions
                .get_mut(&execution.id)
                .ok_or_else(|| SchedulerError::ExecutionNotFound {
                    id: execution.id.clone(),
                })?;
            if !stored.is_running() {
                return Ok(false);
            }
            *stored = execution.clone();
        }

        if let Some(registry) = &self.registry {
            registry.bump_counters(&execution.task_id, execution.status.counts_as_success());
        }
        Ok(true)
    }

    async fn list_by_task(
        &self,
        task_id: &str,
        limit: i64,
        status: Option<ExecutionStatus>,
    ) -> SchedulerResult<Vec<TaskExecution>> {
        let mut matching: Vec<TaskExecution> = self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.task_id == task_id)
            .filter(|e| status.map_or(true, |s| e.status == s))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        matching.truncate(limit.max(0) as usize);
        Ok(matching)
    }

    async fn list_running(&self) -> SchedulerResult<Vec<TaskExecution>> {
        Ok(self
            .executions
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.is_running())
            .cloned()
            .collect())
    }
}

/// Scripted TaskExecutor: sleeps for `delay`, then returns `result`
///
/// Cancellation during the delay yields a `cancelled` result, mirroring the
/// real script executor.
#[derive(Debug, Clone)]
pub struct MockTaskExecutor {
    result: Arc<Mutex<ExecutionResult>>,
    delay: Duration,
    calls: Arc<Mutex<Vec<ExecutionRequest>>>,
}

impl MockTaskExecutor {
    pub fn new(result: ExecutionResult) -> Self {
        Self {
            result: Arc::new(Mutex::new(result)),
            delay: Duration::ZERO,
            calls: Arc::default(),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(ExecutionResult::from_exit(Some(0), "ok".to_string(), None, 0.0))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_result(&self, result: ExecutionResult) {
        *self.result.lock().unwrap() = result;
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls(&self) -> Vec<ExecutionRequest> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TaskExecutor for MockTaskExecutor {
    async fn execute(&self, request: &ExecutionRequest, cancel: CancellationToken) -> ExecutionResult {
        self.calls.lock().unwrap().push(request.clone());

        if !self.delay.is_zero() {
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                _ = cancel.cancelled() => {
                    return ExecutionResult::cancelled("cancelled by request");
                }
            }
        }

        self.result.lock().unwrap().clone()
    }

    fn name(&self) -> &str {
        "mock"
    }
}
