#[cfg(test)]
mod scheduler_tests {
    use std::sync::Arc;

    use chrono::{Duration, Utc};
    use tokio::sync::mpsc;

    use scheduler_core::{
        ExecutionCompletedMessage, ExecutionResult, ExecutionStatus, SchedulerConfig,
        SchedulerError, Task, TaskExecution, TaskExecutionMessage, TaskRegistry, Trigger,
    };
    use scheduler_dispatcher::{ExecutionTracker, TaskScheduler};
    use scheduler_infrastructure::MetricsCollector;
    use scheduler_testing_utils::{
        MockExecutionRepository, MockJobStore, MockTaskRegistry, TaskBuilder, TestEnv,
    };
    use tokio_util::sync::CancellationToken;

    struct Harness {
        registry: MockTaskRegistry,
        store: MockJobStore,
        executions: MockExecutionRepository,
        tracker: Arc<ExecutionTracker>,
        scheduler: TaskScheduler,
        dispatch_rx: mpsc::Receiver<TaskExecutionMessage>,
    }

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            persistence_retry_attempts: 2,
            persistence_retry_backoff_ms: 1,
            persistence_failure_threshold: 2,
            ..Default::default()
        }
    }

    fn harness_with(tasks: Vec<Task>, store: MockJobStore) -> Harness {
        let registry = MockTaskRegistry::with_tasks(tasks);
        let executions = MockExecutionRepository::with_registry(registry.clone());
        let metrics = Arc::new(MetricsCollector::new());
        let tracker = Arc::new(ExecutionTracker::new(
            Arc::new(executions.clone()),
            metrics.clone(),
        ));
        let (dispatch_tx, dispatch_rx) = mpsc::channel(16);
        let scheduler = TaskScheduler::new(
            test_config(),
            Arc::new(store.clone()),
            Arc::new(registry.clone()),
            tracker.clone(),
            dispatch_tx,
            metrics,
        );
        Harness {
            registry,
            store,
            executions,
            tracker,
            scheduler,
            dispatch_rx,
        }
    }

    fn harness(tasks: Vec<Task>) -> Harness {
        harness_with(tasks, MockJobStore::new())
    }

    fn completed(message: &TaskExecutionMessage, exit_code: i32) -> ExecutionCompletedMessage {
        ExecutionCompletedMessage {
            execution_id: message.execution_id.clone(),
            task_id: message.task.id.clone(),
            result: ExecutionResult::from_exit(Some(exit_code), String::new(), None, 0.1),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_add_persists_before_returning() {
        let task = TaskBuilder::new().with_interval(60).build();
        let h = harness(vec![task.clone()]);

        let before = Utc::now();
        let next = h.scheduler.add(&task).await.unwrap().unwrap();

        let persisted = h.store.job(&task.id).expect("job persisted");
        assert_eq!(persisted.next_run_time, next);
        assert!(next >= before + Duration::seconds(60));
        assert_eq!(h.scheduler.next_run_time(&task.id).await, Some(next));
    }

    #[tokio::test]
    async fn test_invalid_trigger_rejected_without_mutation() {
        let task = TaskBuilder::new().with_cron("not a cron").build();
        let h = harness(vec![task.clone()]);

        let result = h.scheduler.add(&task).await;
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidCronExpression { .. })
        ));
        assert_eq!(h.store.write_calls(), 0);
        assert!(h.scheduler.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_disabled_task_is_not_schedulable() {
        let task = TaskBuilder::new().disabled().build();
        let h = harness(vec![task.clone()]);

        assert!(matches!(
            h.scheduler.add(&task).await,
            Err(SchedulerError::InvalidTask(_))
        ));
        assert_eq!(h.store.count(), 0);
    }

    #[tokio::test]
    async fn test_dispatch_fires_and_advances() {
        let task = TaskBuilder::new().with_interval(10).build();
        let mut h = harness(vec![task.clone()]);
        let first = h.scheduler.add(&task).await.unwrap().unwrap();

        let summary = h.scheduler.dispatch_due(first).await;
        assert_eq!(summary.fired, 1);

        let message = h.dispatch_rx.try_recv().expect("execution dispatched");
        assert_eq!(message.task.id, task.id);
        assert_eq!(message.scheduled_time, first);

        let job = h.store.job(&task.id).unwrap();
        assert_eq!(job.next_run_time, first + Duration::seconds(10));
        assert_eq!(job.state.previous_fire_time, Some(first));

        let running = h.executions.all();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].status, ExecutionStatus::Running);
    }

    #[tokio::test]
    async fn test_single_instance_coalesces_firing() {
        let task = TaskBuilder::new().with_interval(5).build();
        let mut h = harness(vec![task.clone()]);
        let first = h.scheduler.add(&task).await.unwrap().unwrap();

        assert_eq!(h.scheduler.dispatch_due(first).await.fired, 1);
        let message = h.dispatch_rx.try_recv().unwrap();

        // 上一次执行仍在运行：跳过，但推进下一次触发时间
        let second = first + Duration::seconds(5);
        let summary = h.scheduler.dispatch_due(second).await;
        assert_eq!(summary.fired, 0);
        assert_eq!(summary.skipped, 1);
        assert!(h.dispatch_rx.try_recv().is_err());
        assert_eq!(h.executions.all().len(), 1);
        assert_eq!(h.executions.count_with_status(ExecutionStatus::Running), 1);
        assert_eq!(
            h.store.job(&task.id).unwrap().next_run_time,
            first + Duration::seconds(10)
        );

        h.tracker.on_finish(&completed(&message, 0)).await.unwrap();
        let summary = h.scheduler.dispatch_due(first + Duration::seconds(10)).await;
        assert_eq!(summary.fired, 1);
    }

    #[tokio::test]
    async fn test_persistence_failure_neither_fires_nor_advances() {
        let task = TaskBuilder::new().with_interval(30).build();
        let mut h = harness(vec![task.clone()]);
        let first = h.scheduler.add(&task).await.unwrap().unwrap();

        h.store.set_fail_writes(true);
        let summary = h.scheduler.dispatch_due(first).await;
        assert_eq!(summary.fired, 0);
        assert_eq!(summary.failed, 1);
        assert!(h.dispatch_rx.try_recv().is_err());
        assert!(h.executions.all().is_empty());
        assert_eq!(h.scheduler.next_run_time(&task.id).await, Some(first));
        assert_eq!(h.store.job(&task.id).unwrap().next_run_time, first);
    }

    #[tokio::test]
    async fn test_repeated_persistence_failure_halts_mutations() {
        let task = TaskBuilder::new().build();
        let other = TaskBuilder::new().with_name("other").build();
        let h = harness(vec![task.clone(), other.clone()]);

        h.store.set_fail_writes(true);
        h.store.set_fail_health_check(true);
        for _ in 0..2 {
            assert!(matches!(
                h.scheduler.add(&task).await,
                Err(SchedulerError::SchedulePersistence(_))
            ));
        }
        assert!(h.scheduler.store_health().is_halted());

        // 停止状态下直接拒绝，不再尝试写入
        let writes = h.store.write_calls();
        assert!(matches!(
            h.scheduler.add(&other).await,
            Err(SchedulerError::SchedulePersistence(_))
        ));
        assert_eq!(h.store.write_calls(), writes);
        assert!(h.scheduler.dispatch_due(Utc::now()).await.halted);

        // 存储恢复后重新接受变更
        h.store.set_fail_writes(false);
        h.store.set_fail_health_check(false);
        assert!(h.scheduler.add(&other).await.unwrap().is_some());
        assert!(!h.scheduler.store_health().is_halted());
    }

    #[tokio::test]
    async fn test_misfired_interval_skips_without_executing() {
        let task = TaskBuilder::new().with_interval(60).build();
        let mut h = harness(vec![task.clone()]);
        let first = h.scheduler.add(&task).await.unwrap().unwrap();

        let now = first + Duration::seconds(301);
        let summary = h.scheduler.dispatch_due(now).await;
        assert_eq!(summary.misfired, 1);
        assert_eq!(summary.fired, 0);
        assert!(h.dispatch_rx.try_recv().is_err());
        assert!(h.executions.all().is_empty());

        let next = h.scheduler.next_run_time(&task.id).await.unwrap();
        assert!(next > now);
        assert_eq!(next, first + Duration::seconds(360));
    }

    #[tokio::test]
    async fn test_misfired_date_is_recorded_missed_and_removed() {
        let run_at = Utc::now() - Duration::hours(2);
        let task = TaskBuilder::new().with_date(run_at).build();
        let mut h = harness(vec![task.clone()]);

        assert_eq!(h.scheduler.add(&task).await.unwrap(), Some(run_at));
        let summary = h.scheduler.dispatch_due(Utc::now()).await;
        assert_eq!(summary.misfired, 1);
        assert!(h.dispatch_rx.try_recv().is_err());
        assert!(h.store.job(&task.id).is_none());

        let history = h.executions.all();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].status, ExecutionStatus::Missed);
        assert_eq!(history[0].start_time, run_at);

        let stored = h.registry.task(&task.id).unwrap();
        assert_eq!(stored.run_count, 0);

        // 对账不会重新调度已错过的一次性任务
        let report = h.scheduler.reconcile().await.unwrap();
        assert_eq!(report.added, 0);
    }

    #[tokio::test]
    async fn test_date_trigger_fires_once_then_retires() {
        let run_at = Utc::now() + Duration::seconds(1);
        let task = TaskBuilder::new().with_date(run_at).build();
        let mut h = harness(vec![task.clone()]);
        h.scheduler.add(&task).await.unwrap();

        assert_eq!(h.scheduler.dispatch_due(run_at).await.fired, 1);
        assert!(h.dispatch_rx.try_recv().is_ok());
        assert!(h.store.job(&task.id).is_none());
        assert!(h.scheduler.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let task = TaskBuilder::new().with_interval(60).build();
        let h = harness(vec![task.clone()]);
        h.scheduler.add(&task).await.unwrap();

        h.scheduler.pause(&task.id).await.unwrap();
        assert!(h.store.job(&task.id).is_none());
        assert_eq!(h.scheduler.next_run_time(&task.id).await, None);

        // 暂停期间对账不会重新添加
        assert_eq!(h.scheduler.reconcile().await.unwrap().added, 0);

        let next = h.scheduler.resume(&task.id).await.unwrap();
        assert!(next.is_some());
        assert!(h.store.job(&task.id).is_some());
    }

    #[tokio::test]
    async fn test_update_keeps_next_run_when_trigger_unchanged() {
        let task = TaskBuilder::new().with_interval(60).build();
        let h = harness(vec![task.clone()]);
        let first = h.scheduler.add(&task).await.unwrap();

        let mut renamed = task.clone();
        renamed.name = "renamed".to_string();
        assert_eq!(h.scheduler.update(&renamed).await.unwrap(), first);
        assert_eq!(h.scheduler.list_jobs().await[0].task_name, "renamed");

        let mut retimed = renamed.clone();
        retimed.set_trigger(Trigger::Cron {
            expression: "0 3 * * *".to_string(),
        });
        let next = h.scheduler.update(&retimed).await.unwrap().unwrap();
        assert_ne!(Some(next), first);
        assert_eq!(
            h.store.job(&task.id).unwrap().state.trigger,
            retimed.trigger().unwrap()
        );

        let mut disabled = retimed.clone();
        disabled.enabled = false;
        assert_eq!(h.scheduler.update(&disabled).await.unwrap(), None);
        assert!(h.store.job(&task.id).is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let task = TaskBuilder::new().build();
        let h = harness(vec![task.clone()]);
        h.scheduler.add(&task).await.unwrap();

        assert!(h.scheduler.remove(&task.id).await.unwrap());
        assert!(!h.scheduler.remove(&task.id).await.unwrap());
        assert_eq!(h.store.count(), 0);
    }

    #[tokio::test]
    async fn test_restore_round_trip_and_reconcile() {
        let kept = TaskBuilder::new().with_name("kept").with_interval(30).build();
        let deleted = TaskBuilder::new().with_name("deleted").build();
        let missing = TaskBuilder::new().with_name("added while down").build();

        let store = MockJobStore::new();
        {
            let h = harness_with(vec![kept.clone(), deleted.clone()], store.clone());
            h.scheduler.add(&kept).await.unwrap();
            h.scheduler.add(&deleted).await.unwrap();
        }
        let kept_next = store.job(&kept.id).unwrap().next_run_time;

        // 模拟停机期间的注册表修改
        let h = harness_with(
            vec![kept.clone(), deleted.clone(), missing.clone()],
            store.clone(),
        );
        h.registry.soft_delete(&deleted.id).await.unwrap();

        let report = h.scheduler.restore().await.unwrap();
        assert_eq!(report.loaded, 2);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.removed, 1);
        assert_eq!(report.added, 1);

        assert_eq!(h.scheduler.next_run_time(&kept.id).await, Some(kept_next));
        assert!(h.store.job(&deleted.id).is_none());
        assert!(h.store.job(&missing.id).is_some());

        // 恢复后继续按原相位触发
        let mut h = h;
        assert_eq!(h.scheduler.dispatch_due(kept_next).await.fired, 1);
        assert!(h.dispatch_rx.try_recv().is_ok());
        assert_eq!(
            store.job(&kept.id).unwrap().next_run_time,
            kept_next + Duration::seconds(30)
        );
    }

    #[tokio::test]
    async fn test_run_now_respects_single_instance() {
        let task = TaskBuilder::new().build();
        let mut h = harness(vec![task.clone()]);

        let first = h.scheduler.run_now(&task.id).await.unwrap();
        assert!(first.is_some());
        assert!(h.scheduler.run_now(&task.id).await.unwrap().is_none());
        assert_eq!(h.scheduler.running_executions().len(), 1);

        // 立即执行不创建调度记录
        assert_eq!(h.store.count(), 0);

        let message = h.dispatch_rx.try_recv().unwrap();
        assert!(h.scheduler.cancel(&message.execution_id));
        assert!(message.cancel_token.is_cancelled());

        assert!(matches!(
            h.scheduler.run_now("missing").await,
            Err(SchedulerError::TaskNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_list_jobs_sorted_by_next_run() {
        let slow = TaskBuilder::new().with_name("slow").with_interval(3600).build();
        let fast = TaskBuilder::new().with_name("fast").with_interval(5).build();
        let h = harness(vec![slow.clone(), fast.clone()]);
        h.scheduler.add(&slow).await.unwrap();
        h.scheduler.add(&fast).await.unwrap();

        let jobs = h.scheduler.list_jobs().await;
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].task_name, "fast");
        assert_eq!(jobs[1].trigger, Trigger::Interval { seconds: 3600 });
    }

    #[tokio::test]
    async fn test_closed_worker_pool_fails_execution() {
        let task = TaskBuilder::new().build();
        let h = harness(vec![task.clone()]);
        drop(h.dispatch_rx);

        assert!(h.scheduler.run_now(&task.id).await.is_err());
        assert_eq!(h.executions.count_with_status(ExecutionStatus::Failed), 1);
        assert!(!h.tracker.is_running(&task.id));
        assert_eq!(h.registry.task(&task.id).unwrap().failed_count, 1);
    }

    #[tokio::test]
    async fn test_failed_finish_write_keeps_task_occupied() {
        let task = TaskBuilder::new().with_interval(5).build();
        let mut h = harness(vec![task.clone()]);
        let first = h.scheduler.add(&task).await.unwrap().unwrap();

        assert_eq!(h.scheduler.dispatch_due(first).await.fired, 1);
        let message = h.dispatch_rx.try_recv().unwrap();

        h.executions.set_fail_finish(true);
        assert!(h.tracker.on_finish(&completed(&message, 0)).await.is_err());
        assert!(h.tracker.is_running(&task.id));
        assert_eq!(h.tracker.pending_finish_count(), 1);

        // 终态未落盘前，定时触发与手动触发都被合并
        let summary = h.scheduler.dispatch_due(first + Duration::seconds(5)).await;
        assert_eq!(summary.fired, 0);
        assert_eq!(summary.skipped, 1);
        assert!(h.scheduler.run_now(&task.id).await.unwrap().is_none());
        assert!(h.dispatch_rx.try_recv().is_err());
        assert_eq!(h.executions.running_for(&task.id), 1);

        // 存储恢复后重试写入并释放占位
        h.executions.set_fail_finish(false);
        assert_eq!(h.tracker.retry_pending_finishes().await, 1);
        assert_eq!(h.tracker.pending_finish_count(), 0);
        assert!(!h.tracker.is_running(&task.id));
        assert_eq!(h.executions.count_with_status(ExecutionStatus::Success), 1);
        let stored = h.registry.task(&task.id).unwrap();
        assert_eq!((stored.run_count, stored.success_count), (1, 1));

        let summary = h.scheduler.dispatch_due(first + Duration::seconds(10)).await;
        assert_eq!(summary.fired, 1);
        assert_eq!(h.executions.running_for(&task.id), 1);
    }

    #[tokio::test]
    async fn test_execution_open_in_store_coalesces_firing() {
        let task = TaskBuilder::new().with_interval(5).build();
        let mut h = harness(vec![task.clone()]);
        let first = h.scheduler.add(&task).await.unwrap().unwrap();

        // 共用同一存储的另一个进程正在执行该任务
        h.executions.insert(TaskExecution::start(&task, Utc::now()));

        assert!(h.scheduler.run_now(&task.id).await.unwrap().is_none());
        let summary = h.scheduler.dispatch_due(first).await;
        assert_eq!(summary.fired, 0);
        assert_eq!(summary.skipped, 1);
        assert!(h.dispatch_rx.try_recv().is_err());
        assert!(!h.tracker.is_running(&task.id));
        assert_eq!(h.executions.running_for(&task.id), 1);
        assert_eq!(
            h.scheduler.next_run_time(&task.id).await,
            Some(first + Duration::seconds(5))
        );
    }

    #[tokio::test]
    async fn test_update_with_enabled_task_clears_pause() {
        let task = TaskBuilder::new().with_interval(60).build();
        let h = harness(vec![task.clone()]);
        h.scheduler.add(&task).await.unwrap();
        h.scheduler.pause(&task.id).await.unwrap();

        let next = h.scheduler.update(&task).await.unwrap();
        assert!(next.is_some());
        assert!(h.store.job(&task.id).is_some());

        let report = h.scheduler.reconcile().await.unwrap();
        assert_eq!(report.removed, 0);
        assert_eq!(h.scheduler.next_run_time(&task.id).await, next);
    }

    #[tokio::test]
    async fn test_reenabled_in_registry_after_pause_is_rescheduled() {
        let task = TaskBuilder::new().with_interval(60).build();
        let h = harness(vec![task.clone()]);
        h.scheduler.add(&task).await.unwrap();

        h.scheduler.pause(&task.id).await.unwrap();
        h.registry.set_enabled(&task.id, false).await.unwrap();
        assert_eq!(h.scheduler.reconcile().await.unwrap().added, 0);

        // 另一个进程重新启用任务
        h.registry.set_enabled(&task.id, true).await.unwrap();
        let report = h.scheduler.reconcile().await.unwrap();
        assert_eq!(report.added, 1);
        assert!(h.scheduler.next_run_time(&task.id).await.is_some());
        assert!(h.store.job(&task.id).is_some());
    }

    #[tokio::test]
    async fn test_run_loop_reconciles_with_registry() {
        let kept = TaskBuilder::new().with_name("kept").with_interval(3600).build();
        let disabled_later = TaskBuilder::new()
            .with_name("disabled later")
            .with_interval(3600)
            .build();
        let registry = MockTaskRegistry::with_tasks(vec![kept.clone(), disabled_later.clone()]);
        let executions = MockExecutionRepository::with_registry(registry.clone());
        let metrics = Arc::new(MetricsCollector::new());
        let tracker = Arc::new(ExecutionTracker::new(Arc::new(executions), metrics.clone()));
        let (dispatch_tx, _dispatch_rx) = mpsc::channel(16);
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig {
                reconcile_interval_seconds: 1,
                max_idle_seconds: 1,
                ..test_config()
            },
            Arc::new(MockJobStore::new()),
            Arc::new(registry.clone()),
            tracker,
            dispatch_tx,
            metrics,
        ));
        scheduler.add(&kept).await.unwrap();
        scheduler.add(&disabled_later).await.unwrap();

        let shutdown = CancellationToken::new();
        let loop_handle = {
            let scheduler = scheduler.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { scheduler.run(shutdown).await })
        };

        // 调度循环之外修改注册表
        let added = TaskBuilder::new().with_name("added").with_interval(3600).build();
        registry.create(&added).await.unwrap();
        registry.set_enabled(&disabled_later.id, false).await.unwrap();

        let converged = TestEnv::wait_for(
            || {
                let scheduler = scheduler.clone();
                let added_id = added.id.clone();
                let disabled_id = disabled_later.id.clone();
                async move {
                    scheduler.next_run_time(&added_id).await.is_some()
                        && scheduler.next_run_time(&disabled_id).await.is_none()
                }
            },
            std::time::Duration::from_secs(5),
        )
        .await;
        assert!(converged, "run loop did not pick up registry edits");
        assert!(scheduler.next_run_time(&kept.id).await.is_some());

        shutdown.cancel();
        loop_handle.await.unwrap();
    }
}
