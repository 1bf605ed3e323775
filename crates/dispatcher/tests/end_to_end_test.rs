#![cfg(unix)]

#[cfg(test)]
mod end_to_end_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use scheduler_core::{
        ExecutionRepository, ExecutionStatus, ExecutorConfig, JobStore, SchedulerConfig,
        TaskRegistry,
    };
    use scheduler_dispatcher::{
        ExecutionTracker, RecoveryService, StateListener, TaskController, TaskScheduler,
    };
    use scheduler_infrastructure::{DatabaseManager, MetricsCollector};
    use scheduler_testing_utils::{ScriptDir, TaskBuilder, TestEnv};
    use scheduler_worker::{ScriptExecutor, WorkerPool};

    struct System {
        scheduler: Arc<TaskScheduler>,
        controller: TaskController,
        registry: Arc<dyn TaskRegistry>,
        executions: Arc<dyn ExecutionRepository>,
        shutdown: CancellationToken,
    }

    /// 组装完整的调度链路：SQLite 存储、调度核心、工作池、完成监听器
    fn start_system(db: &DatabaseManager, scripts: &ScriptDir) -> System {
        let metrics = Arc::new(MetricsCollector::new());
        let registry: Arc<dyn TaskRegistry> = Arc::new(db.task_registry());
        let store: Arc<dyn JobStore> = Arc::new(db.job_store());
        let executions: Arc<dyn ExecutionRepository> = Arc::new(db.execution_repository());

        let (dispatch_tx, dispatch_rx) = mpsc::channel(16);
        let (done_tx, done_rx) = mpsc::channel(16);
        let tracker = Arc::new(ExecutionTracker::new(executions.clone(), metrics.clone()));
        let scheduler = Arc::new(TaskScheduler::new(
            SchedulerConfig::default(),
            store,
            registry.clone(),
            tracker.clone(),
            dispatch_tx,
            metrics,
        ));

        let executor = Arc::new(ScriptExecutor::new(ExecutorConfig {
            scripts_dir: scripts.path().display().to_string(),
            script_log_dir: scripts.log_dir().display().to_string(),
            ..ExecutorConfig::default()
        }));
        let pool = WorkerPool::new(executor, 4, done_tx);
        let shutdown = CancellationToken::new();
        let stop = shutdown.clone();
        tokio::spawn(async move { pool.run(dispatch_rx, stop, Duration::from_secs(2)).await });

        let listener = StateListener::new(tracker);
        tokio::spawn(async move { listener.run(done_rx).await });

        System {
            controller: TaskController::new(registry.clone(), scheduler.clone()),
            scheduler,
            registry,
            executions,
            shutdown,
        }
    }

    async fn wait_for_run_count(system: &System, task_id: &str, expected: i64) -> bool {
        TestEnv::wait_for(
            || async {
                let task = system.registry.get(task_id).await.ok().flatten();
                task.is_some_and(|t| t.run_count == expected)
                    && !system.scheduler.tracker().is_running(task_id)
            },
            Duration::from_secs(10),
        )
        .await
    }

    #[tokio::test]
    async fn test_interval_task_runs_twice() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let scripts = ScriptDir::new().unwrap();
        scripts
            .write_script("echo_ok.sh", "#!/bin/bash\necho ok\nexit 0\n")
            .unwrap();
        let system = start_system(&db, &scripts);

        let task = system
            .controller
            .create_task(
                &TaskBuilder::new()
                    .with_name("echo_ok")
                    .with_script("echo_ok.sh")
                    .with_interval(5)
                    .build(),
            )
            .await
            .unwrap();

        for cycle in 1..=2 {
            let due = system.scheduler.next_run_time(&task.id).await.unwrap();
            let summary = system.scheduler.dispatch_due(due).await;
            assert_eq!(summary.fired, 1, "cycle {cycle}");
            assert!(wait_for_run_count(&system, &task.id, cycle).await, "cycle {cycle}");
        }

        let stored = system.registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!(stored.run_count, 2);
        assert_eq!(stored.success_count, 2);
        assert_eq!(stored.failed_count, 0);

        let history = system.executions.list_by_task(&task.id, 10, None).await.unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|e| e.status == ExecutionStatus::Success));
        assert!(history.iter().all(|e| e.output.as_deref().map(str::trim) == Some("ok")));

        system.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_failed_run_now_is_recorded_not_raised() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let scripts = ScriptDir::new().unwrap();
        scripts
            .write_script("broken.sh", "#!/bin/bash\necho nope >&2\nexit 7\n")
            .unwrap();
        let system = start_system(&db, &scripts);

        let task = system
            .controller
            .create_task(&TaskBuilder::new().with_script("broken.sh").build())
            .await
            .unwrap();

        let execution_id = system.controller.run_task_now(&task.id).await.unwrap();
        assert!(execution_id.is_some());
        assert!(wait_for_run_count(&system, &task.id, 1).await);

        let stored = system.registry.get(&task.id).await.unwrap().unwrap();
        assert_eq!((stored.success_count, stored.failed_count), (0, 1));
        let history = system
            .controller
            .list_executions(&task.id, 10, Some(ExecutionStatus::Failed))
            .await
            .unwrap();
        assert_eq!(history[0].exit_code, Some(7));

        system.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_schedule_survives_restart() {
        let db = DatabaseManager::in_memory().await.unwrap();
        let scripts = ScriptDir::new().unwrap();
        scripts.write_script("echo_ok.sh", "#!/bin/bash\necho ok\n").unwrap();

        let first = start_system(&db, &scripts);
        let task = first
            .controller
            .create_task(
                &TaskBuilder::new()
                    .with_script("echo_ok.sh")
                    .with_cron("0 12 * * *")
                    .build(),
            )
            .await
            .unwrap();
        let before = first.scheduler.next_run_time(&task.id).await.unwrap();
        first.shutdown.cancel();
        drop(first);

        let second = start_system(&db, &scripts);
        let report = RecoveryService::new(second.scheduler.clone())
            .recover_system_state()
            .await
            .unwrap();

        assert_eq!(report.reconcile.loaded, 1);
        assert_eq!(report.reconcile.unchanged, 1);
        assert_eq!(second.scheduler.next_run_time(&task.id).await, Some(before));

        second.shutdown.cancel();
    }
}
