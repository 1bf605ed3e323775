#![cfg(unix)]

#[cfg(test)]
mod app_tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use scheduler_core::{AppConfig, DatabaseConfig, ExecutionStatus, TaskFilter};
    use scheduler_infrastructure::DatabaseManager;
    use scheduler_testing_utils::{ScriptDir, TaskBuilder, TestEnv};
    use script_scheduler::app::Application;
    use script_scheduler::shutdown::ShutdownManager;

    async fn application(scripts: &ScriptDir) -> Application {
        let mut config = AppConfig::default();
        config.executor.scripts_dir = scripts.path().display().to_string();
        config.executor.script_log_dir = scripts.log_dir().display().to_string();
        config.executor.kill_grace_period_seconds = 1;
        config.scheduler.max_idle_seconds = 1;

        let database = DatabaseManager::in_memory().await.unwrap();
        Application::with_database(config, database)
    }

    #[tokio::test]
    async fn test_foreground_run_records_execution() {
        let scripts = ScriptDir::new().unwrap();
        scripts
            .write_script("echo_ok.sh", "#!/bin/bash\necho \"hello $1\"\n")
            .unwrap();
        let app = application(&scripts).await;

        let task = app
            .controller()
            .create_task(
                &TaskBuilder::new()
                    .with_script("echo_ok.sh")
                    .with_arguments(vec!["world".to_string()])
                    .disabled()
                    .build(),
            )
            .await
            .unwrap();

        let execution = app
            .run_task_foreground(&task.id, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(execution.status, ExecutionStatus::Success);
        assert_eq!(execution.output.as_deref().map(str::trim), Some("hello world"));

        let stored = app.controller().get_task(&task.id).await.unwrap();
        assert_eq!((stored.run_count, stored.success_count), (1, 1));
    }

    #[tokio::test]
    async fn test_foreground_run_can_be_cancelled() {
        let scripts = ScriptDir::new().unwrap();
        scripts
            .write_script("slow.sh", "#!/bin/bash\nsleep 4721\n")
            .unwrap();
        let app = application(&scripts).await;
        let task = app
            .controller()
            .create_task(&TaskBuilder::new().with_script("slow.sh").disabled().build())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let execution = app.run_task_foreground(&task.id, cancel).await.unwrap();
        assert_eq!(execution.status, ExecutionStatus::Cancelled);
        let stored = app.controller().get_task(&task.id).await.unwrap();
        assert_eq!((stored.run_count, stored.failed_count), (1, 1));
    }

    #[tokio::test]
    async fn test_second_application_on_same_database_cannot_run_open_task() {
        let scripts = ScriptDir::new().unwrap();
        scripts
            .write_script("hold.sh", "#!/bin/bash\nsleep 4723\n")
            .unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let database_config = DatabaseConfig {
            url: format!("sqlite://{}", state_dir.path().join("scheduler.db").display()),
            ..DatabaseConfig::default()
        };

        let mut config = AppConfig::default();
        config.executor.scripts_dir = scripts.path().display().to_string();
        config.executor.script_log_dir = scripts.log_dir().display().to_string();
        config.executor.kill_grace_period_seconds = 1;
        config.database = database_config.clone();

        let first = Application::with_database(
            config.clone(),
            DatabaseManager::new(&database_config).await.unwrap(),
        );
        let second = Application::with_database(
            config,
            DatabaseManager::new(&database_config).await.unwrap(),
        );

        let task = first
            .controller()
            .create_task(&TaskBuilder::new().with_script("hold.sh").disabled().build())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let scheduler = first.scheduler().clone();
        let task_id = task.id.clone();
        let holder = {
            let cancel = cancel.clone();
            tokio::spawn(async move { first.run_task_foreground(&task_id, cancel).await })
        };
        assert!(
            TestEnv::wait_for(
                || {
                    let scheduler = scheduler.clone();
                    async move { !scheduler.running_executions().is_empty() }
                },
                Duration::from_secs(5),
            )
            .await
        );

        let rejected = second
            .run_task_foreground(&task.id, CancellationToken::new())
            .await;
        assert!(rejected.is_err());

        cancel.cancel();
        let finished = tokio::time::timeout(Duration::from_secs(10), holder)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(finished.status, ExecutionStatus::Cancelled);

        let history = second
            .scheduler()
            .tracker()
            .list(&task.id, 10, None)
            .await
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_serve_dispatches_and_shuts_down_gracefully() {
        let scripts = ScriptDir::new().unwrap();
        scripts
            .write_script("tick.sh", "#!/bin/bash\necho tick\n")
            .unwrap();
        scripts
            .write_script("hang.sh", "#!/bin/bash\nsleep 4722\n")
            .unwrap();
        let app = application(&scripts).await;

        let ticking = app
            .controller()
            .create_task(&TaskBuilder::new().with_script("tick.sh").with_interval(1).build())
            .await
            .unwrap();
        let hanging = app
            .controller()
            .create_task(&TaskBuilder::new().with_script("hang.sh").with_interval(1).build())
            .await
            .unwrap();

        let controller_view = app.controller().list_tasks(&TaskFilter::default()).await.unwrap();
        assert_eq!(controller_view.len(), 2);

        let hang_started = {
            let scheduler = app.scheduler().clone();
            move || {
                let scheduler = scheduler.clone();
                async move { !scheduler.running_executions().is_empty() }
            }
        };

        let shutdown = ShutdownManager::new();
        let token = shutdown.subscribe();
        let scheduler = app.scheduler().clone();
        let handle = tokio::spawn(async move { app.run(token).await });

        assert!(TestEnv::wait_for(hang_started, Duration::from_secs(5)).await);
        assert!(
            TestEnv::wait_for(
                || async {
                    scheduler
                        .tracker()
                        .list(&ticking.id, 10, Some(ExecutionStatus::Success))
                        .await
                        .map(|runs| !runs.is_empty())
                        .unwrap_or(false)
                },
                Duration::from_secs(5),
            )
            .await
        );

        shutdown.shutdown();
        tokio::time::timeout(Duration::from_secs(15), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        let hung = scheduler.tracker().list(&hanging.id, 10, None).await.unwrap();
        assert_eq!(hung.len(), 1);
        assert_eq!(hung[0].status, ExecutionStatus::Cancelled);
    }
}
