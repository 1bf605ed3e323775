#![cfg(unix)]

#[cfg(test)]
mod executor_tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use scheduler_core::{ExecutionRequest, ExecutionStatus, ExecutorConfig, TaskExecutor};
    use scheduler_testing_utils::{ScriptDir, TaskBuilder, TestEnv};
    use scheduler_worker::ScriptExecutor;

    fn executor_for(dir: &ScriptDir) -> ScriptExecutor {
        ScriptExecutor::new(ExecutorConfig {
            scripts_dir: dir.path().display().to_string(),
            script_log_dir: dir.log_dir().display().to_string(),
            kill_grace_period_seconds: 1,
            ..ExecutorConfig::default()
        })
    }

    fn request(task: scheduler_core::Task) -> ExecutionRequest {
        ExecutionRequest {
            execution_id: TestEnv::unique_name("exec"),
            task,
        }
    }

    /// 命令行中包含 `marker` 的进程（不含僵尸进程）
    fn processes_with(marker: &str) -> Vec<String> {
        let mut found = Vec::new();
        for entry in std::fs::read_dir("/proc").unwrap().flatten() {
            let Ok(cmdline) = std::fs::read(entry.path().join("cmdline")) else {
                continue;
            };
            let cmdline = String::from_utf8_lossy(&cmdline).replace('\0', " ");
            if cmdline.contains(marker) {
                found.push(cmdline);
            }
        }
        found
    }

    #[tokio::test]
    async fn test_success_captures_output_and_env() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script(
            "echo_ok.sh",
            "#!/bin/bash\necho \"id=$TASK_ID exec=$TASK_EXECUTION_ID\"\necho \"log=$TASK_SCRIPT_LOG\"\necho \"custom=$GREETING\"\n",
        )
        .unwrap();
        let executor = executor_for(&dir);
        let task = TaskBuilder::new()
            .with_script("echo_ok.sh")
            .with_env("GREETING", "hello")
            .build();
        let request = request(task.clone());

        let result = executor
            .execute(&request, CancellationToken::new())
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(result.exit_code, Some(0));
        assert!(result.error.is_none());
        assert!(result
            .output
            .contains(&format!("id={} exec={}", task.id, request.execution_id)));
        assert!(result.output.contains("custom=hello"));

        let log_path = dir.log_dir().canonicalize().unwrap().join("echo_ok.log");
        assert!(result.output.contains(&format!("log={}", log_path.display())));
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failed() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script("fail.sh", "#!/bin/bash\necho boom >&2\nexit 3\n")
            .unwrap();
        let executor = executor_for(&dir);

        let result = executor
            .execute(
                &request(TaskBuilder::new().with_script("fail.sh").build()),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.error.as_deref().map(str::trim), Some("boom"));
    }

    #[tokio::test]
    async fn test_missing_script_is_failed() {
        let dir = ScriptDir::new().unwrap();
        let executor = executor_for(&dir);

        let result = executor
            .execute(
                &request(TaskBuilder::new().with_script("nope.sh").build()),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Failed);
        assert_eq!(result.exit_code, None);
        assert!(result.error.unwrap().contains("nope.sh"));
    }

    #[tokio::test]
    async fn test_arguments_are_not_shell_interpreted() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script("args.sh", "#!/bin/bash\nfor arg in \"$@\"; do echo \"[$arg]\"; done\n")
            .unwrap();
        let executor = executor_for(&dir);
        let marker = dir.path().join("pwned");
        let hostile = format!("$(touch {}); echo hi", marker.display());

        let result = executor
            .execute(
                &request(
                    TaskBuilder::new()
                        .with_script("args.sh")
                        .with_arguments(vec![hostile.clone(), "two words".to_string()])
                        .build(),
                ),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert_eq!(
            result.output.lines().collect::<Vec<_>>(),
            vec![format!("[{hostile}]"), "[two words]".to_string()]
        );
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_timeout_kills_process_tree() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script("hang.sh", "#!/bin/bash\nsleep 4711 &\nsleep 4711\n")
            .unwrap();
        let executor = executor_for(&dir);

        let result = executor
            .execute(
                &request(
                    TaskBuilder::new()
                        .with_script("hang.sh")
                        .with_timeout(1)
                        .build(),
                ),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert!(result.elapsed_seconds >= 1.0, "{}", result.elapsed_seconds);
        assert!(result.elapsed_seconds < 3.0, "{}", result.elapsed_seconds);

        let gone = TestEnv::wait_for(
            || async { processes_with("sleep 4711").is_empty() },
            Duration::from_secs(3),
        )
        .await;
        assert!(gone, "orphans left: {:?}", processes_with("sleep 4711"));
    }

    #[tokio::test]
    async fn test_cancel_terminates_execution() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script("long.sh", "#!/bin/bash\nsleep 4712\n").unwrap();
        let executor = executor_for(&dir);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let result = executor
            .execute(
                &request(
                    TaskBuilder::new()
                        .with_script("long.sh")
                        .with_timeout(30)
                        .build(),
                ),
                cancel,
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(result.elapsed_seconds < 5.0);
        assert!(TestEnv::wait_for(
            || async { processes_with("sleep 4712").is_empty() },
            Duration::from_secs(3),
        )
        .await);
    }

    #[tokio::test]
    async fn test_already_cancelled_never_spawns() {
        let dir = ScriptDir::new().unwrap();
        let marker = dir.path().join("ran");
        dir.write_script("touch.sh", &format!("#!/bin/bash\ntouch {}\n", marker.display()))
            .unwrap();
        let executor = executor_for(&dir);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor
            .execute(
                &request(TaskBuilder::new().with_script("touch.sh").build()),
                cancel,
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Cancelled);
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_log_file_is_appended_with_banners() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script("report.sh", "#!/bin/bash\necho \"from script\" >> \"$TASK_SCRIPT_LOG\"\n")
            .unwrap();
        let executor = executor_for(&dir);
        let task = TaskBuilder::new().with_script("report.sh").build();

        let first = request(task.clone());
        let second = request(task);
        executor.execute(&first, CancellationToken::new()).await;
        executor.execute(&second, CancellationToken::new()).await;

        let log = std::fs::read_to_string(dir.log_dir().join("report.log")).unwrap();
        assert!(log.contains(&first.execution_id));
        assert!(log.contains(&second.execution_id));
        assert_eq!(log.matches("from script").count(), 2);
        assert_eq!(log.matches("status=success exit_code=0").count(), 2);
    }

    #[tokio::test]
    async fn test_working_directory_defaults_to_script_dir() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script("where.sh", "#!/bin/bash\npwd -P\n").unwrap();
        let executor = executor_for(&dir);

        let result = executor
            .execute(
                &request(TaskBuilder::new().with_script("where.sh").build()),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            result.output.trim(),
            dir.path().canonicalize().unwrap().display().to_string()
        );

        let elsewhere = tempfile::tempdir().unwrap();
        let result = executor
            .execute(
                &request(
                    TaskBuilder::new()
                        .with_script("where.sh")
                        .with_working_directory(&elsewhere.path().display().to_string())
                        .build(),
                ),
                CancellationToken::new(),
            )
            .await;
        assert_eq!(
            result.output.trim(),
            elsewhere.path().canonicalize().unwrap().display().to_string()
        );
    }

    #[tokio::test]
    async fn test_output_is_bounded() {
        let dir = ScriptDir::new().unwrap();
        dir.write_script("noisy.sh", "#!/bin/bash\nhead -c 200000 /dev/zero | tr '\\0' 'x'\n")
            .unwrap();
        let executor = ScriptExecutor::new(ExecutorConfig {
            scripts_dir: dir.path().display().to_string(),
            script_log_dir: dir.log_dir().display().to_string(),
            max_output_bytes: 1024,
            ..ExecutorConfig::default()
        });

        let result = executor
            .execute(
                &request(TaskBuilder::new().with_script("noisy.sh").build()),
                CancellationToken::new(),
            )
            .await;

        assert_eq!(result.status, ExecutionStatus::Success);
        assert!(result.output.starts_with(&"x".repeat(1024)));
        assert!(result.output.len() < 1100);
    }
}
