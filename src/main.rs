use std::net::SocketAddr;

use anyhow::{Context, Result};
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use scheduler_core::{AppConfig, TaskFilter};
use script_scheduler::app::Application;
use script_scheduler::cli::{Cli, Commands, TaskCommand};
use script_scheduler::shutdown::ShutdownManager;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = AppConfig::load(cli.config.as_deref()).context("加载配置失败")?;
    if let Some(level) = &cli.log_level {
        config.observability.log_level = level.clone();
    }
    if let Some(format) = &cli.log_format {
        config.observability.log_format = format.clone();
    }

    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    )?;

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Task(command) => {
            let app = Application::new(config).await?;
            run_task_command(&app, command).await
        }
        Commands::Jobs => {
            let app = Application::new(config).await?;
            app.restore_schedule().await?;
            let jobs = app.scheduler().list_jobs().await;
            if jobs.is_empty() {
                println!("没有调度记录");
            }
            for job in jobs {
                println!(
                    "{}\t{}\t{}\t下次: {}",
                    job.task_id,
                    job.task_name,
                    job.trigger,
                    job.next_run_time.to_rfc3339()
                );
            }
            Ok(())
        }
        Commands::History {
            task_id,
            limit,
            status,
        } => {
            let app = Application::new(config).await?;
            let executions = app
                .controller()
                .list_executions(&task_id, limit, status)
                .await?;
            for execution in executions {
                println!(
                    "{}\t{}\t{}\t耗时: {}\t退出码: {}",
                    execution.id,
                    execution.start_time.to_rfc3339(),
                    execution.status,
                    execution
                        .duration
                        .map_or_else(|| "-".to_string(), |d| format!("{d:.3}s")),
                    execution
                        .exit_code
                        .map_or_else(|| "-".to_string(), |c| c.to_string()),
                );
            }
            Ok(())
        }
        Commands::Run { task_id } => {
            let app = Application::new(config).await?;
            let shutdown = ShutdownManager::new();
            shutdown.listen_for_signals();

            let execution = app
                .run_task_foreground(&task_id, shutdown.subscribe())
                .await?;
            println!(
                "执行 {} 结束: {} (退出码: {})",
                execution.id,
                execution.status,
                execution
                    .exit_code
                    .map_or_else(|| "-".to_string(), |c| c.to_string())
            );
            if let Some(output) = execution.output.filter(|o| !o.is_empty()) {
                println!("{output}");
            }
            if let Some(err) = execution.error.filter(|e| !e.is_empty()) {
                eprintln!("{err}");
            }
            Ok(())
        }
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("启动脚本任务调度系统");

    if config.observability.metrics_enabled {
        install_metrics_exporter(&config.observability.metrics_bind_address)?;
    }

    let app = Application::new(config).await?;
    let shutdown = ShutdownManager::new();
    shutdown.listen_for_signals();

    let token = shutdown.subscribe();
    let handle = tokio::spawn(async move { app.run(token).await });

    match handle.await {
        Ok(Ok(())) => info!("应用已优雅关闭"),
        Ok(Err(e)) => {
            error!("应用运行失败: {:#}", e);
            return Err(e);
        }
        Err(e) => error!("应用任务异常退出: {}", e),
    }

    info!("脚本任务调度系统已退出");
    Ok(())
}

async fn run_task_command(app: &Application, command: TaskCommand) -> Result<()> {
    let controller = app.controller();
    match command {
        TaskCommand::Add(args) => {
            let task = args.into_task(app.config().executor.default_timeout_seconds)?;
            let created = controller.create_task(&task).await?;
            println!("任务已创建: {} ({})", created.id, created.name);
        }
        TaskCommand::List { all, keyword } => {
            let filter = TaskFilter {
                keyword,
                include_deleted: all,
                ..TaskFilter::default()
            };
            for task in controller.list_tasks(&filter).await? {
                let state = match (task.deleted, task.enabled) {
                    (true, _) => "deleted",
                    (false, true) => "enabled",
                    (false, false) => "disabled",
                };
                println!(
                    "{}\t{}\t{}\t{}\t运行: {} 成功: {} 失败: {}",
                    task.id,
                    task.name,
                    state,
                    task.trigger_type.as_str(),
                    task.run_count,
                    task.success_count,
                    task.failed_count
                );
            }
        }
        TaskCommand::Show { task_id } => {
            app.restore_schedule().await?;
            let task = controller.get_task(&task_id).await?;
            println!("{}", serde_json::to_string_pretty(&task)?);
            match app.scheduler().next_run_time(&task_id).await {
                Some(next) => println!("下次执行: {}", next.to_rfc3339()),
                None => println!("下次执行: -"),
            }
            let summary = controller.get_task_status_summary(&task_id, 100).await?;
            println!(
                "最近执行: 运行中 {} 成功 {} 失败 {} 超时 {} 取消 {} 错过 {}",
                summary.running,
                summary.success,
                summary.failed,
                summary.timeout,
                summary.cancelled,
                summary.missed
            );
        }
        TaskCommand::Delete { task_id } => {
            controller.delete_task(&task_id).await?;
            println!("任务已删除: {task_id}");
        }
        TaskCommand::Restore { task_id } => {
            controller.restore_task(&task_id).await?;
            println!("任务已恢复: {task_id}");
        }
        TaskCommand::Enable { task_id } => {
            controller.set_enabled(&task_id, true).await?;
            println!("任务已启用: {task_id}");
        }
        TaskCommand::Disable { task_id } => {
            controller.set_enabled(&task_id, false).await?;
            println!("任务已禁用: {task_id}");
        }
    }
    Ok(())
}

/// 初始化日志系统
fn init_logging(log_level: &str, log_format: &str) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    match log_format {
        "json" => {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .context("初始化JSON日志格式失败")?;
        }
        "pretty" => {
            registry
                .with(tracing_subscriber::fmt::layer().pretty())
                .try_init()
                .context("初始化Pretty日志格式失败")?;
        }
        _ => {
            return Err(anyhow::anyhow!("不支持的日志格式: {log_format}"));
        }
    }

    Ok(())
}

fn install_metrics_exporter(bind_address: &str) -> Result<()> {
    let addr: SocketAddr = bind_address
        .parse()
        .with_context(|| format!("无效的指标监听地址: {bind_address}"))?;
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("安装Prometheus导出器失败")?;
    info!(%addr, "Prometheus指标导出已启用");
    Ok(())
}
