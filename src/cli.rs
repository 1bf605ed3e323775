use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use clap::{ArgGroup, Args, Parser, Subcommand};

use scheduler_core::{ExecutionStatus, Task, Trigger};

/// 命令行参数
#[derive(Debug, Parser)]
#[command(name = "script-scheduler", version, about = "脚本任务调度系统")]
pub struct Cli {
    /// 配置文件路径，未指定时依次查找默认位置
    #[arg(short, long, value_name = "FILE", global = true)]
    pub config: Option<String>,

    /// 日志级别，覆盖配置文件
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        global = true,
        value_parser = ["trace", "debug", "info", "warn", "error"]
    )]
    pub log_level: Option<String>,

    /// 日志格式，覆盖配置文件
    #[arg(long, value_name = "FORMAT", global = true, value_parser = ["json", "pretty"])]
    pub log_format: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// 运行调度服务（默认）
    Serve,
    /// 管理任务定义
    #[command(subcommand)]
    Task(TaskCommand),
    /// 列出调度记录
    Jobs,
    /// 查看任务的执行历史
    History {
        task_id: String,
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: i64,
        /// 只显示指定状态
        #[arg(long)]
        status: Option<ExecutionStatus>,
    },
    /// 在前台立即执行一次任务
    Run { task_id: String },
}

#[derive(Debug, Subcommand)]
pub enum TaskCommand {
    /// 新建任务
    Add(AddTaskArgs),
    /// 列出任务
    List {
        /// 包含已删除的任务
        #[arg(long)]
        all: bool,
        /// 按名称或描述搜索
        #[arg(long)]
        keyword: Option<String>,
    },
    /// 查看任务详情
    Show { task_id: String },
    /// 删除任务（可恢复）
    Delete { task_id: String },
    /// 恢复已删除的任务
    Restore { task_id: String },
    /// 启用任务
    Enable { task_id: String },
    /// 禁用任务
    Disable { task_id: String },
}

#[derive(Debug, Args)]
#[command(group(
    ArgGroup::new("trigger")
        .required(true)
        .args(["cron", "interval", "at"])
))]
pub struct AddTaskArgs {
    #[arg(long)]
    pub name: String,

    /// 脚本路径，相对路径基于脚本目录解析
    #[arg(long)]
    pub script: String,

    /// cron表达式（5段或6段）
    #[arg(long)]
    pub cron: Option<String>,

    /// 执行间隔（秒）
    #[arg(long)]
    pub interval: Option<u64>,

    /// 一次性执行时间（RFC 3339）
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,

    /// 脚本参数，可重复
    #[arg(long = "arg", value_name = "ARG", allow_hyphen_values = true)]
    pub arguments: Vec<String>,

    /// 环境变量 KEY=VALUE，可重复
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = parse_env_pair)]
    pub environment: Vec<(String, String)>,

    #[arg(long)]
    pub working_dir: Option<String>,

    /// 超时时间（秒）
    #[arg(long)]
    pub timeout: Option<u64>,

    #[arg(long)]
    pub description: Option<String>,

    /// 创建后保持禁用
    #[arg(long)]
    pub disabled: bool,
}

impl AddTaskArgs {
    pub fn into_task(self, default_timeout_seconds: u64) -> Result<Task> {
        let trigger = match (self.cron, self.interval, self.at) {
            (Some(expression), None, None) => Trigger::Cron { expression },
            (None, Some(seconds), None) => Trigger::Interval { seconds },
            (None, None, Some(run_at)) => Trigger::Date { run_at },
            _ => return Err(anyhow!("必须且只能指定 --cron、--interval、--at 之一")),
        };

        let mut task = Task::new(self.name, self.script, trigger);
        task.arguments = self.arguments;
        task.environment = self.environment.into_iter().collect();
        task.working_directory = self.working_dir;
        task.timeout_seconds = self.timeout.unwrap_or(default_timeout_seconds);
        task.description = self.description;
        task.enabled = !self.disabled;
        Ok(task)
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("环境变量格式应为 KEY=VALUE: {raw}")),
    }
}
