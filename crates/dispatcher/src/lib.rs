//! 调度分发
//!
//! - [`cron_utils`] / [`trigger`]: 触发时间计算
//! - [`scheduler`]: 调度核心与调度循环
//! - [`tracker`]: 执行记录与计数器
//! - [`state_listener`]: 完成通道消费者
//! - [`recovery_service`]: 启动恢复
//! - [`controller`]: 面向任务注册表的控制入口

pub mod controller;
pub mod cron_utils;
pub mod recovery_service;
pub mod scheduler;
pub mod state_listener;
pub mod tracker;
pub mod trigger;

pub use controller::{TaskController, TaskStatusSummary};
pub use cron_utils::{CronExpression, CronSchema};
pub use recovery_service::{RecoveryReport, RecoveryService};
pub use scheduler::{DispatchSummary, JobInfo, ReconcileReport, StoreHealth, TaskScheduler};
pub use state_listener::StateListener;
pub use tracker::{ExecutionTracker, RunningExecution, StartedExecution};
pub use trigger::{FireDecision, TriggerResolver};
