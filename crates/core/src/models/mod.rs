//! # 数据模型
//!
//! 调度核心使用的数据结构：
//!
//! - [`Task`] - 外部任务注册表中的任务定义，调度核心只读消费
//! - [`Trigger`] - 由任务触发器字段合成的 cron / interval / date 规格
//! - [`ScheduledJob`] - 调度核心独占的持久化调度记录，与已启用任务一一对应
//! - [`TaskExecution`] - 执行追踪器独占的单次执行记录
//! - [`TaskExecutionMessage`] / [`ExecutionCompletedMessage`] - 调度循环、工作池与
//!   执行追踪器之间的通道消息
//!
//! 所有时间字段使用 `DateTime<Utc>`；cron 在配置的时区下求值后再换算为UTC。
//!
//! ## 执行状态流转
//!
//! ```text
//! pending → running → success
//!                   → failed
//!                   → timeout
//!                   → cancelled
//! (一次性任务错过宽限期) → missed
//! ```

pub mod execution;
pub mod message;
pub mod scheduled_job;
pub mod task;

pub use execution::*;
pub use message::*;
pub use scheduled_job::*;
pub use task::*;
