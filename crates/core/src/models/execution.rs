use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Task;
use crate::{SchedulerError, SchedulerResult};

/// 任务执行记录
///
/// `task_name` 在执行开始时快照，任务后续改名不影响历史记录。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskExecution {
    pub id: String,
    pub task_id: String,
    pub task_name: String,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// 秒
    pub duration: Option<f64>,
    pub exit_code: Option<i32>,
    pub output: Option<String>,
    pub error: Option<String>,
    /// 创建该执行的调度器进程号，启动恢复时据此判断执行者是否仍然存活
    pub runner_pid: Option<i64>,
    pub created_at: DateTime<Utc>,
}

/// 执行状态
///
/// 状态机: `pending → running → {success, failed, timeout, cancelled}`。
/// `missed` 只由错过宽限期的一次性任务直接生成，同样是终态。
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
    Missed,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Pending => "pending",
            ExecutionStatus::Running => "running",
            ExecutionStatus::Success => "success",
            ExecutionStatus::Failed => "failed",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Cancelled => "cancelled",
            ExecutionStatus::Missed => "missed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Pending | ExecutionStatus::Running)
    }

    pub fn can_transition_to(&self, next: ExecutionStatus) -> bool {
        match self {
            ExecutionStatus::Pending => next != ExecutionStatus::Pending,
            ExecutionStatus::Running => {
                next.is_terminal() && next != ExecutionStatus::Missed
            }
            _ => false,
        }
    }

    /// 超时与取消在聚合计数中按失败计
    pub fn counts_as_success(&self) -> bool {
        matches!(self, ExecutionStatus::Success)
    }
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(ExecutionStatus::Pending),
            "running" => Ok(ExecutionStatus::Running),
            "success" => Ok(ExecutionStatus::Success),
            "failed" => Ok(ExecutionStatus::Failed),
            "timeout" => Ok(ExecutionStatus::Timeout),
            "cancelled" => Ok(ExecutionStatus::Cancelled),
            "missed" => Ok(ExecutionStatus::Missed),
            other => Err(SchedulerError::Serialization(format!(
                "无效的执行状态: {other}"
            ))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for ExecutionStatus {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for ExecutionStatus {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<ExecutionStatus>()
            .map_err(|_| format!("Invalid execution status: {s}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for ExecutionStatus {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 执行引擎返回的结果
///
/// 执行期失败（非零退出、超时、解释器崩溃）都体现在 `status` 中，
/// 不会作为错误向上传播。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub status: ExecutionStatus,
    pub exit_code: Option<i32>,
    pub output: String,
    pub error: Option<String>,
    /// 单调时钟测得的运行时长（秒）
    pub elapsed_seconds: f64,
}

impl ExecutionResult {
    pub fn from_exit(exit_code: Option<i32>, output: String, error: Option<String>, elapsed_seconds: f64) -> Self {
        let status = if exit_code == Some(0) {
            ExecutionStatus::Success
        } else {
            ExecutionStatus::Failed
        };
        Self {
            status,
            exit_code,
            output,
            error,
            elapsed_seconds,
        }
    }

    /// 进程未能启动时的失败结果
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Failed,
            exit_code: None,
            output: String::new(),
            error: Some(error.into()),
            elapsed_seconds: 0.0,
        }
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self {
            status: ExecutionStatus::Cancelled,
            exit_code: None,
            output: String::new(),
            error: Some(reason.into()),
            elapsed_seconds: 0.0,
        }
    }
}

impl TaskExecution {
    /// 开始一次执行，状态为 `running`
    pub fn start(task: &Task, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            status: ExecutionStatus::Running,
            start_time: now,
            end_time: None,
            duration: None,
            exit_code: None,
            output: None,
            error: None,
            runner_pid: Some(i64::from(std::process::id())),
            created_at: now,
        }
    }

    /// 错过宽限期的一次性任务记录，开始与结束时间都是原定触发时间
    pub fn missed(task: &Task, scheduled_time: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            task_name: task.name.clone(),
            status: ExecutionStatus::Missed,
            start_time: scheduled_time,
            end_time: Some(scheduled_time),
            duration: Some(0.0),
            exit_code: None,
            output: None,
            error: Some(format!(
                "错过执行时间 {}，已超过宽限期 (发现于 {})",
                scheduled_time.to_rfc3339(),
                now.to_rfc3339()
            )),
            runner_pid: None,
            created_at: now,
        }
    }

    /// 应用执行结果，转换到终态
    pub fn finish(&mut self, result: &ExecutionResult, now: DateTime<Utc>) -> SchedulerResult<()> {
        if !self.status.can_transition_to(result.status) || !result.status.is_terminal() {
            return Err(SchedulerError::InvalidStatusTransition {
                from: self.status.to_string(),
                to: result.status.to_string(),
            });
        }

        let end_time = now.max(self.start_time);
        self.status = result.status;
        self.end_time = Some(end_time);
        self.duration = Some((end_time - self.start_time).num_milliseconds() as f64 / 1000.0);
        self.exit_code = result.exit_code;
        self.output = Some(result.output.clone());
        self.error = result.error.clone();
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(self.status, ExecutionStatus::Pending | ExecutionStatus::Running)
    }
}
