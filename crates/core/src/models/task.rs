use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{SchedulerError, SchedulerResult};

/// 默认任务超时时间（秒）
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 300;

/// 任务定义
///
/// 任务由外部任务注册表持有，调度核心只读消费。
///
/// # 字段说明
///
/// - `id`: 任务的唯一标识符（不透明字符串）
/// - `trigger_type`: 触发器类型，决定 `cron_expression` / `interval_seconds` /
///   `scheduled_time` 中哪一个字段生效
/// - `arguments`: 作为独立参数传递给脚本，不会拼接成shell字符串
/// - `environment`: 追加到继承的进程环境变量之上
/// - `run_count` / `success_count` / `failed_count`: 由执行追踪器维护的单调计数器
/// - `deleted`: 逻辑删除标记，已删除的任务永远不会被调度
///
/// # 使用示例
///
/// ```rust
/// use scheduler_core::models::{Task, Trigger};
///
/// let task = Task::new(
///     "数据备份".to_string(),
///     "backup.sh".to_string(),
///     Trigger::Cron { expression: "0 2 * * *".to_string() },
/// );
/// assert!(task.is_schedulable());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    pub name: String,
    pub script_path: String,
    pub trigger_type: TriggerType,
    pub cron_expression: Option<String>,
    pub interval_seconds: Option<i64>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub arguments: Vec<String>,
    pub working_directory: Option<String>,
    pub environment: HashMap<String, String>,
    pub timeout_seconds: u64,
    pub enabled: bool,
    pub deleted: bool,
    pub description: Option<String>,
    pub run_count: i64,
    pub success_count: i64,
    pub failed_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 触发器类型
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum TriggerType {
    Cron,
    Interval,
    Date,
}

impl TriggerType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerType::Cron => "cron",
            TriggerType::Interval => "interval",
            TriggerType::Date => "date",
        }
    }
}

impl fmt::Display for TriggerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TriggerType {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cron" => Ok(TriggerType::Cron),
            "interval" => Ok(TriggerType::Interval),
            "date" => Ok(TriggerType::Date),
            other => Err(SchedulerError::InvalidTriggerParameter(format!(
                "不支持的触发器类型: {other}"
            ))),
        }
    }
}

impl sqlx::Type<sqlx::Sqlite> for TriggerType {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <str as sqlx::Type<sqlx::Sqlite>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for TriggerType {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        s.parse::<TriggerType>()
            .map_err(|e| format!("Invalid trigger type: {e}").into())
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for TriggerType {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        <&str as sqlx::Encode<sqlx::Sqlite>>::encode(self.as_str(), buf)
    }
}

/// 触发器规格
///
/// 由 `Task` 的触发器类型与对应参数字段合成的标签变体，
/// 同时作为 `ScheduledJob` 持久化状态的一部分。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Trigger {
    Cron { expression: String },
    Interval { seconds: u64 },
    Date { run_at: DateTime<Utc> },
}

impl Trigger {
    pub fn trigger_type(&self) -> TriggerType {
        match self {
            Trigger::Cron { .. } => TriggerType::Cron,
            Trigger::Interval { .. } => TriggerType::Interval,
            Trigger::Date { .. } => TriggerType::Date,
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Cron { expression } => write!(f, "cron[{expression}]"),
            Trigger::Interval { seconds } => write!(f, "interval[{seconds}s]"),
            Trigger::Date { run_at } => write!(f, "date[{}]", run_at.to_rfc3339()),
        }
    }
}

/// 任务过滤器
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub keyword: Option<String>,
    pub enabled: Option<bool>,
    pub include_deleted: bool,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl TaskFilter {
    /// 调度器对账时使用：包含已删除任务，以便清理其调度记录
    pub fn all() -> Self {
        Self {
            include_deleted: true,
            ..Default::default()
        }
    }

    pub fn matches(&self, task: &Task) -> bool {
        if !self.include_deleted && task.deleted {
            return false;
        }
        if let Some(enabled) = self.enabled {
            if task.enabled != enabled {
                return false;
            }
        }
        if let Some(keyword) = &self.keyword {
            let keyword = keyword.to_lowercase();
            let in_name = task.name.to_lowercase().contains(&keyword);
            let in_description = task
                .description
                .as_deref()
                .map(|d| d.to_lowercase().contains(&keyword))
                .unwrap_or(false);
            if !in_name && !in_description {
                return false;
            }
        }
        true
    }
}

impl Task {
    /// 创建新任务
    pub fn new(name: String, script_path: String, trigger: Trigger) -> Self {
        let now = Utc::now();
        let mut task = Self {
            id: Uuid::new_v4().to_string(),
            name,
            script_path,
            trigger_type: trigger.trigger_type(),
            cron_expression: None,
            interval_seconds: None,
            scheduled_time: None,
            arguments: Vec::new(),
            working_directory: None,
            environment: HashMap::new(),
            timeout_seconds: DEFAULT_TIMEOUT_SECONDS,
            enabled: true,
            deleted: false,
            description: None,
            run_count: 0,
            success_count: 0,
            failed_count: 0,
            created_at: now,
            updated_at: now,
        };
        task.set_trigger(trigger);
        task
    }

    /// 根据触发器类型取出唯一生效的参数字段
    pub fn trigger(&self) -> SchedulerResult<Trigger> {
        match self.trigger_type {
            TriggerType::Cron => {
                let expression = self
                    .cron_expression
                    .as_deref()
                    .map(str::trim)
                    .filter(|e| !e.is_empty())
                    .ok_or_else(|| {
                        SchedulerError::InvalidTriggerParameter(format!(
                            "任务 {} 缺少cron表达式",
                            self.id
                        ))
                    })?;
                Ok(Trigger::Cron {
                    expression: expression.to_string(),
                })
            }
            TriggerType::Interval => {
                let seconds = self.interval_seconds.ok_or_else(|| {
                    SchedulerError::InvalidTriggerParameter(format!(
                        "任务 {} 缺少间隔秒数",
                        self.id
                    ))
                })?;
                if seconds < 1 {
                    return Err(SchedulerError::InvalidTriggerParameter(format!(
                        "间隔秒数必须大于等于1, 实际为 {seconds}"
                    )));
                }
                Ok(Trigger::Interval {
                    seconds: seconds as u64,
                })
            }
            TriggerType::Date => {
                let run_at = self.scheduled_time.ok_or_else(|| {
                    SchedulerError::InvalidTriggerParameter(format!(
                        "任务 {} 缺少执行时间",
                        self.id
                    ))
                })?;
                Ok(Trigger::Date { run_at })
            }
        }
    }

    /// 设置触发器，同时清空非生效的参数字段
    pub fn set_trigger(&mut self, trigger: Trigger) {
        self.trigger_type = trigger.trigger_type();
        self.cron_expression = None;
        self.interval_seconds = None;
        self.scheduled_time = None;
        match trigger {
            Trigger::Cron { expression } => self.cron_expression = Some(expression),
            Trigger::Interval { seconds } => self.interval_seconds = Some(seconds as i64),
            Trigger::Date { run_at } => self.scheduled_time = Some(run_at),
        }
    }

    /// 已启用且未删除的任务才可调度
    pub fn is_schedulable(&self) -> bool {
        self.enabled && !self.deleted
    }
}
