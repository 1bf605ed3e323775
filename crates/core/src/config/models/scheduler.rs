use serde::{Deserialize, Serialize};

/// 调度时区：cron 表达式在该时区下求值
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ScheduleTimezone {
    #[default]
    Utc,
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// 超过该宽限期的过期触发被视为错过
    pub misfire_grace_time_seconds: u64,
    /// 调度循环最长空闲睡眠时间
    pub max_idle_seconds: u64,
    /// 与任务注册表的周期性对账间隔，0 表示关闭
    pub reconcile_interval_seconds: u64,
    pub persistence_retry_attempts: u32,
    pub persistence_retry_backoff_ms: u64,
    /// 连续持久化失败达到该次数后停止接受调度变更
    pub persistence_failure_threshold: u32,
    pub dispatch_channel_capacity: usize,
    pub timezone: ScheduleTimezone,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            misfire_grace_time_seconds: 300,
            max_idle_seconds: 60,
            reconcile_interval_seconds: 30,
            persistence_retry_attempts: 3,
            persistence_retry_backoff_ms: 100,
            persistence_failure_threshold: 3,
            dispatch_channel_capacity: 1024,
            timezone: ScheduleTimezone::Utc,
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_idle_seconds == 0 {
            return Err(anyhow::anyhow!("最大空闲时间必须大于0"));
        }

        if self.persistence_retry_attempts == 0 {
            return Err(anyhow::anyhow!("持久化重试次数必须大于0"));
        }

        if self.persistence_failure_threshold == 0 {
            return Err(anyhow::anyhow!("持久化失败阈值必须大于0"));
        }

        if self.dispatch_channel_capacity == 0 {
            return Err(anyhow::anyhow!("调度通道容量必须大于0"));
        }

        Ok(())
    }
}
