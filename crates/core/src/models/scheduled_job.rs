use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::Trigger;
use crate::{SchedulerError, SchedulerResult};

/// 调度记录的持久化状态
///
/// 以JSON形式保存在 `scheduled_jobs.job_state` 列中，足以在重启后
/// 无需访问任务注册表即可重建下一次触发时间。
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobState {
    pub trigger: Trigger,
    pub previous_fire_time: Option<DateTime<Utc>>,
}

/// 调度记录
///
/// `id` 与任务ID相同，每个任务最多一条记录。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduledJob {
    pub id: String,
    pub next_run_time: DateTime<Utc>,
    pub state: JobState,
}

impl ScheduledJob {
    pub fn new(task_id: impl Into<String>, trigger: Trigger, next_run_time: DateTime<Utc>) -> Self {
        Self {
            id: task_id.into(),
            next_run_time,
            state: JobState {
                trigger,
                previous_fire_time: None,
            },
        }
    }

    pub fn trigger(&self) -> &Trigger {
        &self.state.trigger
    }

    /// 记录一次触发并推进到下一次触发时间
    pub fn advance(&mut self, fired_at: DateTime<Utc>, next_run_time: DateTime<Utc>) {
        self.state.previous_fire_time = Some(fired_at);
        self.next_run_time = next_run_time;
    }

    pub fn encode_state(&self) -> SchedulerResult<Vec<u8>> {
        Ok(serde_json::to_vec(&self.state)?)
    }

    pub fn decode_state(bytes: &[u8]) -> SchedulerResult<JobState> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// 微秒精度的时间戳，用于按触发时间建立索引
    pub fn next_run_time_micros(&self) -> i64 {
        self.next_run_time.timestamp_micros()
    }

    pub fn from_row(id: String, next_run_micros: i64, state: &[u8]) -> SchedulerResult<Self> {
        let next_run_time = micros_to_datetime(next_run_micros)?;
        Ok(Self {
            id,
            next_run_time,
            state: Self::decode_state(state)?,
        })
    }
}

pub fn micros_to_datetime(micros: i64) -> SchedulerResult<DateTime<Utc>> {
    Utc.timestamp_micros(micros).single().ok_or_else(|| {
        SchedulerError::Serialization(format!("无效的时间戳(微秒): {micros}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_survives_encoding() {
        let next = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut job = ScheduledJob::new(
            "task-1",
            Trigger::Cron {
                expression: "0 12 * * *".to_string(),
            },
            next,
        );
        job.advance(next, next + chrono::Duration::days(1));

        let bytes = job.encode_state().unwrap();
        let restored =
            ScheduledJob::from_row(job.id.clone(), job.next_run_time_micros(), &bytes).unwrap();
        assert_eq!(restored, job);
        assert_eq!(restored.state.previous_fire_time, Some(next));
    }

    #[test]
    fn test_corrupt_state_is_serialization_error() {
        let result = ScheduledJob::from_row("x".to_string(), 0, b"not json");
        assert!(matches!(result, Err(SchedulerError::Serialization(_))));
    }
}
