//! 触发时间计算
//!
//! [`TriggerResolver`] 是纯计算组件：给定触发器与参考时间，求下一次触发时间，
//! 并按错过宽限期对到期的调度记录分类。

use chrono::{DateTime, Duration, Local, Utc};

use scheduler_core::{
    ScheduleTimezone, ScheduledJob, SchedulerConfig, SchedulerError, SchedulerResult, Trigger,
};

use crate::cron_utils::CronExpression;

/// 到期调度记录的处理决定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FireDecision {
    NotDue,
    /// 到期（或迟到但仍在宽限期内），立即触发一次
    Fire {
        scheduled_time: DateTime<Utc>,
        next_run_time: Option<DateTime<Utc>>,
    },
    /// 超出宽限期：cron/interval 跳到下一个未来时间点，date 永久错过
    Misfire {
        scheduled_time: DateTime<Utc>,
        next_run_time: Option<DateTime<Utc>>,
        late_seconds: i64,
    },
}

#[derive(Debug, Clone)]
pub struct TriggerResolver {
    timezone: ScheduleTimezone,
    misfire_grace: Duration,
}

impl TriggerResolver {
    pub fn new(timezone: ScheduleTimezone, misfire_grace_time_seconds: u64) -> Self {
        Self {
            timezone,
            misfire_grace: Duration::seconds(misfire_grace_time_seconds as i64),
        }
    }

    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self::new(config.timezone, config.misfire_grace_time_seconds)
    }

    /// 校验触发器参数，不做任何时间计算
    pub fn validate(trigger: &Trigger) -> SchedulerResult<()> {
        match trigger {
            Trigger::Cron { expression } => CronExpression::validate(expression),
            Trigger::Interval { seconds } => interval_step(*seconds).map(|_| ()),
            Trigger::Date { .. } => Ok(()),
        }
    }

    /// 严格晚于 `after` 的下一次触发时间，触发器已耗尽时返回 `None`
    pub fn next_run_time(
        &self,
        trigger: &Trigger,
        after: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match trigger {
            Trigger::Cron { expression } => {
                let cron = CronExpression::parse(expression)?;
                Ok(match self.timezone {
                    ScheduleTimezone::Utc => cron.next_after(&after),
                    ScheduleTimezone::Local => cron
                        .next_after(&after.with_timezone(&Local))
                        .map(|next| next.with_timezone(&Utc)),
                })
            }
            Trigger::Interval { seconds } => Ok(Some(after + interval_step(*seconds)?)),
            Trigger::Date { run_at } => Ok((*run_at > after).then_some(*run_at)),
        }
    }

    /// 新建调度记录时的首次触发时间
    ///
    /// 一次性任务总是返回其设定时间，即使已经过去；是否仍在宽限期内由
    /// [`classify`](Self::classify) 在调度循环中决定。
    pub fn first_run_time(
        &self,
        trigger: &Trigger,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match trigger {
            Trigger::Date { run_at } => Ok(Some(*run_at)),
            _ => self.next_run_time(trigger, now),
        }
    }

    /// 对一条调度记录在 `now` 时刻的状态分类
    pub fn classify(&self, job: &ScheduledJob, now: DateTime<Utc>) -> SchedulerResult<FireDecision> {
        let scheduled_time = job.next_run_time;
        if scheduled_time > now {
            return Ok(FireDecision::NotDue);
        }

        let next_run_time = self.next_future(job.trigger(), scheduled_time, now)?;
        let late = now - scheduled_time;

        if late > self.misfire_grace {
            Ok(FireDecision::Misfire {
                scheduled_time,
                next_run_time,
                late_seconds: late.num_seconds(),
            })
        } else {
            Ok(FireDecision::Fire {
                scheduled_time,
                next_run_time,
            })
        }
    }

    /// 以 `scheduled` 为锚点、严格晚于 `now` 的下一次触发时间
    ///
    /// 间隔触发保持 `scheduled + k * interval` 的相位，不会因迟到而漂移；
    /// 迟到多个周期时只保留一次触发。
    fn next_future(
        &self,
        trigger: &Trigger,
        scheduled: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<DateTime<Utc>>> {
        match trigger {
            Trigger::Interval { seconds } => {
                let step = interval_step(*seconds)?;
                let step_ms = step.num_milliseconds();
                let elapsed_ms = (now - scheduled).num_milliseconds().max(0);
                let periods = elapsed_ms / step_ms + 1;
                Ok(Some(scheduled + Duration::milliseconds(step_ms * periods)))
            }
            Trigger::Cron { .. } => self.next_run_time(trigger, now.max(scheduled)),
            Trigger::Date { .. } => Ok(None),
        }
    }
}

fn interval_step(seconds: u64) -> SchedulerResult<Duration> {
    if seconds < 1 || seconds > i64::MAX as u64 / 1000 {
        return Err(SchedulerError::InvalidTriggerParameter(format!(
            "间隔秒数必须大于等于1，实际为 {seconds}"
        )));
    }
    Ok(Duration::seconds(seconds as i64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn resolver() -> TriggerResolver {
        TriggerResolver::new(ScheduleTimezone::Utc, 300)
    }

    #[test]
    fn test_zero_interval_rejected() {
        let result = TriggerResolver::validate(&Trigger::Interval { seconds: 0 });
        assert!(matches!(
            result,
            Err(SchedulerError::InvalidTriggerParameter(_))
        ));
    }

    #[test]
    fn test_interval_keeps_phase_after_late_fire() {
        let scheduled = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let job = ScheduledJob::new("t", Trigger::Interval { seconds: 10 }, scheduled);
        let now = scheduled + Duration::seconds(25);

        match resolver().classify(&job, now).unwrap() {
            FireDecision::Fire { next_run_time, .. } => {
                assert_eq!(next_run_time, Some(scheduled + Duration::seconds(30)));
            }
            other => panic!("unexpected decision: {other:?}"),
        }
    }
}
