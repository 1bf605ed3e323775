#[cfg(test)]
mod trigger_tests {
    use chrono::{DateTime, Duration, TimeZone, Utc};

    use scheduler_core::{ScheduleTimezone, ScheduledJob, SchedulerError, Trigger};
    use scheduler_dispatcher::trigger::{FireDecision, TriggerResolver};

    const GRACE: u64 = 300;

    fn resolver() -> TriggerResolver {
        TriggerResolver::new(ScheduleTimezone::Utc, GRACE)
    }

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, s).unwrap()
    }

    #[test]
    fn test_cron_noon_from_creation_time() {
        let trigger = Trigger::Cron {
            expression: "0 12 * * *".to_string(),
        };
        let next = resolver().first_run_time(&trigger, at(0, 0, 0)).unwrap();
        assert_eq!(next, Some(at(12, 0, 0)));
    }

    #[test]
    fn test_interval_is_exact_and_repeatable() {
        let trigger = Trigger::Interval { seconds: 5 };
        let after = at(8, 0, 0) + Duration::microseconds(250_001);

        let first = resolver().next_run_time(&trigger, after).unwrap();
        let again = resolver().next_run_time(&trigger, after).unwrap();
        assert_eq!(first, Some(after + Duration::seconds(5)));
        assert_eq!(first, again);

        let mut cursor = after;
        for _ in 0..1000 {
            let next = resolver().next_run_time(&trigger, cursor).unwrap().unwrap();
            assert_eq!(next - cursor, Duration::seconds(5));
            cursor = next;
        }
    }

    #[test]
    fn test_invalid_trigger_parameters() {
        assert!(matches!(
            resolver().next_run_time(&Trigger::Interval { seconds: 0 }, at(0, 0, 0)),
            Err(SchedulerError::InvalidTriggerParameter(_))
        ));
        assert!(matches!(
            TriggerResolver::validate(&Trigger::Cron {
                expression: "* * *".to_string()
            }),
            Err(SchedulerError::InvalidCronExpression { .. })
        ));
    }

    #[test]
    fn test_date_is_one_shot() {
        let run_at = at(9, 0, 0);
        let trigger = Trigger::Date { run_at };

        assert_eq!(
            resolver().next_run_time(&trigger, at(8, 0, 0)).unwrap(),
            Some(run_at)
        );
        assert_eq!(resolver().next_run_time(&trigger, run_at).unwrap(), None);
        assert_eq!(resolver().next_run_time(&trigger, at(10, 0, 0)).unwrap(), None);
    }

    #[test]
    fn test_late_within_grace_fires_once() {
        let scheduled = at(12, 0, 0);
        let job = ScheduledJob::new(
            "t",
            Trigger::Cron {
                expression: "* * * * *".to_string(),
            },
            scheduled,
        );
        let now = scheduled + Duration::seconds(GRACE as i64);

        assert_eq!(
            resolver().classify(&job, now).unwrap(),
            FireDecision::Fire {
                scheduled_time: scheduled,
                next_run_time: Some(at(12, 6, 0)),
            }
        );
    }

    #[test]
    fn test_misfire_beyond_grace_skips_to_future() {
        let scheduled = at(12, 0, 0);
        let now = scheduled + Duration::seconds(GRACE as i64 + 1);

        let interval = ScheduledJob::new("i", Trigger::Interval { seconds: 60 }, scheduled);
        match resolver().classify(&interval, now).unwrap() {
            FireDecision::Misfire {
                next_run_time,
                late_seconds,
                ..
            } => {
                let next = next_run_time.unwrap();
                assert!(next > now);
                assert_eq!((next - scheduled).num_seconds() % 60, 0);
                assert_eq!(late_seconds, GRACE as i64 + 1);
            }
            other => panic!("expected misfire, got {other:?}"),
        }

        let cron = ScheduledJob::new(
            "c",
            Trigger::Cron {
                expression: "0 12 * * *".to_string(),
            },
            scheduled,
        );
        match resolver().classify(&cron, now).unwrap() {
            FireDecision::Misfire { next_run_time, .. } => {
                assert_eq!(next_run_time, Some(scheduled + Duration::days(1)));
            }
            other => panic!("expected misfire, got {other:?}"),
        }
    }

    #[test]
    fn test_date_misfire_is_final() {
        let scheduled = at(6, 0, 0);
        let job = ScheduledJob::new("d", Trigger::Date { run_at: scheduled }, scheduled);
        let now = scheduled + Duration::hours(1);

        assert!(matches!(
            resolver().classify(&job, now).unwrap(),
            FireDecision::Misfire {
                next_run_time: None,
                ..
            }
        ));
    }

    #[test]
    fn test_not_due() {
        let job = ScheduledJob::new("t", Trigger::Interval { seconds: 10 }, at(12, 0, 10));
        assert_eq!(
            resolver().classify(&job, at(12, 0, 9)).unwrap(),
            FireDecision::NotDue
        );
    }
}
