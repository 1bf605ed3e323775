//! Metrics collector for the script scheduler
//!
//! Thin wrapper over the `metrics` facade. Without an installed recorder every
//! call is a no-op, so components can hold a collector unconditionally.

use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

pub struct MetricsCollector {
    jobs_fired_total: Counter,
    jobs_misfired_total: Counter,
    job_store_failures_total: Counter,
    executions_in_flight: Gauge,
    scheduled_jobs: Gauge,
    execution_duration: Histogram,
    dispatch_loop_duration: Histogram,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_fired_total: counter!("scheduler_jobs_fired_total"),
            jobs_misfired_total: counter!("scheduler_jobs_misfired_total"),
            job_store_failures_total: counter!("scheduler_job_store_failures_total"),
            executions_in_flight: gauge!("scheduler_executions_in_flight"),
            scheduled_jobs: gauge!("scheduler_scheduled_jobs"),
            execution_duration: histogram!("scheduler_execution_duration_seconds"),
            dispatch_loop_duration: histogram!("scheduler_dispatch_loop_duration_seconds"),
        }
    }

    pub fn record_job_fired(&self) {
        self.jobs_fired_total.increment(1);
    }

    /// `reason` is a short machine label such as `still_running` or `halted`.
    pub fn record_job_skipped(&self, reason: &'static str) {
        counter!("scheduler_jobs_skipped_total", "reason" => reason).increment(1);
    }

    pub fn record_job_misfired(&self) {
        self.jobs_misfired_total.increment(1);
    }

    pub fn record_job_store_failure(&self) {
        self.job_store_failures_total.increment(1);
    }

    pub fn record_execution_finished(&self, status: &str, duration_seconds: f64) {
        counter!("scheduler_executions_total", "status" => status.to_string()).increment(1);
        self.execution_duration.record(duration_seconds);
    }

    pub fn record_spawn_retry(&self) {
        counter!("scheduler_spawn_retries_total").increment(1);
    }

    pub fn update_executions_in_flight(&self, count: usize) {
        self.executions_in_flight.set(count as f64);
    }

    pub fn update_scheduled_jobs(&self, count: usize) {
        self.scheduled_jobs.set(count as f64);
    }

    pub fn record_dispatch_loop_duration(&self, duration_seconds: f64) {
        self.dispatch_loop_duration.record(duration_seconds);
    }
}
