//! Structured logging utilities
//!
//! Canonical lifecycle events for jobs and executions. Every event carries an
//! `event` field so log pipelines can filter on it regardless of message text.

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};

pub struct StructuredLogger;

impl StructuredLogger {
    pub fn log_job_scheduled(task_id: &str, trigger: &str, next_run_time: DateTime<Utc>) {
        info!(
            event = "job_scheduled",
            task.id = task_id,
            task.trigger = trigger,
            job.next_run_time = %next_run_time,
            "Job scheduled"
        );
    }

    pub fn log_job_fired(task_id: &str, execution_id: &str, scheduled_time: DateTime<Utc>) {
        info!(
            event = "job_fired",
            task.id = task_id,
            execution.id = execution_id,
            job.scheduled_time = %scheduled_time,
            "Job fired"
        );
    }

    pub fn log_job_skipped(task_id: &str, reason: &str) {
        warn!(
            event = "job_skipped",
            task.id = task_id,
            skip.reason = reason,
            "Job firing skipped"
        );
    }

    pub fn log_job_misfired(task_id: &str, scheduled_time: DateTime<Utc>, late_seconds: i64) {
        warn!(
            event = "job_misfired",
            task.id = task_id,
            job.scheduled_time = %scheduled_time,
            job.late_seconds = late_seconds,
            "Job missed its grace window"
        );
    }

    pub fn log_execution_started(execution_id: &str, task_id: &str, task_name: &str, script: &str) {
        info!(
            event = "execution_started",
            execution.id = execution_id,
            task.id = task_id,
            task.name = task_name,
            task.script = script,
            "Execution started"
        );
    }

    pub fn log_execution_finished(
        execution_id: &str,
        task_id: &str,
        status: &str,
        exit_code: Option<i32>,
        duration_seconds: f64,
        error_message: Option<&str>,
    ) {
        if status == "success" {
            info!(
                event = "execution_finished",
                execution.id = execution_id,
                task.id = task_id,
                execution.status = status,
                execution.exit_code = ?exit_code,
                execution.duration_seconds = duration_seconds,
                "Execution finished"
            );
        } else {
            error!(
                event = "execution_finished",
                execution.id = execution_id,
                task.id = task_id,
                execution.status = status,
                execution.exit_code = ?exit_code,
                execution.duration_seconds = duration_seconds,
                execution.error = error_message.unwrap_or("unknown error"),
                "Execution did not succeed"
            );
        }
    }

    pub fn log_persistence_failure(operation: &str, task_id: &str, error_message: &str) {
        error!(
            event = "job_store_failure",
            store.operation = operation,
            task.id = task_id,
            error = error_message,
            "Job store write failed"
        );
    }
}
