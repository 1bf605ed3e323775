//! Test data builders for creating test entities
//!
//! Builders start from sensible defaults (an enabled interval task running
//! `echo_ok.sh` every 60 seconds) and expose one method per field tests tend to vary.

use chrono::{DateTime, Utc};
use scheduler_core::{ExecutionResult, ExecutionStatus, Task, Trigger};

pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn new() -> Self {
        Self {
            task: Task::new(
                "test_task".to_string(),
                "echo_ok.sh".to_string(),
                Trigger::Interval { seconds: 60 },
            ),
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.task.id = id.to_string();
        self
    }

    pub fn with_name(mut self, name: &str) -> Self {
        self.task.name = name.to_string();
        self
    }

    pub fn with_script(mut self, script_path: &str) -> Self {
        self.task.script_path = script_path.to_string();
        self
    }

    pub fn with_cron(mut self, expression: &str) -> Self {
        self.task.set_trigger(Trigger::Cron {
            expression: expression.to_string(),
        });
        self
    }

    pub fn with_interval(mut self, seconds: u64) -> Self {
        self.task.set_trigger(Trigger::Interval { seconds });
        self
    }

    pub fn with_date(mut self, run_at: DateTime<Utc>) -> Self {
        self.task.set_trigger(Trigger::Date { run_at });
        self
    }

    pub fn with_arguments(mut self, arguments: Vec<String>) -> Self {
        self.task.arguments = arguments;
        self
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.task.environment.insert(key.to_string(), value.to_string());
        self
    }

    pub fn with_working_directory(mut self, dir: &str) -> Self {
        self.task.working_directory = Some(dir.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout_seconds: u64) -> Self {
        self.task.timeout_seconds = timeout_seconds;
        self
    }

    pub fn with_description(mut self, description: &str) -> Self {
        self.task.description = Some(description.to_string());
        self
    }

    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.task.created_at = created_at;
        self.task.updated_at = created_at;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.task.enabled = false;
        self
    }

    pub fn deleted(mut self) -> Self {
        self.task.deleted = true;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

impl Default for TaskBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ExecutionResultBuilder {
    result: ExecutionResult,
}

impl ExecutionResultBuilder {
    pub fn success() -> Self {
        Self {
            result: ExecutionResult::from_exit(Some(0), String::new(), None, 0.0),
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            result: ExecutionResult::from_exit(Some(exit_code), String::new(), None, 0.0),
        }
    }

    pub fn with_status(mut self, status: ExecutionStatus) -> Self {
        self.result.status = status;
        self
    }

    pub fn with_output(mut self, output: &str) -> Self {
        self.result.output = output.to_string();
        self
    }

    pub fn with_error(mut self, error: &str) -> Self {
        self.result.error = Some(error.to_string());
        self
    }

    pub fn build(self) -> ExecutionResult {
        self.result
    }
}
