use async_trait::async_trait;
use scheduler_core::{ExecutionRepository, ExecutionStatus, SchedulerResult, TaskExecution};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument, warn};

use crate::database::with_transaction;
use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

const SELECT_COLUMNS: &str = "SELECT id, task_id, task_name, status, start_time, end_time, duration, exit_code, output, error, runner_pid, created_at FROM task_executions";

pub struct SqliteExecutionRepository {
    pool: SqlitePool,
}

impl SqliteExecutionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn ctx(operation: RepositoryOperation) -> OperationContext {
        OperationContext::new(operation, EntityKind::Execution)
    }

    fn row_to_execution(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<TaskExecution> {
        Ok(TaskExecution {
            id: row.try_get("id")?,
            task_id: row.try_get("task_id")?,
            task_name: row.try_get("task_name")?,
            status: row.try_get("status")?,
            start_time: row.try_get("start_time")?,
            end_time: row.try_get("end_time")?,
            duration: row.try_get("duration")?,
            exit_code: row.try_get("exit_code")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            runner_pid: row.try_get("runner_pid")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

#[async_trait]
impl ExecutionRepository for SqliteExecutionRepository {
    #[instrument(skip(self, execution), fields(
        execution_id = %execution.id,
        task_id = %execution.task_id,
        status = %execution.status,
    ))]
    async fn create(&self, execution: &TaskExecution) -> SchedulerResult<()> {
        let context = Self::ctx(RepositoryOperation::Create).with_id(&execution.id);
        sqlx::query(
            r#"
            INSERT INTO task_executions
                (id, task_id, task_name, status, start_time, end_time, duration, exit_code, output, error, runner_pid, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(&execution.task_name)
        .bind(execution.status)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.duration)
        .bind(execution.exit_code)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(execution.runner_pid)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        RepositoryErrorHelpers::log_operation_success(&context, Some(execution.status.as_str()));
        Ok(())
    }

    #[instrument(skip(self, execution), fields(
        execution_id = %execution.id,
        task_id = %execution.task_id,
    ))]
    async fn start(&self, execution: &TaskExecution) -> SchedulerResult<bool> {
        let context = Self::ctx(RepositoryOperation::Create).with_id(&execution.id);
        let inserted = sqlx::query(
            r#"
            INSERT INTO task_executions
                (id, task_id, task_name, status, start_time, end_time, duration, exit_code, output, error, runner_pid, created_at)
            SELECT $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12
            WHERE NOT EXISTS (
                SELECT 1 FROM task_executions
                WHERE task_id = $2 AND status IN ('pending', 'running')
            )
            "#,
        )
        .bind(&execution.id)
        .bind(&execution.task_id)
        .bind(&execution.task_name)
        .bind(execution.status)
        .bind(execution.start_time)
        .bind(execution.end_time)
        .bind(execution.duration)
        .bind(execution.exit_code)
        .bind(&execution.output)
        .bind(&execution.error)
        .bind(execution.runner_pid)
        .bind(execution.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        if inserted.rows_affected() == 0 {
            debug!(task_id = %execution.task_id, "任务已有运行中的执行记录，未插入");
            return Ok(false);
        }
        RepositoryErrorHelpers::log_operation_success(&context, Some(execution.status.as_str()));
        Ok(true)
    }

    #[instrument(skip(self), fields(execution_id = %id))]
    async fn get(&self, id: &str) -> SchedulerResult<Option<TaskExecution>> {
        let context = Self::ctx(RepositoryOperation::Read).with_id(id);
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        row.as_ref().map(Self::row_to_execution).transpose()
    }

    #[instrument(skip(self, execution), fields(
        execution_id = %execution.id,
        task_id = %execution.task_id,
        status = %execution.status,
    ))]
    async fn finish(&self, execution: &TaskExecution) -> SchedulerResult<bool> {
        let execution = execution.clone();
        let succeeded = execution.status.counts_as_success();

        with_transaction(&self.pool, |conn| {
            Box::pin(async move {
                let context = Self::ctx(RepositoryOperation::Update).with_id(&execution.id);
                let updated = sqlx::query(
                    r#"
                    UPDATE task_executions
                    SET status = $2, end_time = $3, duration = $4, exit_code = $5, output = $6, error = $7
                    WHERE id = $1 AND status IN ('pending', 'running')
                    "#,
                )
                .bind(&execution.id)
                .bind(execution.status)
                .bind(execution.end_time)
                .bind(execution.duration)
                .bind(execution.exit_code)
                .bind(&execution.output)
                .bind(&execution.error)
                .execute(&mut *conn)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

                if updated.rows_affected() == 0 {
                    debug!(execution_id = %execution.id, "执行记录已是终态，忽略重复完成");
                    return Ok(false);
                }

                let counted = sqlx::query(
                    r#"
                    UPDATE tasks
                    SET run_count = run_count + 1,
                        success_count = success_count + $2,
                        failed_count = failed_count + $3
                    WHERE id = $1
                    "#,
                )
                .bind(&execution.task_id)
                .bind(i64::from(succeeded))
                .bind(i64::from(!succeeded))
                .execute(&mut *conn)
                .await
                .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

                if counted.rows_affected() == 0 {
                    warn!(task_id = %execution.task_id, "执行记录所属任务不存在，计数器未更新");
                }

                RepositoryErrorHelpers::log_operation_success(&context, Some(execution.status.as_str()));
                Ok(true)
            })
        })
        .await
    }

    #[instrument(skip(self), fields(task_id = %task_id))]
    async fn list_by_task(
        &self,
        task_id: &str,
        limit: i64,
        status: Option<ExecutionStatus>,
    ) -> SchedulerResult<Vec<TaskExecution>> {
        let context = Self::ctx(RepositoryOperation::Query);
        let mut sql = format!("{SELECT_COLUMNS} WHERE task_id = ?");
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        sql.push_str(" ORDER BY start_time DESC, created_at DESC LIMIT ?");

        let mut query = sqlx::query(&sql).bind(task_id);
        if let Some(status) = status {
            query = query.bind(status);
        }
        query = query.bind(limit);

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_execution).collect()
    }

    #[instrument(skip(self))]
    async fn list_running(&self) -> SchedulerResult<Vec<TaskExecution>> {
        let context = Self::ctx(RepositoryOperation::Query);
        let rows = sqlx::query(&format!(
            "{SELECT_COLUMNS} WHERE status IN ('pending', 'running') ORDER BY start_time ASC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_execution).collect()
    }
}
