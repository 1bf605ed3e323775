use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use scheduler_core::{SchedulerError, SchedulerResult, Task, TaskFilter, TaskRegistry};
use sqlx::{Row, SqlitePool};
use tracing::{debug, instrument};

use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

const SELECT_COLUMNS: &str = "SELECT id, name, script_path, trigger_type, cron_expression, interval_seconds, scheduled_time, arguments, working_directory, environment, timeout_seconds, enabled, deleted, description, run_count, success_count, failed_count, created_at, updated_at FROM tasks";

/// 基于 `tasks` 表的任务注册表
///
/// 计数器列只由执行记录存储写入，`update` 不会修改。
pub struct SqliteTaskRegistry {
    pool: SqlitePool,
}

impl SqliteTaskRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn ctx(operation: RepositoryOperation) -> OperationContext {
        OperationContext::new(operation, EntityKind::Task)
    }

    fn row_to_task(row: &sqlx::sqlite::SqliteRow) -> SchedulerResult<Task> {
        let arguments: String = row.try_get("arguments")?;
        let environment: String = row.try_get("environment")?;
        let timeout_seconds: i64 = row.try_get("timeout_seconds")?;

        Ok(Task {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            script_path: row.try_get("script_path")?,
            trigger_type: row.try_get("trigger_type")?,
            cron_expression: row.try_get("cron_expression")?,
            interval_seconds: row.try_get("interval_seconds")?,
            scheduled_time: row.try_get("scheduled_time")?,
            arguments: serde_json::from_str::<Vec<String>>(&arguments)?,
            working_directory: row.try_get("working_directory")?,
            environment: serde_json::from_str::<HashMap<String, String>>(&environment)?,
            timeout_seconds: timeout_seconds.max(0) as u64,
            enabled: row.try_get("enabled")?,
            deleted: row.try_get("deleted")?,
            description: row.try_get("description")?,
            run_count: row.try_get("run_count")?,
            success_count: row.try_get("success_count")?,
            failed_count: row.try_get("failed_count")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }

    async fn set_flag(&self, id: &str, column: &str, value: bool) -> SchedulerResult<()> {
        let context = Self::ctx(RepositoryOperation::Update).with_id(id);
        let result = sqlx::query(&format!(
            "UPDATE tasks SET {column} = $2, updated_at = $3 WHERE id = $1"
        ))
        .bind(id)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryErrorHelpers::not_found(context));
        }
        RepositoryErrorHelpers::log_operation_success(&context, Some(&format!("{column} = {value}")));
        Ok(())
    }

    async fn fetch(&self, id: &str) -> SchedulerResult<Task> {
        self.get(id).await?.ok_or_else(|| SchedulerError::TaskNotFound {
            id: id.to_string(),
        })
    }
}

#[async_trait]
impl TaskRegistry for SqliteTaskRegistry {
    #[instrument(skip(self), fields(task_id = %id))]
    async fn get(&self, id: &str) -> SchedulerResult<Option<Task>> {
        let context = Self::ctx(RepositoryOperation::Read).with_id(id);
        let row = sqlx::query(&format!("{SELECT_COLUMNS} WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        match row {
            Some(row) => {
                let task = Self::row_to_task(&row)?;
                debug!("查询任务成功: ID {}, 名称: {}", task.id, task.name);
                Ok(Some(task))
            }
            None => {
                debug!("查询任务不存在: ID {}", id);
                Ok(None)
            }
        }
    }

    #[instrument(skip(self, filter), fields(
        keyword = ?filter.keyword,
        enabled = ?filter.enabled,
        include_deleted = filter.include_deleted,
        limit = ?filter.limit,
    ))]
    async fn list(&self, filter: &TaskFilter) -> SchedulerResult<Vec<Task>> {
        let context = Self::ctx(RepositoryOperation::Query);

        let mut sql = format!("{SELECT_COLUMNS} WHERE 1=1");
        if !filter.include_deleted {
            sql.push_str(" AND deleted = 0");
        }
        if filter.enabled.is_some() {
            sql.push_str(" AND enabled = ?");
        }
        if filter.keyword.is_some() {
            sql.push_str(" AND (name LIKE ? OR description LIKE ?)");
        }
        sql.push_str(" ORDER BY created_at DESC");
        if filter.limit.is_some() || filter.offset.is_some() {
            sql.push_str(" LIMIT ? OFFSET ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(enabled) = filter.enabled {
            query = query.bind(enabled);
        }
        if let Some(keyword) = &filter.keyword {
            let pattern = format!("%{keyword}%");
            query = query.bind(pattern.clone()).bind(pattern);
        }
        if filter.limit.is_some() || filter.offset.is_some() {
            query = query
                .bind(filter.limit.unwrap_or(-1))
                .bind(filter.offset.unwrap_or(0));
        }

        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::database_error(context, e))?;

        rows.iter().map(Self::row_to_task).collect()
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_name = %task.name))]
    async fn create(&self, task: &Task) -> SchedulerResult<Task> {
        let context = Self::ctx(RepositoryOperation::Create).with_id(&task.id);
        let arguments = serde_json::to_string(&task.arguments)?;
        let environment = serde_json::to_string(&task.environment)?;

        sqlx::query(
            r#"
            INSERT INTO tasks (id, name, script_path, trigger_type, cron_expression, interval_seconds,
                scheduled_time, arguments, working_directory, environment, timeout_seconds, enabled,
                deleted, description, run_count, success_count, failed_count, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19)
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.script_path)
        .bind(task.trigger_type)
        .bind(&task.cron_expression)
        .bind(task.interval_seconds)
        .bind(task.scheduled_time)
        .bind(arguments)
        .bind(&task.working_directory)
        .bind(environment)
        .bind(task.timeout_seconds as i64)
        .bind(task.enabled)
        .bind(task.deleted)
        .bind(&task.description)
        .bind(task.run_count)
        .bind(task.success_count)
        .bind(task.failed_count)
        .bind(task.created_at)
        .bind(task.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        RepositoryErrorHelpers::log_operation_success(&context, Some(&task.name));
        self.fetch(&task.id).await
    }

    #[instrument(skip(self, task), fields(task_id = %task.id, task_name = %task.name))]
    async fn update(&self, task: &Task) -> SchedulerResult<Task> {
        let context = Self::ctx(RepositoryOperation::Update).with_id(&task.id);
        let arguments = serde_json::to_string(&task.arguments)?;
        let environment = serde_json::to_string(&task.environment)?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET name = $2, script_path = $3, trigger_type = $4, cron_expression = $5,
                interval_seconds = $6, scheduled_time = $7, arguments = $8, working_directory = $9,
                environment = $10, timeout_seconds = $11, enabled = $12, description = $13,
                updated_at = $14
            WHERE id = $1
            "#,
        )
        .bind(&task.id)
        .bind(&task.name)
        .bind(&task.script_path)
        .bind(task.trigger_type)
        .bind(&task.cron_expression)
        .bind(task.interval_seconds)
        .bind(task.scheduled_time)
        .bind(arguments)
        .bind(&task.working_directory)
        .bind(environment)
        .bind(task.timeout_seconds as i64)
        .bind(task.enabled)
        .bind(&task.description)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::database_error(context.clone(), e))?;

        if result.rows_affected() == 0 {
            return Err(RepositoryErrorHelpers::not_found(context));
        }

        RepositoryErrorHelpers::log_operation_success(&context, Some(&task.name));
        self.fetch(&task.id).await
    }

    async fn soft_delete(&self, id: &str) -> SchedulerResult<()> {
        self.set_flag(id, "deleted", true).await
    }

    async fn restore(&self, id: &str) -> SchedulerResult<()> {
        self.set_flag(id, "deleted", false).await
    }

    async fn set_enabled(&self, id: &str, enabled: bool) -> SchedulerResult<()> {
        self.set_flag(id, "enabled", enabled).await
    }
}
