use async_trait::async_trait;
use scheduler_core::{JobStore, ScheduledJob, SchedulerResult};
use sqlx::{Row, SqlitePool};
use tracing::{debug, error, instrument};

use crate::error_handling::{
    EntityKind, OperationContext, RepositoryErrorHelpers, RepositoryOperation,
};

const UPSERT_JOB: &str = r#"
    INSERT INTO scheduled_jobs (id, next_run_time, job_state)
    VALUES ($1, $2, $3)
    ON CONFLICT(id) DO UPDATE SET
        next_run_time = excluded.next_run_time,
        job_state = excluded.job_state
"#;

/// 基于 `scheduled_jobs` 表的调度记录存储
///
/// `next_run_time` 以微秒整数保存，重新载入后得到完全相同的时刻。
pub struct SqliteJobStore {
    pool: SqlitePool,
}

impl SqliteJobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn ctx(operation: RepositoryOperation) -> OperationContext {
        OperationContext::new(operation, EntityKind::ScheduledJob)
    }

    fn rows_to_jobs(rows: Vec<sqlx::sqlite::SqliteRow>) -> SchedulerResult<Vec<ScheduledJob>> {
        let mut jobs = Vec::with_capacity(rows.len());
        for row in rows {
            let id: String = row.try_get("id")?;
            let next_run: i64 = row.try_get("next_run_time")?;
            let state: Vec<u8> = row.try_get("job_state")?;
            match ScheduledJob::from_row(id.clone(), next_run, &state) {
                Ok(job) => jobs.push(job),
                // 对账时会根据任务定义重建该记录
                Err(e) => error!(job_id = %id, error = %e, "调度记录状态损坏，已跳过"),
            }
        }
        Ok(jobs)
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    #[instrument(skip(self))]
    async fn load_all(&self) -> SchedulerResult<Vec<ScheduledJob>> {
        let rows = sqlx::query(
            "SELECT id, next_run_time, job_state FROM scheduled_jobs ORDER BY next_run_time ASC",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| RepositoryErrorHelpers::persistence_error(Self::ctx(RepositoryOperation::Query), e))?;

        let jobs = Self::rows_to_jobs(rows)?;
        debug!("加载调度记录 {} 条", jobs.len());
        Ok(jobs)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, next_run_time = %job.next_run_time))]
    async fn save(&self, job: &ScheduledJob) -> SchedulerResult<()> {
        let context = Self::ctx(RepositoryOperation::Update).with_id(&job.id);
        let state = job.encode_state()?;

        sqlx::query(UPSERT_JOB)
            .bind(&job.id)
            .bind(job.next_run_time_micros())
            .bind(state)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::persistence_error(context.clone(), e))?;

        RepositoryErrorHelpers::log_operation_success(&context, None);
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %id))]
    async fn delete(&self, id: &str) -> SchedulerResult<()> {
        let context = Self::ctx(RepositoryOperation::Delete).with_id(id);
        sqlx::query("DELETE FROM scheduled_jobs WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::persistence_error(context.clone(), e))?;

        RepositoryErrorHelpers::log_operation_success(&context, None);
        Ok(())
    }

    async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1 FROM scheduled_jobs LIMIT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| RepositoryErrorHelpers::persistence_error(Self::ctx(RepositoryOperation::Read), e))?;
        Ok(())
    }
}
