pub mod sqlite;

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use futures::future::BoxFuture;
use scheduler_core::{DatabaseConfig, SchedulerResult};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite, SqliteConnection, SqlitePool};
use tracing::{debug, info, warn};

pub use sqlite::{SqliteExecutionRepository, SqliteJobStore, SqliteTaskRegistry};

pub type DbPool = Pool<Sqlite>;

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS tasks (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        script_path TEXT NOT NULL,
        trigger_type TEXT NOT NULL,
        cron_expression TEXT,
        interval_seconds INTEGER,
        scheduled_time TEXT,
        arguments TEXT NOT NULL DEFAULT '[]',
        working_directory TEXT,
        environment TEXT NOT NULL DEFAULT '{}',
        timeout_seconds INTEGER NOT NULL DEFAULT 300,
        enabled INTEGER NOT NULL DEFAULT 1,
        deleted INTEGER NOT NULL DEFAULT 0,
        description TEXT,
        run_count INTEGER NOT NULL DEFAULT 0,
        success_count INTEGER NOT NULL DEFAULT 0,
        failed_count INTEGER NOT NULL DEFAULT 0,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS scheduled_jobs (
        id TEXT PRIMARY KEY,
        next_run_time INTEGER NOT NULL,
        job_state BLOB NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS task_executions (
        id TEXT PRIMARY KEY,
        task_id TEXT NOT NULL,
        task_name TEXT NOT NULL,
        status TEXT NOT NULL,
        start_time TEXT NOT NULL,
        end_time TEXT,
        duration REAL,
        exit_code INTEGER,
        output TEXT,
        error TEXT,
        runner_pid INTEGER,
        created_at TEXT NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_tasks_enabled_deleted ON tasks(enabled, deleted)",
    "CREATE INDEX IF NOT EXISTS idx_scheduled_jobs_next_run_time ON scheduled_jobs(next_run_time)",
    "CREATE INDEX IF NOT EXISTS idx_task_executions_task_id ON task_executions(task_id)",
    "CREATE INDEX IF NOT EXISTS idx_task_executions_start_time ON task_executions(start_time)",
    "CREATE INDEX IF NOT EXISTS idx_task_executions_status ON task_executions(status)",
];

pub struct DatabaseManager {
    pool: SqlitePool,
}

impl DatabaseManager {
    /// 按配置建立连接池并执行迁移
    pub async fn new(config: &DatabaseConfig) -> SchedulerResult<Self> {
        let in_memory = config.url.contains(":memory:");

        let mut options = SqliteConnectOptions::from_str(&config.url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(config.connection_timeout_seconds));

        if !in_memory {
            ensure_parent_dir(&config.url);
            options = options.journal_mode(SqliteJournalMode::Wal);
        }

        // 每个连到 `:memory:` 的连接都是独立的数据库，只能保留一个连接
        let mut pool_options = SqlitePoolOptions::new()
            .acquire_timeout(Duration::from_secs(config.connection_timeout_seconds));
        pool_options = if in_memory {
            pool_options
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            pool_options
                .max_connections(config.max_connections)
                .min_connections(config.min_connections)
        };

        let pool = pool_options.connect_with(options).await?;
        let manager = Self { pool };
        manager.migrate().await?;

        info!(url = %config.url, "数据库连接已建立");
        Ok(manager)
    }

    /// 单连接的内存数据库，用于测试
    pub async fn in_memory() -> SchedulerResult<Self> {
        Self::new(&DatabaseConfig {
            url: "sqlite::memory:".to_string(),
            ..DatabaseConfig::default()
        })
        .await
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn migrate(&self) -> SchedulerResult<()> {
        debug!("执行SQLite数据库迁移");
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }

        // 旧版本创建的执行记录表没有 runner_pid 列
        let has_runner_pid: Option<(i64,)> = sqlx::query_as(
            "SELECT 1 FROM pragma_table_info('task_executions') WHERE name = 'runner_pid'",
        )
        .fetch_optional(&self.pool)
        .await?;
        if has_runner_pid.is_none() {
            sqlx::query("ALTER TABLE task_executions ADD COLUMN runner_pid INTEGER")
                .execute(&self.pool)
                .await?;
            info!("执行记录表已添加 runner_pid 列");
        }

        debug!("SQLite数据库迁移完成");
        Ok(())
    }

    pub async fn health_check(&self) -> SchedulerResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub fn task_registry(&self) -> SqliteTaskRegistry {
        SqliteTaskRegistry::new(self.pool.clone())
    }

    pub fn job_store(&self) -> SqliteJobStore {
        SqliteJobStore::new(self.pool.clone())
    }

    pub fn execution_repository(&self) -> SqliteExecutionRepository {
        SqliteExecutionRepository::new(self.pool.clone())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

fn ensure_parent_dir(url: &str) {
    let path = url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .split('?')
        .next()
        .unwrap_or_default();
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                warn!(dir = %parent.display(), error = %e, "创建数据库目录失败");
            }
        }
    }
}

/// 在事务中执行 `op`
///
/// `op` 返回 `Ok` 时提交，返回 `Err` 时回滚。`op` panic 或 future 被丢弃时，
/// 事务在析构时回滚，连接归还连接池。
///
/// ```rust,ignore
/// with_transaction(&pool, |conn| {
///     Box::pin(async move {
///         sqlx::query("DELETE FROM scheduled_jobs").execute(&mut *conn).await?;
///         Ok(())
///     })
/// })
/// .await?;
/// ```
pub async fn with_transaction<T, F>(pool: &SqlitePool, op: F) -> SchedulerResult<T>
where
    T: Send,
    F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, SchedulerResult<T>>,
{
    let mut tx = pool.begin().await?;
    match op(&mut *tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_error) = tx.rollback().await {
                warn!(error = %rollback_error, "事务回滚失败");
            }
            Err(e)
        }
    }
}
