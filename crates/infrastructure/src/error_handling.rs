//! Error helpers for repository operations
//!
//! Every repository method builds an [`OperationContext`] up front and routes
//! sqlx failures through [`RepositoryErrorHelpers`], so the logged message names
//! the operation and the entity it touched.

use chrono::{DateTime, Utc};
use scheduler_core::SchedulerError;
use sqlx::Error as SqlxError;
use std::fmt;
use tracing::{debug, error};

#[derive(Debug, Clone, Copy)]
pub enum RepositoryOperation {
    Create,
    Read,
    Update,
    Delete,
    Query,
}

impl fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepositoryOperation::Create => write!(f, "创建"),
            RepositoryOperation::Read => write!(f, "查询"),
            RepositoryOperation::Update => write!(f, "更新"),
            RepositoryOperation::Delete => write!(f, "删除"),
            RepositoryOperation::Query => write!(f, "查询"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Task,
    ScheduledJob,
    Execution,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Task => write!(f, "任务"),
            EntityKind::ScheduledJob => write!(f, "调度记录"),
            EntityKind::Execution => write!(f, "执行记录"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct OperationContext {
    pub operation: RepositoryOperation,
    pub entity: EntityKind,
    pub id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl OperationContext {
    pub fn new(operation: RepositoryOperation, entity: EntityKind) -> Self {
        Self {
            operation,
            entity,
            id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn entity_description(&self) -> String {
        match &self.id {
            Some(id) => format!("{} (ID: {})", self.entity, id),
            None => self.entity.to_string(),
        }
    }
}

pub struct RepositoryErrorHelpers;

impl RepositoryErrorHelpers {
    fn describe(context: &OperationContext, error: &SqlxError) -> String {
        let operation_desc = context.operation.to_string();
        let entity_desc = context.entity_description();
        match error {
            SqlxError::Database(db_error) => match db_error.constraint() {
                Some(constraint) => format!(
                    "{operation_desc}{entity_desc}时发生数据库约束冲突: {constraint}"
                ),
                None => format!("{operation_desc}{entity_desc}时发生数据库错误: {db_error}"),
            },
            SqlxError::PoolClosed => format!("{operation_desc}{entity_desc}时数据库连接池已关闭"),
            SqlxError::PoolTimedOut => format!("{operation_desc}{entity_desc}时数据库连接池超时"),
            SqlxError::Io(io_error) => {
                format!("{operation_desc}{entity_desc}时发生I/O错误: {io_error}")
            }
            _ => format!("{operation_desc}{entity_desc}时发生未知数据库错误: {error}"),
        }
    }

    pub fn database_error(context: OperationContext, error: SqlxError) -> SchedulerError {
        let error_msg = Self::describe(&context, &error);
        error!(error = %error, operation = %context.operation, "{}", error_msg);
        SchedulerError::Database(error)
    }

    /// Job store failures surface as `SchedulePersistence` so the scheduler can
    /// track store health independently of other database errors.
    pub fn persistence_error(context: OperationContext, error: SqlxError) -> SchedulerError {
        let error_msg = Self::describe(&context, &error);
        error!(error = %error, operation = %context.operation, "{}", error_msg);
        SchedulerError::SchedulePersistence(error_msg)
    }

    pub fn not_found(context: OperationContext) -> SchedulerError {
        let id = context.id.clone().unwrap_or_default();
        debug!("{}{}不存在", context.operation, context.entity_description());
        match context.entity {
            EntityKind::Execution => SchedulerError::ExecutionNotFound { id },
            _ => SchedulerError::TaskNotFound { id },
        }
    }

    pub fn log_operation_success(context: &OperationContext, details: Option<&str>) {
        match details {
            Some(details) => debug!(
                "{}{}成功: {}",
                context.operation,
                context.entity_description(),
                details
            ),
            None => debug!("{}{}成功", context.operation, context.entity_description()),
        }
    }
}
