use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("无效的CRON表达式: {expr} - {message}")]
    InvalidCronExpression { expr: String, message: String },

    #[error("无效的触发器参数: {0}")]
    InvalidTriggerParameter(String),

    #[error("未找到可用的解释器: 扩展名 {extension}, 候选 {candidates:?}")]
    InterpreterNotFound {
        extension: String,
        candidates: Vec<String>,
    },

    #[error("脚本不存在: {path}")]
    ScriptNotFound { path: String },

    #[error("调度持久化失败: {0}")]
    SchedulePersistence(String),

    #[error("任务未找到: {id}")]
    TaskNotFound { id: String },

    #[error("任务执行记录未找到: {id}")]
    ExecutionNotFound { id: String },

    #[error("无效的任务定义: {0}")]
    InvalidTask(String),

    #[error("无效的状态转换: {from} -> {to}")]
    InvalidStatusTransition { from: String, to: String },

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务执行错误: {0}")]
    TaskExecution(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 存储类错误：写入可以重试，调用方不应据此放弃内存中的状态
    pub fn is_persistence_error(&self) -> bool {
        matches!(
            self,
            SchedulerError::SchedulePersistence(_) | SchedulerError::Database(_)
        )
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(err: serde_json::Error) -> Self {
        SchedulerError::Serialization(err.to_string())
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, SchedulerError>;
