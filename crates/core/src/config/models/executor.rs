use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// 相对脚本路径的解析根目录
    pub scripts_dir: String,
    /// 每个脚本一个日志文件: <script_log_dir>/<脚本名>.log
    pub script_log_dir: String,
    pub default_working_dir: Option<String>,
    pub default_timeout_seconds: u64,
    /// stdout/stderr 各自保留的最大字节数
    pub max_output_bytes: usize,
    pub kill_grace_period_seconds: u64,
    pub spawn_retry_attempts: u32,
    pub spawn_retry_backoff_ms: u64,
    pub max_concurrent_executions: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            scripts_dir: "scripts".to_string(),
            script_log_dir: "logs/scripts".to_string(),
            default_working_dir: None,
            default_timeout_seconds: 300,
            max_output_bytes: 65536,
            kill_grace_period_seconds: 5,
            spawn_retry_attempts: 3,
            spawn_retry_backoff_ms: 200,
            max_concurrent_executions: 16,
        }
    }
}

impl ExecutorConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scripts_dir.is_empty() {
            return Err(anyhow::anyhow!("脚本目录不能为空"));
        }

        if self.script_log_dir.is_empty() {
            return Err(anyhow::anyhow!("脚本日志目录不能为空"));
        }

        if self.default_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("默认超时时间必须大于0"));
        }

        if self.max_output_bytes == 0 {
            return Err(anyhow::anyhow!("最大输出字节数必须大于0"));
        }

        if self.spawn_retry_attempts == 0 {
            return Err(anyhow::anyhow!("进程启动重试次数必须大于0"));
        }

        if self.max_concurrent_executions == 0 {
            return Err(anyhow::anyhow!("最大并发执行数必须大于0"));
        }

        Ok(())
    }
}
