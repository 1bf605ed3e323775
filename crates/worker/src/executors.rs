use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scheduler_core::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, ExecutorConfig, SchedulerError,
    SchedulerResult, Task, TaskExecutor,
};
use scheduler_infrastructure::MetricsCollector;

use crate::interpreter::InterpreterResolver;

/// 主进程退出后等待输出管道关闭的最长时间
///
/// 后台子进程可能继承管道并一直持有，不能让它拖住执行结果。
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);
const TRUNCATED_MARKER: &str = "\n...[输出已截断]";
const READ_CHUNK_BYTES: usize = 8192;

/// 脚本执行器
///
/// 每次执行启动一个独立的进程组：超时或取消时向整个进程组发送
/// `SIGTERM`，宽限期后再发送 `SIGKILL`，不留下孤儿进程。
/// 截止时间基于单调时钟，不受系统时间调整影响。
pub struct ScriptExecutor {
    config: ExecutorConfig,
    interpreters: InterpreterResolver,
    metrics: Arc<MetricsCollector>,
    spawner: Spawner,
}

/// 启动进程的方式，测试中替换以模拟资源不足
type Spawner = Arc<dyn Fn(&mut Command) -> std::io::Result<Child> + Send + Sync>;

enum Outcome {
    Exited(std::io::Result<ExitStatus>),
    TimedOut,
    Cancelled,
}

impl ScriptExecutor {
    pub fn new(config: ExecutorConfig) -> Self {
        Self::with_resolver(config, InterpreterResolver::new())
    }

    pub fn with_resolver(config: ExecutorConfig, interpreters: InterpreterResolver) -> Self {
        Self {
            config,
            interpreters,
            metrics: Arc::new(MetricsCollector::new()),
            spawner: Arc::new(|cmd: &mut Command| cmd.spawn()),
        }
    }

    #[cfg(test)]
    fn with_spawner(mut self, spawner: Spawner) -> Self {
        self.spawner = spawner;
        self
    }

    /// 解析脚本路径：绝对路径原样使用，相对路径先查脚本目录，再查当前目录
    pub fn resolve_script_path(&self, script_path: &str) -> SchedulerResult<PathBuf> {
        let path = Path::new(script_path);
        let candidates = if path.is_absolute() {
            vec![path.to_path_buf()]
        } else {
            vec![Path::new(&self.config.scripts_dir).join(path), path.to_path_buf()]
        };

        let found = candidates
            .into_iter()
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| SchedulerError::ScriptNotFound {
                path: script_path.to_string(),
            })?;

        found.canonicalize().map_err(|e| {
            SchedulerError::TaskExecution(format!("无法解析脚本路径 {}: {e}", found.display()))
        })
    }

    /// 工作目录：任务指定的目录，其次是全局默认目录，最后是脚本所在目录
    pub fn working_directory(&self, task: &Task, script: &Path) -> PathBuf {
        task.working_directory
            .as_deref()
            .filter(|dir| !dir.trim().is_empty())
            .or(self.config.default_working_dir.as_deref())
            .map(PathBuf::from)
            .or_else(|| script.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// 每个脚本一个日志文件，以脚本文件名（不含扩展名）命名，返回绝对路径
    pub async fn script_log_path(&self, script: &Path) -> SchedulerResult<PathBuf> {
        let stem = script
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("script");

        let dir = Path::new(&self.config.script_log_dir);
        tokio::fs::create_dir_all(dir).await.map_err(|e| {
            SchedulerError::TaskExecution(format!("创建脚本日志目录失败 {}: {e}", dir.display()))
        })?;
        let dir = tokio::fs::canonicalize(dir).await.map_err(|e| {
            SchedulerError::TaskExecution(format!("解析脚本日志目录失败 {}: {e}", dir.display()))
        })?;

        Ok(dir.join(format!("{stem}.log")))
    }

    fn timeout_for(&self, task: &Task) -> Duration {
        let seconds = if task.timeout_seconds == 0 {
            self.config.default_timeout_seconds
        } else {
            task.timeout_seconds
        };
        Duration::from_secs(seconds)
    }

    async fn run(
        &self,
        request: &ExecutionRequest,
        cancel: &CancellationToken,
    ) -> SchedulerResult<ExecutionResult> {
        let task = &request.task;
        let script = self.resolve_script_path(&task.script_path)?;
        let command = self.interpreters.resolve(&script)?;
        let working_dir = self.working_directory(task, &script);
        let log_path = self.script_log_path(&script).await?;
        let timeout = self.timeout_for(task);

        if cancel.is_cancelled() {
            return Ok(ExecutionResult::cancelled("执行开始前已被取消"));
        }

        append_log(&log_path, &start_banner(request, &script)).await;

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .arg(&script)
            .args(&task.arguments)
            .current_dir(&working_dir)
            .envs(&task.environment)
            .env("TASK_ID", &task.id)
            .env("TASK_EXECUTION_ID", &request.execution_id)
            .env("TASK_SCRIPT_LOG", &log_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = match self.spawn_with_retry(&mut cmd, &request.execution_id).await {
            Ok(child) => child,
            Err(e) => {
                append_log(&log_path, &end_banner("failed", None, 0.0)).await;
                return Err(e);
            }
        };
        let started = tokio::time::Instant::now();
        let deadline = started + timeout;
        let pid = child.id();

        info!(
            execution_id = %request.execution_id,
            task_id = %task.id,
            pid = ?pid,
            interpreter = %command.program.display(),
            script = %script.display(),
            "脚本进程已启动"
        );

        let limit = self.config.max_output_bytes;
        let stdout = child.stdout.take().map(|out| capture_bounded(out, limit));
        let stderr = child.stderr.take().map(|err| capture_bounded(err, limit));

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };
        let elapsed = started.elapsed().as_secs_f64();

        if !matches!(outcome, Outcome::Exited(Ok(_))) {
            self.terminate(&mut child, pid).await;
        }

        let output = collect_output(stdout).await;
        let errors = collect_output(stderr).await;

        let result = match outcome {
            Outcome::Exited(Ok(status)) => {
                let error = if !errors.trim().is_empty() {
                    Some(errors)
                } else if !status.success() {
                    Some(describe_exit(&status))
                } else {
                    None
                };
                ExecutionResult::from_exit(status.code(), output, error, elapsed)
            }
            Outcome::Exited(Err(e)) => ExecutionResult {
                status: ExecutionStatus::Failed,
                exit_code: None,
                output,
                error: Some(format!("等待脚本进程失败: {e}")),
                elapsed_seconds: elapsed,
            },
            Outcome::TimedOut => {
                warn!(
                    execution_id = %request.execution_id,
                    task_id = %task.id,
                    timeout_seconds = timeout.as_secs(),
                    "脚本执行超时，已终止进程组"
                );
                ExecutionResult {
                    status: ExecutionStatus::Timeout,
                    exit_code: None,
                    output,
                    error: Some(format!("执行超时（{}秒）", timeout.as_secs())),
                    elapsed_seconds: elapsed,
                }
            }
            Outcome::Cancelled => {
                info!(execution_id = %request.execution_id, "脚本执行已取消，已终止进程组");
                ExecutionResult {
                    status: ExecutionStatus::Cancelled,
                    exit_code: None,
                    output,
                    error: Some("执行已被取消".to_string()),
                    elapsed_seconds: elapsed,
                }
            }
        };

        append_log(
            &log_path,
            &end_banner(result.status.as_str(), result.exit_code, result.elapsed_seconds),
        )
        .await;
        Ok(result)
    }

    /// 启动进程，资源暂时不足时按指数退避加随机抖动重试
    async fn spawn_with_retry(
        &self,
        cmd: &mut Command,
        execution_id: &str,
    ) -> SchedulerResult<Child> {
        let attempts = self.config.spawn_retry_attempts.max(1);
        let base_ms = self.config.spawn_retry_backoff_ms;
        let mut attempt = 1;

        loop {
            match (self.spawner)(cmd) {
                Ok(child) => return Ok(child),
                Err(e) if attempt < attempts && is_transient_spawn_error(&e) => {
                    let jitter = rand::rng().random_range(0..=base_ms / 2);
                    let delay_ms = spawn_backoff_ms(base_ms, attempt, jitter);
                    warn!(
                        execution_id,
                        attempt,
                        delay_ms,
                        "启动脚本进程失败，稍后重试: {}", e
                    );
                    self.metrics.record_spawn_retry();
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(SchedulerError::TaskExecution(format!(
                        "启动脚本进程失败: {e}"
                    )))
                }
            }
        }
    }

    /// 终止整个进程组：先 SIGTERM，宽限期后 SIGKILL
    async fn terminate(&self, child: &mut Child, pid: Option<u32>) {
        #[cfg(unix)]
        {
            if let Some(pid) = pid {
                let grace = Duration::from_secs(self.config.kill_grace_period_seconds);
                signal_group(pid, libc::SIGTERM);
                if tokio::time::timeout(grace, child.wait()).await.is_err() {
                    warn!(pid, "进程组未在宽限期内退出，强制终止");
                }
                // 主进程退出后组内可能还有残留的子进程
                signal_group(pid, libc::SIGKILL);
            }
        }
        #[cfg(not(unix))]
        let _ = pid;

        if let Err(e) = child.kill().await {
            debug!("进程已退出: {}", e);
        }
    }
}

#[async_trait]
impl TaskExecutor for ScriptExecutor {
    async fn execute(&self, request: &ExecutionRequest, cancel: CancellationToken) -> ExecutionResult {
        match self.run(request, &cancel).await {
            Ok(result) => {
                debug!(
                    execution_id = %request.execution_id,
                    status = %result.status,
                    exit_code = ?result.exit_code,
                    "脚本执行结束"
                );
                result
            }
            Err(e) => {
                warn!(
                    execution_id = %request.execution_id,
                    task_id = %request.task.id,
                    "脚本无法执行: {}", e
                );
                ExecutionResult::failed(e.to_string())
            }
        }
    }

    fn name(&self) -> &str {
        "script"
    }
}

/// 读取输出直到管道关闭，只保留前 `limit` 字节，其余读出后丢弃以免子进程阻塞在写管道上
fn capture_bounded<R>(mut reader: R, limit: usize) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut kept = Vec::with_capacity(limit.min(READ_CHUNK_BYTES));
        let mut chunk = vec![0u8; READ_CHUNK_BYTES];
        let mut truncated = false;

        loop {
            match reader.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    let room = limit.saturating_sub(kept.len());
                    if n > room {
                        truncated = true;
                    }
                    kept.extend_from_slice(&chunk[..n.min(room)]);
                }
                Err(e) => {
                    debug!("读取脚本输出失败: {}", e);
                    break;
                }
            }
        }

        let mut text = String::from_utf8_lossy(&kept).into_owned();
        if truncated {
            text.push_str(TRUNCATED_MARKER);
        }
        text
    })
}

async fn collect_output(handle: Option<JoinHandle<String>>) -> String {
    let Some(mut handle) = handle else {
        return String::new();
    };
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(text)) => text,
        Ok(Err(e)) => {
            warn!("输出读取任务异常结束: {}", e);
            String::new()
        }
        Err(_) => {
            handle.abort();
            debug!("输出管道仍被后台进程持有，放弃读取");
            String::new()
        }
    }
}

/// 第 `attempt` 次失败后的等待时间：基础间隔按 2 的幂增长，再加上抖动
fn spawn_backoff_ms(base_ms: u64, attempt: u32, jitter_ms: u64) -> u64 {
    base_ms
        .saturating_mul(1u64 << attempt.saturating_sub(1).min(16))
        .saturating_add(jitter_ms)
}

fn is_transient_spawn_error(err: &std::io::Error) -> bool {
    if matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted) {
        return true;
    }
    #[cfg(unix)]
    {
        if let Some(code) = err.raw_os_error() {
            return matches!(
                code,
                libc::EAGAIN | libc::ENOMEM | libc::EMFILE | libc::ENFILE | libc::ETXTBSY
            );
        }
    }
    false
}

#[cfg(unix)]
fn signal_group(pgid: u32, signal: libc::c_int) {
    let Ok(pgid) = libc::pid_t::try_from(pgid) else {
        return;
    };
    // SAFETY: killpg 只发送信号，不读写任何内存
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal, "发送信号失败: {}", err);
        }
    }
}

fn describe_exit(status: &ExitStatus) -> String {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("脚本被信号 {signal} 终止");
        }
    }
    match status.code() {
        Some(code) => format!("脚本退出码 {code}"),
        None => "脚本异常退出".to_string(),
    }
}

fn start_banner(request: &ExecutionRequest, script: &Path) -> String {
    let task = &request.task;
    format!(
        "\n===== [{}] 开始执行 =====\ntask_id: {}\ntask_name: {}\nexecution_id: {}\nscript: {}\narguments: {:?}\n",
        Utc::now().to_rfc3339(),
        task.id,
        task.name,
        request.execution_id,
        script.display(),
        task.arguments,
    )
}

fn end_banner(status: &str, exit_code: Option<i32>, elapsed_seconds: f64) -> String {
    let exit_code = exit_code.map_or_else(|| "-".to_string(), |code| code.to_string());
    format!(
        "===== [{}] 执行结束 status={} exit_code={} duration={:.3}s =====\n",
        Utc::now().to_rfc3339(),
        status,
        exit_code,
        elapsed_seconds,
    )
}

async fn append_log(path: &Path, text: &str) {
    let written: std::io::Result<()> = async {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(text.as_bytes()).await?;
        file.flush().await
    }
    .await;

    if let Err(e) = written {
        warn!(path = %path.display(), "写入脚本日志失败: {}", e);
    }
}
