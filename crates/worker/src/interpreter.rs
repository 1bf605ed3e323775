use std::ffi::OsString;
use std::path::{Path, PathBuf};

use scheduler_core::{SchedulerError, SchedulerResult};

/// 候选解释器：可执行文件名加上放在脚本路径之前的固定参数
type Candidate = (&'static str, &'static [&'static str]);

const PYTHON: &[Candidate] = &[("python3", &[]), ("python", &[])];
const NODE: &[Candidate] = &[("node", &[]), ("nodejs", &[])];
const TS_NODE: &[Candidate] = &[("ts-node", &[]), ("npx", &["ts-node"])];
const SHELL: &[Candidate] = &[("bash", &[]), ("sh", &[])];
const POWERSHELL: &[Candidate] = &[("pwsh", &["-File"]), ("powershell", &["-File"])];
const RUBY: &[Candidate] = &[("ruby", &[])];
const PHP: &[Candidate] = &[("php", &[])];
const PERL: &[Candidate] = &[("perl", &[])];
const CMD: &[Candidate] = &[("cmd.exe", &["/c"]), ("cmd", &["/c"])];

/// 按扩展名（小写，不含点）查找候选解释器
pub fn candidates_for(extension: &str) -> Option<&'static [Candidate]> {
    match extension {
        "py" => Some(PYTHON),
        "js" | "mjs" | "cjs" => Some(NODE),
        "ts" => Some(TS_NODE),
        "sh" | "bash" => Some(SHELL),
        "ps1" => Some(POWERSHELL),
        "rb" => Some(RUBY),
        "php" => Some(PHP),
        "pl" => Some(PERL),
        "bat" | "cmd" => Some(CMD),
        _ => None,
    }
}

/// 解析后的启动命令
///
/// `args` 只包含解释器自身的固定参数，脚本路径和任务参数由调用方逐个追加，
/// 从不拼接成 shell 字符串。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
}

/// 解释器解析器
#[derive(Debug, Clone, Default)]
pub struct InterpreterResolver {
    /// 为空时使用进程的 `PATH`
    search_path: Option<OsString>,
}

impl InterpreterResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// 使用指定的搜索路径代替 `PATH`
    pub fn with_search_path(search_path: impl Into<OsString>) -> Self {
        Self {
            search_path: Some(search_path.into()),
        }
    }

    /// 为脚本确定启动命令
    ///
    /// 未知扩展名（或无扩展名）的脚本直接执行，要求其本身可执行。
    pub fn resolve(&self, script: &Path) -> SchedulerResult<ResolvedCommand> {
        let extension = script
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        let Some(candidates) = candidates_for(&extension) else {
            return Ok(ResolvedCommand {
                program: script.to_path_buf(),
                args: Vec::new(),
            });
        };

        for (program, fixed_args) in candidates {
            if let Some(path) = self.lookup(program) {
                return Ok(ResolvedCommand {
                    program: path,
                    args: fixed_args.iter().map(|arg| arg.to_string()).collect(),
                });
            }
        }

        Err(SchedulerError::InterpreterNotFound {
            extension,
            candidates: candidates
                .iter()
                .map(|(program, _)| program.to_string())
                .collect(),
        })
    }

    fn lookup(&self, program: &str) -> Option<PathBuf> {
        match &self.search_path {
            Some(paths) => {
                let cwd = std::env::current_dir().ok()?;
                which::which_in(program, Some(paths), cwd).ok()
            }
            None => which::which(program).ok(),
        }
    }
}
