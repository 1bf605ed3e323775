pub mod executors;
pub mod interpreter;
pub mod service;

pub use executors::ScriptExecutor;
pub use interpreter::{InterpreterResolver, ResolvedCommand};
pub use service::WorkerPool;
