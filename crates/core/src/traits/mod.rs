pub mod repository;
pub mod task_executor;

pub use repository::*;
pub use task_executor::*;
