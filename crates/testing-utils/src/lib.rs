//! # Scheduler Testing Utils
//!
//! Shared testing utilities for the script scheduler workspace.
//!
//! - **Mock collaborators**: in-memory [`TaskRegistry`](scheduler_core::TaskRegistry),
//!   [`JobStore`](scheduler_core::JobStore), [`ExecutionRepository`](scheduler_core::ExecutionRepository)
//!   and [`TaskExecutor`](scheduler_core::TaskExecutor) implementations
//! - **Test data builders**: [`TaskBuilder`], [`ExecutionResultBuilder`]
//! - **Helpers**: polling with timeout, throwaway script directories
//!
//! Add this crate as a dev-dependency:
//!
//! ```toml
//! [dev-dependencies]
//! scheduler-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
