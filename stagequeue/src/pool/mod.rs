//! Concurrent task execution.
//!
//! This module provides:
//! - `TaskHandler`, the unit of work a stage runs for every input
//! - `WorkerPool`, which runs handlers on a bounded number of workers and
//!   reports each completion exactly once

mod handler;
mod worker_pool;

pub use handler::{AsyncFnHandler, FnHandler, TaskHandler};
pub use worker_pool::{CompletionHandler, WorkerPool};
