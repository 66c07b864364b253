//! Task Executor Interfaces Library
//!
//! This crate provides the task executors the upper PHY uses to fan out
//! per-PDU work to worker threads.

pub mod executor;

pub use executor::{InlineExecutor, ManualExecutor, Task, TaskExecutor, TokioExecutor, WorkerPool};

use thiserror::Error;

/// Interface errors
#[derive(Error, Debug)]
pub enum InterfaceError {
    #[error("Failed to spawn worker thread {name}: {source}")]
    SpawnFailed {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
