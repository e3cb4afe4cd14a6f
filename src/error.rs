//! Error types used by the pool and by individual tasks.
//!
//! Two main enums:
//!
//! - [`TaskError`] failures observed through a task's result handle.
//! - [`SubmitError`] failures raised when handing work to the pool.
//!
//! Both provide `as_label` helpers yielding short stable strings for logs.

use std::io;

use thiserror::Error;

/// Errors delivered through a [`TaskHandle`](crate::TaskHandle).
///
/// A task's result channel is fulfilled exactly once, with either the
/// callable's value or one of these.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum TaskError {
    /// The callable panicked on its only attempt.
    #[error("task panicked: {reason}")]
    Failed {
        /// Text recovered from the panic payload.
        reason: String,
    },

    /// The callable panicked on every permitted attempt.
    #[error("task failed after {attempts} attempts: {reason}")]
    RetryExhausted {
        /// Total number of attempts made, including the first.
        attempts: u32,
        /// Text recovered from the last panic payload.
        reason: String,
    },

    /// The result was already taken out of the handle.
    #[error("result already retrieved")]
    AlreadyRetrieved,

    /// The pool dropped the task before it could run to completion.
    #[error("pool dropped the task before completion")]
    Shutdown,
}

impl TaskError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            TaskError::Failed { .. } => "task_failed",
            TaskError::RetryExhausted { .. } => "task_retry_exhausted",
            TaskError::AlreadyRetrieved => "task_already_retrieved",
            TaskError::Shutdown => "task_shutdown",
        }
    }
}

/// Errors raised by [`ThreadPool`](crate::ThreadPool) submission.
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum SubmitError {
    /// The pool is shutting down and no longer accepts work.
    #[error("thread pool is shutting down")]
    Shutdown,

    /// The operating system refused to spawn a worker thread.
    #[error("worker thread could not be spawned")]
    ResourceExhausted(#[source] io::Error),
}

impl SubmitError {
    /// Returns a short stable label (snake_case) for use in logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            SubmitError::Shutdown => "submit_shutdown",
            SubmitError::ResourceExhausted(_) => "submit_resource_exhausted",
        }
    }
}

/// Errors raised by the process-wide [`PoolManager`](crate::PoolManager).
#[non_exhaustive]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerError {
    /// The global pool has already been built; its settings are frozen.
    #[error("global pool already initialized; configuration is frozen")]
    AlreadyInitialized,

    /// A configuration was already recorded by an earlier call.
    #[error("global pool already configured")]
    AlreadyConfigured,
}
