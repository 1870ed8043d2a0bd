//! Error types for the job dispatcher.

use std::time::Duration;
use thiserror::Error;

/// Result type for dispatcher and job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Errors returned by the dispatcher or produced by job execution.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// The bounded queue is saturated; the job was not accepted.
    #[error("job queue is full")]
    QueueFull,

    /// `submit` was called before `start`.
    #[error("dispatcher not started")]
    NotStarted,

    /// The dispatcher has been stopped and accepts no new work.
    #[error("dispatcher stopped")]
    Stopped,

    /// Invalid pool parameters.
    #[error("invalid dispatcher configuration: {0}")]
    InvalidConfig(String),

    /// No handler is registered for the job's kind.
    #[error("no handler registered for job kind '{0}'")]
    UnknownJobType(String),

    /// The job ran and failed.
    #[error("job failed: {0}")]
    Failed(String),

    /// The job exceeded its execution timeout.
    #[error("job timed out after {0:?}")]
    TimedOut(Duration),
}

impl JobError {
    /// Convenience constructor for handler failures.
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}
