//! Jobs and their lifecycle.
//!
//! A job moves through an explicit state machine:
//!
//! ```text
//! Created -> Queued -> Executing -> Succeeded
//!                          |
//!                          +-> RetryScheduled -> Queued -> ...
//!                          |
//!                          +-> PermanentlyFailed   (retry_count == max_retries)
//! ```
//!
//! Retry bounds and backoff are decided by [`Job::on_failure`], which is
//! pure apart from updating the job itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Unique identifier for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Creates a new random job ID.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Queued,
    Executing,
    Succeeded,
    RetryScheduled,
    PermanentlyFailed,
}

impl JobState {
    /// Whether the job will not run again.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::PermanentlyFailed)
    }
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-queue the job after `delay`.
    Retry { delay: Duration },
    /// The job has used all its retries.
    GiveUp,
}

/// A unit of retryable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Selects the handler in the registry.
    pub kind: String,
    /// Handler-defined input.
    pub payload: serde_json::Value,
    /// Number of retries already scheduled.
    pub retry_count: u32,
    pub max_retries: u32,
    state: JobState,
}

impl Job {
    /// Creates a job with the default retry budget.
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            kind: kind.into(),
            payload,
            retry_count: 0,
            max_retries: DEFAULT_MAX_RETRIES,
            state: JobState::Created,
        }
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        self.state
    }

    /// The 1-based number of the attempt currently running (or last run).
    pub fn attempt(&self) -> u32 {
        self.retry_count + 1
    }

    pub fn mark_queued(&mut self) {
        self.state = JobState::Queued;
    }

    pub fn mark_executing(&mut self) {
        self.state = JobState::Executing;
    }

    pub fn mark_succeeded(&mut self) {
        self.state = JobState::Succeeded;
    }

    /// Records a failed attempt and decides whether to retry.
    ///
    /// Backoff is linear: the n-th retry waits `n * unit_delay`.
    pub fn on_failure(&mut self, unit_delay: Duration) -> RetryDecision {
        if self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.state = JobState::RetryScheduled;
            RetryDecision::Retry {
                delay: unit_delay.saturating_mul(self.retry_count),
            }
        } else {
            self.state = JobState::PermanentlyFailed;
            RetryDecision::GiveUp
        }
    }

    /// Marks the job permanently failed without consuming retries, used
    /// when retrying cannot help (no handler registered).
    pub fn mark_permanently_failed(&mut self) {
        self.state = JobState::PermanentlyFailed;
    }
}
