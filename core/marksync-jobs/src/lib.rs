//! Background job dispatch for marksync.
//!
//! Side effects of an accepted sync event (search indexing, notifications,
//! webhooks) run here, off the hot path of event ingestion. The
//! [`Dispatcher`] runs a fixed number of workers over a bounded queue:
//!
//! - Submission never blocks; a full queue rejects with
//!   [`JobError::QueueFull`] so callers can shed load.
//! - Each attempt is bounded by a timeout.
//! - Failed jobs are retried with linear backoff up to their retry budget,
//!   then recorded as permanently failed.
//! - [`Dispatcher::stop`] drains in-flight work up to a deadline and
//!   reports what it had to abandon.

mod dispatcher;
mod error;
mod handler;
mod job;

pub use dispatcher::{
    Dispatcher, DispatcherConfig, DispatcherStats, JobFailureRecord, JobOutcome, ShutdownReport,
};
pub use error::{JobError, JobResult};
pub use handler::{JobHandler, JobRegistry};
pub use job::{DEFAULT_MAX_RETRIES, Job, JobId, JobState, RetryDecision};
