//! The worker pool.
//!
//! A fixed set of workers pulls jobs from one shared bounded queue.
//! Submission never waits: a saturated queue rejects with
//! [`JobError::QueueFull`]. Failed jobs are re-queued by a retry timer after
//! a linear backoff until their retry budget is spent.
//!
//! Shutdown closes the queue, lets workers finish what they are running and
//! drain what is already queued, and gives up after the configured timeout.
//! Anything left at that point is logged and reported as abandoned.

use crate::error::{JobError, JobResult};
use crate::handler::JobRegistry;
use crate::job::{Job, JobId, RetryDecision};
use async_channel::{Receiver, Sender, TrySendError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::Serialize;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

const OUTCOME_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Upper bound on a single attempt.
    pub job_timeout: Duration,
    /// The n-th retry of a job waits `n * retry_unit_delay`.
    pub retry_unit_delay: Duration,
    /// How long `stop` waits for workers before abandoning them.
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            job_timeout: Duration::from_secs(30),
            retry_unit_delay: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Record of a job that exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobFailureRecord {
    pub job_id: JobId,
    pub kind: String,
    /// Total attempts made, including the first.
    pub attempts: u32,
    /// Error of the last attempt.
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// Notification emitted whenever a job changes state in a way callers
/// might care about.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Succeeded {
        job_id: JobId,
        kind: String,
        attempts: u32,
    },
    RetryScheduled {
        job_id: JobId,
        kind: String,
        /// The attempt that just failed.
        failed_attempt: u32,
        delay: Duration,
    },
    Failed(JobFailureRecord),
    Abandoned {
        job_id: JobId,
        kind: String,
    },
}

/// Snapshot of dispatcher counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DispatcherStats {
    /// Jobs accepted by `submit`.
    pub submitted: u64,
    /// Submissions rejected with `QueueFull`.
    pub rejected: u64,
    pub succeeded: u64,
    /// Retries scheduled.
    pub retried: u64,
    pub permanently_failed: u64,
    pub abandoned: u64,
}

/// Result of [`Dispatcher::stop`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every worker finished within the shutdown timeout.
    pub clean: bool,
    /// Jobs that were queued, executing or awaiting a retry when the
    /// dispatcher gave up on them.
    pub abandoned: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    retried: AtomicU64,
    permanently_failed: AtomicU64,
    abandoned: AtomicU64,
}

struct Shared {
    config: DispatcherConfig,
    registry: JobRegistry,
    counters: Counters,
    failures: Mutex<Vec<JobFailureRecord>>,
    executing: Mutex<HashMap<JobId, Job>>,
    pending_retries: Mutex<HashMap<JobId, Job>>,
    outcomes: broadcast::Sender<JobOutcome>,
}

enum Lifecycle {
    Idle,
    Running(Running),
    Stopped,
}

struct Running {
    tx: Sender<Job>,
    rx: Receiver<Job>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

/// Bounded-concurrency, retrying job executor.
pub struct Dispatcher {
    shared: Arc<Shared>,
    lifecycle: Mutex<Lifecycle>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Dispatcher {
    /// Creates a dispatcher that runs jobs with the given handlers.
    /// No workers run until [`start`](Self::start).
    pub fn new(config: DispatcherConfig, registry: JobRegistry) -> Self {
        let (outcomes, _) = broadcast::channel(OUTCOME_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                counters: Counters::default(),
                failures: Mutex::new(Vec::new()),
                executing: Mutex::new(HashMap::new()),
                pending_retries: Mutex::new(HashMap::new()),
                outcomes,
            }),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Spawns `worker_count` workers consuming a queue of
    /// `queue_capacity` jobs. Must be called from within a Tokio runtime.
    ///
    /// Calling `start` on a running dispatcher logs a warning and does
    /// nothing. A stopped dispatcher may be started again.
    pub fn start(&self, worker_count: usize, queue_capacity: usize) -> JobResult<()> {
        if worker_count == 0 {
            return Err(JobError::InvalidConfig("worker_count must be at least 1".into()));
        }
        if queue_capacity == 0 {
            return Err(JobError::InvalidConfig("queue_capacity must be at least 1".into()));
        }

        let mut lifecycle = lock(&self.lifecycle);
        if matches!(*lifecycle, Lifecycle::Running(_)) {
            warn!("job dispatcher already started, ignoring start request");
            return Ok(());
        }

        let (tx, rx) = async_channel::bounded(queue_capacity);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let workers = (0..worker_count)
            .map(|worker| {
                tokio::spawn(run_worker(
                    worker,
                    self.shared.clone(),
                    tx.clone(),
                    rx.clone(),
                    shutdown_rx.clone(),
                ))
            })
            .collect();

        *lifecycle = Lifecycle::Running(Running {
            tx,
            rx,
            shutdown,
            workers,
        });
        info!(worker_count, queue_capacity, "job dispatcher started");
        Ok(())
    }

    /// Enqueues a job without waiting.
    ///
    /// Returns [`JobError::QueueFull`] if the queue is saturated,
    /// [`JobError::NotStarted`] before `start` and [`JobError::Stopped`]
    /// after `stop`.
    pub fn submit(&self, mut job: Job) -> JobResult<JobId> {
        let lifecycle = lock(&self.lifecycle);
        let running = match &*lifecycle {
            Lifecycle::Running(running) => running,
            Lifecycle::Idle => return Err(JobError::NotStarted),
            Lifecycle::Stopped => return Err(JobError::Stopped),
        };

        let id = job.id;
        job.mark_queued();
        match running.tx.try_send(job) {
            Ok(()) => {
                self.shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                debug!(job_id = %id, "job queued");
                Ok(id)
            }
            Err(TrySendError::Full(job)) => {
                self.shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(job_id = %job.id, kind = %job.kind, "job queue full, rejecting job");
                Err(JobError::QueueFull)
            }
            Err(TrySendError::Closed(_)) => Err(JobError::Stopped),
        }
    }

    /// Stops the pool.
    ///
    /// Closes the queue to new submissions, lets workers finish in-flight
    /// and already-queued jobs, and waits up to the shutdown timeout.
    /// Workers still busy after that are aborted; their jobs, any jobs
    /// left in the queue and any pending retries are logged as abandoned.
    pub async fn stop(&self) -> ShutdownReport {
        let running = {
            let mut lifecycle = lock(&self.lifecycle);
            match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
                Lifecycle::Running(running) => running,
                previous => {
                    *lifecycle = previous;
                    debug!("stop requested on a dispatcher that is not running");
                    return ShutdownReport {
                        clean: true,
                        abandoned: 0,
                    };
                }
            }
        };

        let Running {
            tx,
            rx,
            shutdown,
            mut workers,
        } = running;

        info!(queued = rx.len(), "stopping job dispatcher");
        tx.close();
        let _ = shutdown.send(true);

        let timeout = self.shared.config.shutdown_timeout;
        let clean = tokio::time::timeout(timeout, futures::future::join_all(workers.iter_mut()))
            .await
            .is_ok();

        let mut abandoned = 0;
        if !clean {
            warn!(?timeout, "job workers did not finish in time, aborting them");
            for worker in &workers {
                worker.abort();
            }
            let stuck: Vec<Job> = lock(&self.shared.executing)
                .drain()
                .map(|(_, job)| job)
                .collect();
            for job in stuck {
                self.shared.abandon(&job, "still executing at shutdown timeout");
                abandoned += 1;
            }
        }

        // Workers are gone, so no further retries can be scheduled.
        let pending: Vec<Job> = lock(&self.shared.pending_retries)
            .drain()
            .map(|(_, job)| job)
            .collect();
        for job in pending {
            self.shared.abandon(&job, "retry still pending at shutdown");
            abandoned += 1;
        }

        while let Ok(job) = rx.try_recv() {
            self.shared.abandon(&job, "never executed before shutdown");
            abandoned += 1;
        }

        info!(clean, abandoned, "job dispatcher stopped");
        ShutdownReport { clean, abandoned }
    }

    /// Whether workers are running.
    pub fn is_running(&self) -> bool {
        matches!(*lock(&self.lifecycle), Lifecycle::Running(_))
    }

    /// Number of jobs waiting in the queue.
    pub fn queue_len(&self) -> usize {
        match &*lock(&self.lifecycle) {
            Lifecycle::Running(running) => running.rx.len(),
            _ => 0,
        }
    }

    /// Current counters.
    pub fn stats(&self) -> DispatcherStats {
        let c = &self.shared.counters;
        DispatcherStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            retried: c.retried.load(Ordering::Relaxed),
            permanently_failed: c.permanently_failed.load(Ordering::Relaxed),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    /// Jobs that exhausted their retries, oldest first.
    pub fn failures(&self) -> Vec<JobFailureRecord> {
        lock(&self.shared.failures).clone()
    }

    /// Subscribes to job outcome notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<JobOutcome> {
        self.shared.outcomes.subscribe()
    }
}

impl Shared {
    async fn execute(&self, job: &Job) -> JobResult<()> {
        let handler = self
            .registry
            .get(&job.kind)
            .ok_or_else(|| JobError::UnknownJobType(job.kind.clone()))?;

        let attempt = AssertUnwindSafe(handler.run(job)).catch_unwind();
        match tokio::time::timeout(self.config.job_timeout, attempt).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(JobError::failed("job handler panicked")),
            Err(_) => Err(JobError::TimedOut(self.config.job_timeout)),
        }
    }

    fn succeeded(&self, mut job: Job) {
        job.mark_succeeded();
        self.counters.succeeded.fetch_add(1, Ordering::Relaxed);
        debug!(job_id = %job.id, kind = %job.kind, attempts = job.attempt(), "job succeeded");
        let _ = self.outcomes.send(JobOutcome::Succeeded {
            job_id: job.id,
            kind: job.kind,
            attempts: job.retry_count + 1,
        });
    }

    fn give_up(&self, job: Job, err: &JobError) {
        let record = JobFailureRecord {
            job_id: job.id,
            kind: job.kind.clone(),
            attempts: job.attempt(),
            error: err.to_string(),
            failed_at: Utc::now(),
        };
        error!(
            job_id = %job.id,
            kind = %job.kind,
            attempts = record.attempts,
            error = %err,
            "job permanently failed"
        );
        self.counters.permanently_failed.fetch_add(1, Ordering::Relaxed);
        lock(&self.failures).push(record.clone());
        let _ = self.outcomes.send(JobOutcome::Failed(record));
    }

    fn abandon(&self, job: &Job, reason: &str) {
        warn!(job_id = %job.id, kind = %job.kind, reason, "job abandoned");
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        let _ = self.outcomes.send(JobOutcome::Abandoned {
            job_id: job.id,
            kind: job.kind.clone(),
        });
    }
}

async fn run_worker(
    worker: usize,
    shared: Arc<Shared>,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    shutdown: watch::Receiver<bool>,
) {
    debug!(worker, "job worker started");

    // `recv` keeps yielding queued jobs after the queue is closed and
    // fails once it is both closed and empty.
    while let Ok(mut job) = rx.recv().await {
        job.mark_executing();
        lock(&shared.executing).insert(job.id, job.clone());
        let result = shared.execute(&job).await;
        lock(&shared.executing).remove(&job.id);

        match result {
            Ok(()) => shared.succeeded(job),
            Err(err @ JobError::UnknownJobType(_)) => {
                job.mark_permanently_failed();
                shared.give_up(job, &err);
            }
            Err(err) => {
                let failed_attempt = job.attempt();
                match job.on_failure(shared.config.retry_unit_delay) {
                    RetryDecision::Retry { delay } => {
                        warn!(
                            job_id = %job.id,
                            kind = %job.kind,
                            attempt = failed_attempt,
                            ?delay,
                            error = %err,
                            "job failed, retry scheduled"
                        );
                        shared.counters.retried.fetch_add(1, Ordering::Relaxed);
                        let (job_id, kind) = (job.id, job.kind.clone());
                        schedule_retry(shared.clone(), job, delay, tx.clone(), shutdown.clone());
                        let _ = shared.outcomes.send(JobOutcome::RetryScheduled {
                            job_id,
                            kind,
                            failed_attempt,
                            delay,
                        });
                    }
                    RetryDecision::GiveUp => shared.give_up(job, &err),
                }
            }
        }
    }

    debug!(worker, "job worker exiting");
}

/// Moves a job from `RetryScheduled` back to `Queued` once its backoff
/// elapses. The job is parked in `pending_retries` meanwhile so `stop` can
/// account for it.
fn schedule_retry(
    shared: Arc<Shared>,
    job: Job,
    delay: Duration,
    tx: Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    let job_id = job.id;
    lock(&shared.pending_retries).insert(job_id, job);

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.wait_for(|stopped| *stopped) => return,
        }

        let pending = lock(&shared.pending_retries).remove(&job_id);
        let Some(mut job) = pending else {
            return;
        };
        job.mark_queued();
        if let Err(async_channel::SendError(job)) = tx.send(job).await {
            shared.abandon(&job, "queue closed before retry");
        }
    });
}
