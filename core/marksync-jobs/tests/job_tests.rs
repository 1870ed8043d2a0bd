use marksync_jobs::{DEFAULT_MAX_RETRIES, Job, JobState, RetryDecision};
use proptest::prelude::*;
use serde_json::json;
use std::time::Duration;

// ── Lifecycle ────────────────────────────────────────────────────

#[test]
fn new_job_defaults() {
    let job = Job::new("index", json!({"resourceId": "bm-1"}));
    assert_eq!(job.state(), JobState::Created);
    assert_eq!(job.retry_count, 0);
    assert_eq!(job.max_retries, DEFAULT_MAX_RETRIES);
    assert_eq!(job.attempt(), 1);
}

#[test]
fn job_ids_are_unique() {
    let a = Job::new("index", json!(null));
    let b = Job::new("index", json!(null));
    assert_ne!(a.id, b.id);
}

#[test]
fn terminal_states() {
    assert!(JobState::Succeeded.is_terminal());
    assert!(JobState::PermanentlyFailed.is_terminal());
    assert!(!JobState::Queued.is_terminal());
    assert!(!JobState::RetryScheduled.is_terminal());
}

// ── Retry decisions ──────────────────────────────────────────────

#[test]
fn backoff_is_linear_in_retry_count() {
    let unit = Duration::from_secs(1);
    let mut job = Job::new("notify", json!(null));

    assert_eq!(job.on_failure(unit), RetryDecision::Retry { delay: Duration::from_secs(1) });
    assert_eq!(job.state(), JobState::RetryScheduled);
    assert_eq!(job.on_failure(unit), RetryDecision::Retry { delay: Duration::from_secs(2) });
    assert_eq!(job.on_failure(unit), RetryDecision::Retry { delay: Duration::from_secs(3) });
    assert_eq!(job.on_failure(unit), RetryDecision::GiveUp);
    assert_eq!(job.state(), JobState::PermanentlyFailed);
    assert_eq!(job.retry_count, 3);
    assert_eq!(job.attempt(), 4);
}

#[test]
fn zero_retries_gives_up_immediately() {
    let mut job = Job::new("notify", json!(null)).with_max_retries(0);
    assert_eq!(job.on_failure(Duration::from_millis(10)), RetryDecision::GiveUp);
    assert_eq!(job.attempt(), 1);
}

#[test]
fn job_serializes_state() {
    let mut job = Job::new("webhook", json!({"url": "http://hook"}));
    job.mark_queued();
    let value = serde_json::to_value(&job).unwrap();
    assert_eq!(value["state"], "queued");
    assert_eq!(value["kind"], "webhook");
}

proptest! {
    #[test]
    fn attempts_never_exceed_budget(max_retries in 0u32..10) {
        let mut job = Job::new("k", json!(null)).with_max_retries(max_retries);
        let mut attempts = 1;
        while let RetryDecision::Retry { delay } = job.on_failure(Duration::from_millis(5)) {
            prop_assert_eq!(delay, Duration::from_millis(5) * job.retry_count);
            attempts += 1;
        }
        prop_assert_eq!(attempts, max_retries + 1);
        prop_assert_eq!(job.state(), JobState::PermanentlyFailed);
    }
}
