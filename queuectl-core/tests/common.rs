use chrono::{DateTime, Duration, Utc};
use queuectl_core::{Job, JobInit, JobState};

pub fn spec(id: &str, command: &str) -> JobInit {
    JobInit::new(id, command)
}

pub fn spec_with_priority(id: &str, priority: i64) -> JobInit {
    let mut init = JobInit::new(id, "echo hi");
    init.priority = priority;
    init
}

pub fn assert_leased_by(job: &Job, worker_id: &str) {
    assert_eq!(job.state, JobState::Processing);
    assert_eq!(job.worker_id.as_deref(), Some(worker_id));
    assert!(job.leased_at.is_some());
}

pub fn assert_unleased(job: &Job) {
    assert!(job.worker_id.is_none());
    assert!(job.leased_at.is_none());
}

// Timestamps round-trip through the store's text encoding; compare with a
// small tolerance rather than to the nanosecond.
pub fn assert_close_to(actual: DateTime<Utc>, expected: DateTime<Utc>) {
    let delta = (actual - expected).abs();
    assert!(
        delta < Duration::seconds(1),
        "expected {actual} within 1s of {expected}"
    );
}
