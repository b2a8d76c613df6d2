//! # Retry
//!
//! Pure policy mapping a finished attempt to the job's next state.
use chrono::{DateTime, Duration, Utc};

use crate::types::{Job, Outcome};

/// What should happen to a job after an attempt finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// The attempt succeeded; the job is done.
    Complete,
    /// The attempt failed but retries remain; eligible again at `run_at`.
    Retry {
        run_at: DateTime<Utc>,
        error: String,
    },
    /// The retry budget is exhausted; the job goes to the dead-letter queue.
    Bury { error: String },
}

/// A retry policy to determine what happens to a job after a failed attempt.
///
/// Built from the job row's snapshotted knobs, never from live config, so a
/// job's outcome is independent of config churn after enqueue.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Base of the exponential backoff: a job waits `backoff_base ^ attempts`
    /// seconds after its n-th failure.
    pub backoff_base: i64,
    /// Failures beyond this many retries move the job to the DLQ.
    pub max_retries: i64,
}

impl RetryPolicy {
    pub fn for_job(job: &Job) -> Self {
        Self {
            backoff_base: job.backoff_base,
            max_retries: job.max_retries,
        }
    }

    /// Determine the backoff interval after the given attempt number.
    pub fn backoff_interval(&self, attempts: i64) -> Duration {
        let exponent = u32::try_from(attempts).unwrap_or(u32::MAX);
        let seconds = self
            .backoff_base
            .checked_pow(exponent)
            .unwrap_or(i64::MAX / 1000);
        Duration::seconds(seconds)
    }

    /// Map an outcome to the job's next state.
    ///
    /// `attempts` is the attempt count as of the lease, i.e. the attempt that
    /// just finished. `Outcome::Cancelled` must not be routed here; shutdown
    /// leaves the row leased rather than spending an attempt.
    pub fn disposition(&self, attempts: i64, outcome: &Outcome, now: DateTime<Utc>) -> Disposition {
        match outcome {
            Outcome::Success => Disposition::Complete,
            Outcome::Cancelled => {
                debug_assert!(false, "cancelled attempts are not committed");
                Disposition::Complete
            }
            failure => {
                if attempts > self.max_retries {
                    Disposition::Bury {
                        error: failure.describe(),
                    }
                } else {
                    Disposition::Retry {
                        run_at: now + self.backoff_interval(attempts),
                        error: failure.describe(),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff_base: i64, max_retries: i64) -> RetryPolicy {
        RetryPolicy {
            backoff_base,
            max_retries,
        }
    }

    #[test]
    fn test_backoff_interval_grows_exponentially() {
        let policy = policy(2, 5);

        assert_eq!(policy.backoff_interval(1), Duration::seconds(2));
        assert_eq!(policy.backoff_interval(2), Duration::seconds(4));
        assert_eq!(policy.backoff_interval(3), Duration::seconds(8));
    }

    #[test]
    fn test_backoff_interval_with_base_one_is_constant() {
        let policy = policy(1, 5);

        assert_eq!(policy.backoff_interval(1), Duration::seconds(1));
        assert_eq!(policy.backoff_interval(4), Duration::seconds(1));
    }

    #[test]
    fn test_success_completes() {
        let now = Utc::now();
        assert_eq!(
            policy(2, 3).disposition(1, &Outcome::Success, now),
            Disposition::Complete
        );
    }

    #[test]
    fn test_failure_with_attempts_remaining_retries() {
        let now = Utc::now();
        let got = policy(2, 3).disposition(2, &Outcome::NonZeroExit(1), now);

        match got {
            Disposition::Retry { run_at, error } => {
                assert_eq!(run_at, now + Duration::seconds(4));
                assert!(error.contains("status 1"));
            }
            other => panic!("expected retry, got {other:?}"),
        }
    }

    #[test]
    fn test_failure_past_budget_buries() {
        let now = Utc::now();
        // max_retries = 2 allows three attempts in total.
        let got = policy(2, 2).disposition(3, &Outcome::TimedOut, now);

        match got {
            Disposition::Bury { error } => assert!(error.contains("timed out")),
            other => panic!("expected bury, got {other:?}"),
        }
    }

    #[test]
    fn test_zero_retries_buries_on_first_failure() {
        let now = Utc::now();
        let got = policy(2, 0).disposition(1, &Outcome::SpawnError("enoent".to_owned()), now);

        assert!(matches!(got, Disposition::Bury { .. }));
    }

    #[test]
    fn test_large_attempt_counts_do_not_overflow() {
        let policy = policy(10, i64::MAX);
        assert!(policy.backoff_interval(1_000) > Duration::zero());
    }
}
