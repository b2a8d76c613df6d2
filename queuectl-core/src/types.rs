use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::QueueError;

/// Enumeration of possible states for a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum JobState {
    /// Waiting for its `run_at` time before becoming eligible.
    Scheduled,
    /// Eligible and waiting in the queue to be picked up by a worker.
    Pending,
    /// Leased by a worker and currently being executed.
    Processing,
    /// Finished successfully. Terminal.
    Completed,
    /// Failed and waiting out its backoff before the next attempt.
    Failed,
    /// Exhausted its retry budget. Terminal, awaiting operator attention.
    Dead,
}

impl FromStr for JobState {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(JobState::Scheduled),
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            invalid => Err(QueueError::ParseJobState(invalid.to_owned())),
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Scheduled => "scheduled",
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        };
        f.pad(s)
    }
}

/// The chunk of data needed to enqueue a job.
///
/// `max_retries` and `backoff_base`, when left unset, are snapshotted from the
/// store's config table at insert time. Config changes after enqueue never
/// affect a job already in the queue.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct JobInit {
    pub id: String,
    pub command: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, alias = "timeout")]
    pub timeout_seconds: Option<i64>,
    #[serde(default)]
    pub run_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

impl JobInit {
    pub fn new(id: &str, command: &str) -> Self {
        Self {
            id: id.to_owned(),
            command: command.to_owned(),
            priority: 0,
            timeout_seconds: None,
            run_at: None,
            max_retries: None,
        }
    }
}

/// A job row as persisted in the store.
#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Job {
    /// Caller-supplied unique key.
    pub id: String,
    /// Executed verbatim by the platform shell.
    pub command: String,
    pub state: JobState,
    /// Higher runs earlier.
    pub priority: i64,
    /// Incremented when a lease is taken; a freshly leased job is attempt 1.
    pub attempts: i64,
    /// Snapshot from config at enqueue. A job dies after `max_retries + 1` failed attempts.
    pub max_retries: i64,
    /// Snapshot from config at enqueue; backoff is `backoff_base ^ attempts` seconds.
    pub backoff_base: i64,
    /// Wall-clock limit per attempt, if set.
    pub timeout_seconds: Option<i64>,
    /// Earliest eligible execution time, for scheduled and backed-off jobs.
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Short description of the most recent failure.
    pub last_error: Option<String>,
    /// Identity holding the current lease. Set exactly while `state = processing`.
    pub worker_id: Option<String>,
    /// When the current lease was taken. Set exactly while `state = processing`.
    pub leased_at: Option<DateTime<Utc>>,
}

/// Filter for listing jobs through the admin surface.
#[derive(Debug, Clone, Copy, Default)]
pub struct JobFilter {
    pub state: Option<JobState>,
    pub limit: Option<i64>,
}

/// How a single execution attempt ended.
///
/// Everything except `Success` and `Cancelled` counts as a failure and routes
/// through the retry policy. `Cancelled` means shutdown interrupted the
/// attempt; the worker leaves the row in `processing` for later recovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    NonZeroExit(i32),
    TimedOut,
    SpawnError(String),
    Cancelled,
}

impl Outcome {
    /// A short description suitable for the job's `last_error` column.
    pub fn describe(&self) -> String {
        match self {
            Outcome::Success => "success".to_owned(),
            Outcome::NonZeroExit(code) => format!("command exited with status {code}"),
            Outcome::TimedOut => "attempt timed out".to_owned(),
            Outcome::SpawnError(msg) => format!("failed to spawn command: {msg}"),
            Outcome::Cancelled => "attempt cancelled by shutdown".to_owned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_state_round_trips_through_strings() {
        for state in [
            JobState::Scheduled,
            JobState::Pending,
            JobState::Processing,
            JobState::Completed,
            JobState::Failed,
            JobState::Dead,
        ] {
            assert_eq!(state.to_string().parse::<JobState>().unwrap(), state);
        }
    }

    #[test]
    fn unknown_job_state_is_rejected() {
        assert!("limbo".parse::<JobState>().is_err());
    }
}
