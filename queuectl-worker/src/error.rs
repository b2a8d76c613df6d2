use std::path::PathBuf;

use queuectl_core::QueueError;
use thiserror::Error;

/// Errors that terminate a worker. Job-level failures are not errors here;
/// they flow through [`queuectl_core::Outcome`] and the retry policy.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to open log sink {path}: {error}")]
    LogSink {
        path: PathBuf,
        error: std::io::Error,
    },
    #[error("failed to wait on child process: {0}")]
    ChildWait(std::io::Error),
}

/// Errors from fleet lifecycle management.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("a fleet is already running (parent pid {0})")]
    AlreadyRunning(u32),
    #[error("no fleet is running")]
    NoFleet,
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error("failed to spawn worker process: {0}")]
    Spawn(std::io::Error),
    #[error("liveness file {path}: {error}")]
    Liveness {
        path: PathBuf,
        error: std::io::Error,
    },
}
