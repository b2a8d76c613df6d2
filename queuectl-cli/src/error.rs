use queuectl_core::QueueError;
use queuectl_worker::error::{SupervisorError, WorkerError};
use thiserror::Error;

/// Exit code conventions: 0 success, 1 usage/input error, 2 runtime error,
/// 3 state violation.
pub const EXIT_USAGE: i32 = 1;
pub const EXIT_RUNTIME: i32 = 2;
pub const EXIT_STATE: i32 = 3;

#[derive(Error, Debug)]
pub enum CliError {
    #[error("{0}")]
    Usage(String),
    #[error(transparent)]
    Queue(#[from] QueueError),
    #[error(transparent)]
    Worker(#[from] WorkerError),
    #[error(transparent)]
    Supervisor(#[from] SupervisorError),
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Usage(_) => EXIT_USAGE,
            CliError::Queue(error) => queue_exit_code(error),
            CliError::Supervisor(error) => match error {
                SupervisorError::AlreadyRunning(_) | SupervisorError::NoFleet => EXIT_STATE,
                SupervisorError::Queue(inner) => queue_exit_code(inner),
                SupervisorError::Spawn(_) | SupervisorError::Liveness { .. } => EXIT_RUNTIME,
            },
            CliError::Worker(_) | CliError::Io(_) => EXIT_RUNTIME,
        }
    }
}

fn queue_exit_code(error: &QueueError) -> i32 {
    match error {
        QueueError::InvalidSpec(_)
        | QueueError::Duplicate(_)
        | QueueError::NotFound(_)
        | QueueError::ParseJobState(_) => EXIT_USAGE,
        QueueError::StateMismatch { .. } => EXIT_STATE,
        QueueError::Busy | QueueError::Database(_) | QueueError::Migrate(_) => EXIT_RUNTIME,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use queuectl_core::JobState;

    #[test]
    fn test_exit_codes_follow_the_convention() {
        assert_eq!(
            CliError::Queue(QueueError::Duplicate("x".to_owned())).exit_code(),
            EXIT_USAGE
        );
        assert_eq!(
            CliError::Queue(QueueError::StateMismatch {
                id: "x".to_owned(),
                expected: JobState::Dead,
                actual: JobState::Pending,
            })
            .exit_code(),
            EXIT_STATE
        );
        assert_eq!(CliError::Queue(QueueError::Busy).exit_code(), EXIT_RUNTIME);
        assert_eq!(
            CliError::Supervisor(SupervisorError::NoFleet).exit_code(),
            EXIT_STATE
        );
    }
}
