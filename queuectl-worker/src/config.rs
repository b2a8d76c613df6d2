use std::path::PathBuf;
use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

/// File enumerating the PIDs of the supervised fleet, parent first. Its
/// absence means no fleet is running.
pub const LIVENESS_FILE: &str = ".queuectl.pids";

/// Directory receiving per-job output capture files.
pub const DEFAULT_LOGS_DIR: &str = "logs";

/// Configuration of a single worker process. The supervisor sets these
/// variables when spawning workers; a worker run by hand picks up the same
/// defaults as the rest of the CLI.
#[derive(Envconfig, Clone, Debug)]
pub struct WorkerConfig {
    /// Stable identity under which leases are taken. Generated by the
    /// supervisor; a standalone worker derives one from its PID.
    #[envconfig(from = "QUEUECTL_WORKER_ID")]
    pub worker_id: Option<String>,

    #[envconfig(from = "QUEUECTL_DB_PATH", default = "queue.db")]
    pub db_path: PathBuf,

    #[envconfig(from = "QUEUECTL_LOGS_DIR", default = "logs")]
    pub logs_dir: PathBuf,

    /// How long to sleep between lease attempts when the queue is drained.
    #[envconfig(from = "QUEUECTL_POLL_INTERVAL_MS", default = "500")]
    pub poll_interval: EnvMsDuration,

    /// How long a cancelled attempt may keep running before the executor
    /// abandons it. Kept under the supervisor's stop timeout so a graceful
    /// worker exits before it is escalated to a kill.
    #[envconfig(from = "QUEUECTL_SHUTDOWN_GRACE_MS", default = "4000")]
    pub shutdown_grace: EnvMsDuration,
}

impl WorkerConfig {
    pub fn worker_id(&self) -> String {
        match &self.worker_id {
            Some(id) => id.clone(),
            None => format!("worker-{}", std::process::id()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// Configuration of a supervised fleet, assembled by the CLI.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub count: usize,
    pub db_path: PathBuf,
    pub logs_dir: PathBuf,
    pub liveness_path: PathBuf,
    /// Bounded wait between asking workers to stop and killing them.
    pub stop_timeout: time::Duration,
}

impl SupervisorConfig {
    pub fn new(count: usize, db_path: impl Into<PathBuf>) -> Self {
        Self {
            count,
            db_path: db_path.into(),
            logs_dir: PathBuf::from(DEFAULT_LOGS_DIR),
            liveness_path: PathBuf::from(LIVENESS_FILE),
            stop_timeout: time::Duration::from_secs(5),
        }
    }
}
