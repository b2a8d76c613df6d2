//! Runs a single job attempt as a shell child process, capturing output to
//! per-job log files and enforcing the attempt timeout.

use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use queuectl_core::{Job, Outcome};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::WorkerError;

/// Poll cadence for child status. Bounds both timeout precision and
/// cancellation latency.
const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// How long a timed-out process tree gets between SIGTERM and SIGKILL.
const TERM_GRACE: Duration = Duration::from_secs(1);

pub struct Executor {
    logs_dir: PathBuf,
}

impl Executor {
    pub fn new(logs_dir: impl Into<PathBuf>) -> Self {
        Self {
            logs_dir: logs_dir.into(),
        }
    }

    pub fn stdout_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{job_id}.out.log"))
    }

    pub fn stderr_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir.join(format!("{job_id}.err.log"))
    }

    /// Execute one attempt of `job` and report how it ended.
    ///
    /// Job-level problems (spawn failure, non-zero exit, timeout) are
    /// outcomes, not errors; `Err` is reserved for conditions that should
    /// take the worker down, like an unwritable log directory.
    ///
    /// When `shutdown` fires mid-attempt the child keeps running for up to
    /// `shutdown_grace`; past that the attempt is abandoned as `Cancelled`
    /// and the row is left to shutdown recovery.
    pub async fn run_attempt(
        &self,
        job: &Job,
        shutdown: &CancellationToken,
        shutdown_grace: Duration,
    ) -> Result<Outcome, WorkerError> {
        let stdout = self.open_sink(self.stdout_path(&job.id))?;
        let stderr = self.open_sink(self.stderr_path(&job.id))?;

        let mut child = match spawn_shell(&job.command, stdout, stderr) {
            Ok(child) => child,
            Err(error) => return Ok(Outcome::SpawnError(error.to_string())),
        };

        let deadline = job
            .timeout_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs.unsigned_abs()));
        let mut poll = tokio::time::interval(POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut cancel_observed: Option<Instant> = None;

        loop {
            poll.tick().await;

            if let Some(status) = child.try_wait().map_err(WorkerError::ChildWait)? {
                return Ok(exit_outcome(status));
            }

            if matches!(deadline, Some(d) if Instant::now() >= d) {
                kill_tree(&mut child).await;
                return Ok(Outcome::TimedOut);
            }

            if shutdown.is_cancelled() {
                let observed = cancel_observed.get_or_insert_with(Instant::now);
                if observed.elapsed() >= shutdown_grace {
                    warn!(job_id = %job.id, "shutdown grace expired, abandoning attempt");
                    return Ok(Outcome::Cancelled);
                }
            }
        }
    }

    // Sinks are truncated on every attempt; only the latest attempt's output
    // is retained.
    fn open_sink(&self, path: PathBuf) -> Result<std::fs::File, WorkerError> {
        std::fs::create_dir_all(&self.logs_dir)
            .and_then(|_| std::fs::File::create(&path))
            .map_err(|error| WorkerError::LogSink { path, error })
    }
}

#[cfg(unix)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(command);
    cmd
}

#[cfg(windows)]
fn shell_command(command: &str) -> Command {
    let mut cmd = Command::new("cmd");
    cmd.arg("/C").arg(command);
    cmd
}

fn spawn_shell(
    command: &str,
    stdout: std::fs::File,
    stderr: std::fs::File,
) -> std::io::Result<Child> {
    let mut cmd = shell_command(command);
    cmd.stdin(Stdio::null())
        .stdout(Stdio::from(stdout))
        .stderr(Stdio::from(stderr));

    // The child gets its own session, making its PID the process-group id for
    // the whole tree it spawns. Timeout enforcement signals the group.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    // If the worker itself dies the tree should not outlive it.
    cmd.kill_on_drop(true);
    cmd.spawn()
}

fn exit_outcome(status: ExitStatus) -> Outcome {
    match status.code() {
        Some(0) => Outcome::Success,
        Some(code) => Outcome::NonZeroExit(code),
        // No exit code means the child was killed by a signal; report it the
        // way a shell would.
        None => {
            #[cfg(unix)]
            {
                use std::os::unix::process::ExitStatusExt;
                Outcome::NonZeroExit(128 + status.signal().unwrap_or(0))
            }
            #[cfg(not(unix))]
            {
                Outcome::NonZeroExit(-1)
            }
        }
    }
}

/// Terminate the child's whole process tree: ask politely, wait a moment,
/// then kill.
async fn kill_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        signal_group(pid, libc::SIGTERM);
        let deadline = Instant::now() + TERM_GRACE;
        while Instant::now() < deadline {
            if matches!(child.try_wait(), Ok(Some(_))) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        signal_group(pid, libc::SIGKILL);
    }

    #[cfg(windows)]
    if let Some(pid) = child.id() {
        let _ = Command::new("taskkill")
            .args(["/T", "/F", "/PID"])
            .arg(pid.to_string())
            .output()
            .await;
    }

    drop(child.wait().await);
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: i32) {
    // Negative PID addresses the process group created by setsid above.
    unsafe {
        libc::kill(-(pid as i32), signal);
    }
}
