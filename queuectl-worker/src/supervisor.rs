//! Fleet lifecycle: spawning worker processes, tracking them in the liveness
//! file, and taking them down again in an orderly way.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use queuectl_core::{Store, StoreConfig};
use tokio::process::{Child, Command};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::SupervisorError;

const RECLAIM_NOTE: &str = "reclaimed after unclean shutdown";
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// The liveness file enumerating the fleet's PIDs, parent first. Owned by the
/// supervisor; its absence means no supervised fleet exists.
pub struct LivenessFile {
    path: PathBuf,
}

impl LivenessFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the fleet's PIDs. A missing file means no fleet.
    pub fn read(&self) -> Result<Vec<u32>, SupervisorError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                return Err(SupervisorError::NoFleet)
            }
            Err(error) => {
                return Err(SupervisorError::Liveness {
                    path: self.path.clone(),
                    error,
                })
            }
        };

        Ok(contents
            .lines()
            .filter_map(|line| line.trim().parse().ok())
            .collect())
    }

    pub fn write(&self, pids: &[u32]) -> Result<(), SupervisorError> {
        let mut contents = String::new();
        for pid in pids {
            contents.push_str(&pid.to_string());
            contents.push('\n');
        }
        std::fs::write(&self.path, contents).map_err(|error| SupervisorError::Liveness {
            path: self.path.clone(),
            error,
        })
    }

    pub fn remove(&self) -> Result<(), SupervisorError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(SupervisorError::Liveness {
                path: self.path.clone(),
                error,
            }),
        }
    }
}

pub struct Supervisor {
    config: SupervisorConfig,
    liveness: LivenessFile,
}

impl Supervisor {
    pub fn new(config: SupervisorConfig) -> Self {
        let liveness = LivenessFile::new(&config.liveness_path);
        Self { config, liveness }
    }

    /// Run a fleet in this process: spawn the workers, publish the liveness
    /// file, then hold until a shutdown signal and drain.
    ///
    /// Rows stranded in `processing` by a previous fleet that died uncleanly
    /// are returned to the queue first; the liveness gate above proves no
    /// worker can still hold those leases.
    pub async fn start(&self) -> Result<(), SupervisorError> {
        self.ensure_not_running()?;

        let store = Store::connect(StoreConfig::new(&self.config.db_path)).await?;
        store.init().await?;
        let reclaimed = store.reclaim_abandoned(RECLAIM_NOTE).await?;
        if reclaimed > 0 {
            warn!(reclaimed, "returned abandoned leases to the queue");
        }

        let shutdown = CancellationToken::new();
        listen_for_shutdown(shutdown.clone());

        let mut children = Vec::with_capacity(self.config.count);
        for _ in 0..self.config.count {
            children.push(self.spawn_worker()?);
        }

        let mut pids = vec![std::process::id()];
        pids.extend(children.iter().filter_map(|child| child.id()));
        self.liveness.write(&pids)?;
        info!(count = children.len(), "fleet started");

        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("draining fleet");
                self.drain(&mut children).await;
            }
            _ = wait_all(&mut children) => {
                warn!("all workers exited on their own");
            }
        }

        self.liveness.remove()?;
        Ok(())
    }

    /// Stop a running fleet from outside: signal every PID in the liveness
    /// file, wait out the stop timeout, force-kill stragglers, and clean up
    /// the file.
    pub async fn stop(&self) -> Result<(), SupervisorError> {
        let pids = self.liveness.read()?;
        if pids.is_empty() {
            self.liveness.remove()?;
            return Err(SupervisorError::NoFleet);
        }

        // Parent first: it drains its own children on SIGTERM.
        for pid in &pids {
            if pid_alive(*pid) {
                terminate(*pid);
            }
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        while Instant::now() < deadline {
            if pids.iter().all(|pid| !pid_alive(*pid)) {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        for pid in &pids {
            if pid_alive(*pid) {
                warn!(pid = *pid, "escalating to forced termination");
                kill_hard(*pid);
            }
        }

        // The parent removes the file on a clean exit; clean up if it could not.
        self.liveness.remove()?;
        info!("fleet stopped");
        Ok(())
    }

    /// Refuse to proceed while a previous fleet's parent is still alive.
    /// A liveness file pointing at a dead parent is stale and gets cleared.
    pub fn ensure_not_running(&self) -> Result<(), SupervisorError> {
        match self.liveness.read() {
            Ok(pids) => {
                if let Some(parent) = pids.first().copied() {
                    if pid_alive(parent) {
                        return Err(SupervisorError::AlreadyRunning(parent));
                    }
                }
                warn!(path = %self.liveness.path().display(), "removing stale liveness file");
                self.liveness.remove()
            }
            Err(SupervisorError::NoFleet) => Ok(()),
            Err(error) => Err(error),
        }
    }

    fn spawn_worker(&self) -> Result<Child, SupervisorError> {
        let exe = std::env::current_exe().map_err(SupervisorError::Spawn)?;
        let worker_id = format!("worker-{}", Uuid::now_v7());

        let mut cmd = Command::new(exe);
        cmd.args(["worker", "run"])
            .env("QUEUECTL_WORKER_ID", &worker_id)
            .env("QUEUECTL_DB_PATH", &self.config.db_path)
            .env("QUEUECTL_LOGS_DIR", &self.config.logs_dir)
            .stdin(Stdio::null());

        let child = cmd.spawn().map_err(SupervisorError::Spawn)?;
        info!(worker_id = %worker_id, pid = child.id(), "spawned worker");
        Ok(child)
    }

    /// Graceful drain: ask every worker to stop, give them the stop timeout
    /// to finish their current attempt, then kill what remains.
    async fn drain(&self, children: &mut [Child]) {
        for child in children.iter() {
            if let Some(pid) = child.id() {
                terminate(pid);
            }
        }

        let deadline = Instant::now() + self.config.stop_timeout;
        loop {
            let mut alive = 0;
            for child in children.iter_mut() {
                if matches!(child.try_wait(), Ok(None)) {
                    alive += 1;
                }
            }
            if alive == 0 {
                return;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }

        warn!("graceful drain timed out, killing remaining workers");
        for child in children.iter_mut() {
            if matches!(child.try_wait(), Ok(None)) {
                drop(child.start_kill());
            }
        }
        for child in children.iter_mut() {
            drop(child.wait().await);
        }
    }
}

/// Launch a supervisor as a detached background process and wait for it to
/// publish the liveness file. This is what lets `worker start` return
/// promptly while the fleet keeps running.
pub async fn launch_detached(config: &SupervisorConfig) -> Result<Vec<u32>, SupervisorError> {
    let liveness = LivenessFile::new(&config.liveness_path);
    let exe = std::env::current_exe().map_err(SupervisorError::Spawn)?;

    let mut cmd = Command::new(exe);
    cmd.args(["worker", "supervise"])
        .arg("--count")
        .arg(config.count.to_string())
        .arg("--db")
        .arg(&config.db_path)
        .arg("--logs-dir")
        .arg(&config.logs_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::inherit());

    // Detach from the CLI's session so the fleet outlives the command.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(SupervisorError::Spawn)?;

    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        match liveness.read() {
            Ok(pids) => return Ok(pids),
            Err(SupervisorError::NoFleet) => {}
            Err(error) => return Err(error),
        }

        // A supervisor that died before publishing (say, to AlreadyRunning)
        // is not coming back.
        if let Ok(Some(status)) = child.try_wait() {
            return Err(SupervisorError::Spawn(std::io::Error::other(format!(
                "supervisor exited during startup with {status}"
            ))));
        }
        if Instant::now() >= deadline {
            return Err(SupervisorError::Spawn(std::io::Error::other(
                "supervisor did not publish the liveness file in time",
            )));
        }
        tokio::time::sleep(STOP_POLL_INTERVAL).await;
    }
}

/// Trip `shutdown` once this process is asked to stop. Installed by the
/// supervisor and by every worker process, so the fleet's graceful drain and
/// each worker loop's cancellation hang off the same kind of token.
pub fn listen_for_shutdown(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let signal = stop_signal().await;
        info!(signal, "stop requested");
        shutdown.cancel();
    });
}

// SIGTERM is what the supervisor and `worker stop` deliver; SIGINT covers an
// operator interrupting a foreground fleet.
#[cfg(unix)]
async fn stop_signal() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = int.recv() => "SIGINT",
    }
}

#[cfg(not(unix))]
async fn stop_signal() -> &'static str {
    tokio::signal::ctrl_c().await.ok();
    "ctrl-c"
}

async fn wait_all(children: &mut [Child]) {
    for child in children {
        drop(child.wait().await);
    }
}

/// Whether a PID refers to a live process.
#[cfg(unix)]
pub fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes for existence without delivering anything. EPERM still
    // means the process exists.
    let res = unsafe { libc::kill(pid as i32, 0) };
    res == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(windows)]
pub fn pid_alive(pid: u32) -> bool {
    std::process::Command::new("tasklist")
        .args(["/NH", "/FI"])
        .arg(format!("PID eq {pid}"))
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains(&pid.to_string()))
        .unwrap_or(false)
}

#[cfg(unix)]
fn terminate(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGTERM);
    }
}

#[cfg(unix)]
fn kill_hard(pid: u32) {
    unsafe {
        libc::kill(pid as i32, libc::SIGKILL);
    }
}

// Windows has no graceful signal story; both paths terminate the tree.
#[cfg(windows)]
fn terminate(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/PID"])
        .arg(pid.to_string())
        .output();
}

#[cfg(windows)]
fn kill_hard(pid: u32) {
    let _ = std::process::Command::new("taskkill")
        .args(["/T", "/F", "/PID"])
        .arg(pid.to_string())
        .output();
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn test_liveness_file_round_trip() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let liveness = LivenessFile::new(dir.path().join(".queuectl.pids"));

        assert!(matches!(liveness.read(), Err(SupervisorError::NoFleet)));

        liveness.write(&[100, 200, 300]).expect("write failed");
        assert_eq!(liveness.read().expect("read failed"), vec![100, 200, 300]);

        liveness.remove().expect("remove failed");
        assert!(matches!(liveness.read(), Err(SupervisorError::NoFleet)));

        // Removing an absent file stays quiet.
        liveness.remove().expect("second remove failed");
    }

    #[test]
    fn test_liveness_file_skips_garbage_lines() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let path = dir.path().join(".queuectl.pids");
        std::fs::write(&path, "123\n\nnot-a-pid\n456\n").expect("write failed");

        let liveness = LivenessFile::new(&path);
        assert_eq!(liveness.read().expect("read failed"), vec![123, 456]);
    }

    #[test]
    fn test_pid_alive_sees_this_process() {
        assert!(pid_alive(std::process::id()));
    }

    #[tokio::test]
    async fn test_pid_alive_sees_a_reaped_child_as_gone() {
        let mut child = Command::new("true").spawn().expect("spawn failed");
        let pid = child.id().expect("child should have a pid");
        child.wait().await.expect("wait failed");

        assert!(!pid_alive(pid));
    }

    #[tokio::test]
    async fn test_stale_liveness_file_does_not_block_start() {
        let mut child = Command::new("true").spawn().expect("spawn failed");
        let dead_pid = child.id().expect("child should have a pid");
        child.wait().await.expect("wait failed");

        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut config = SupervisorConfig::new(1, dir.path().join("queue.db"));
        config.liveness_path = dir.path().join(".queuectl.pids");

        let supervisor = Supervisor::new(config);
        supervisor
            .liveness
            .write(&[dead_pid])
            .expect("write failed");

        supervisor
            .ensure_not_running()
            .expect("stale file should be cleared");
        assert!(matches!(
            supervisor.liveness.read(),
            Err(SupervisorError::NoFleet)
        ));
    }

    #[test]
    fn test_live_parent_blocks_start() {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let mut config = SupervisorConfig::new(1, dir.path().join("queue.db"));
        config.liveness_path = dir.path().join(".queuectl.pids");

        let supervisor = Supervisor::new(config);
        supervisor
            .liveness
            .write(&[std::process::id()])
            .expect("write failed");

        assert!(matches!(
            supervisor.ensure_not_running(),
            Err(SupervisorError::AlreadyRunning(_))
        ));
    }
}
