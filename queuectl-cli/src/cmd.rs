use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use envconfig::Envconfig;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use queuectl_core::{
    Job, JobFilter, JobInit, JobState, QueueError, Store, StoreConfig, CONFIG_BACKOFF_BASE,
    CONFIG_MAX_RETRIES, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES,
};
use queuectl_worker::config::{SupervisorConfig, WorkerConfig, DEFAULT_LOGS_DIR};
use queuectl_worker::supervisor::{self, pid_alive, LivenessFile, Supervisor};
use queuectl_worker::worker::QueueWorker;

use crate::error::{CliError, EXIT_USAGE};

#[derive(Parser)]
#[command(name = "queuectl", version, about = "Persistent background job queue", long_about = None)]
pub struct Cli {
    /// Path to the queue store file
    #[arg(long, global = true, default_value = queuectl_core::STORE_FILE)]
    db: PathBuf,

    /// Directory receiving per-job output logs
    #[arg(long, global = true, default_value = DEFAULT_LOGS_DIR)]
    logs_dir: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the store and its tables if absent
    Init,

    /// Insert a job into the queue
    Enqueue(EnqueueArgs),

    /// List jobs
    List {
        /// Only show jobs in this state
        #[arg(long)]
        state: Option<String>,
        #[arg(long)]
        limit: Option<i64>,
    },

    /// Inspect and replay the dead-letter queue
    Dlq {
        #[command(subcommand)]
        cmd: DlqCommand,
    },

    /// Read or change queue configuration
    Config {
        #[command(subcommand)]
        cmd: ConfigCommand,
    },

    /// Manage the worker fleet
    Worker {
        #[command(subcommand)]
        cmd: WorkerCommand,
    },

    /// Summary counts by state and the live worker PIDs
    Status,

    /// Print a job's captured output
    Logs {
        id: String,
        /// Print the stderr capture instead of stdout
        #[arg(long)]
        stderr: bool,
    },
}

#[derive(Args)]
pub struct EnqueueArgs {
    /// Unique job id
    #[arg(long)]
    id: Option<String>,

    /// Shell command to execute
    #[arg(long)]
    command: Option<String>,

    /// Higher runs earlier
    #[arg(long, default_value_t = 0)]
    priority: i64,

    /// Per-attempt wall-clock limit in seconds
    #[arg(long)]
    timeout: Option<i64>,

    /// Earliest execution time, RFC 3339
    #[arg(long)]
    run_at: Option<String>,

    /// Override the configured retry budget for this job
    #[arg(long)]
    max_retries: Option<i64>,

    /// Full job spec as a JSON record instead of flags
    #[arg(long, conflicts_with_all = ["id", "command"])]
    json: Option<String>,
}

impl EnqueueArgs {
    fn into_init(self) -> Result<JobInit, CliError> {
        if let Some(json) = self.json {
            return serde_json::from_str(&json)
                .map_err(|error| CliError::Usage(format!("invalid job spec JSON: {error}")));
        }

        let id = self
            .id
            .ok_or_else(|| CliError::Usage("--id is required".to_owned()))?;
        let command = self
            .command
            .ok_or_else(|| CliError::Usage("--command is required".to_owned()))?;
        let run_at = self.run_at.as_deref().map(parse_run_at).transpose()?;

        Ok(JobInit {
            id,
            command,
            priority: self.priority,
            timeout_seconds: self.timeout,
            run_at,
            max_retries: self.max_retries,
        })
    }
}

#[derive(Subcommand)]
pub enum DlqCommand {
    /// List dead jobs
    List {
        #[arg(long)]
        limit: Option<i64>,
    },
    /// Return a dead job to the queue with a fresh retry budget
    Retry { id: String },
    /// Delete all dead jobs
    Purge,
}

#[derive(Subcommand)]
pub enum ConfigCommand {
    /// Set a config key (max_retries, backoff_base)
    Set { key: String, value: String },
    /// Print a config key
    Get { key: String },
}

#[derive(Subcommand)]
pub enum WorkerCommand {
    /// Start a fleet of background worker processes
    Start {
        #[arg(long, default_value_t = 1)]
        count: usize,
    },
    /// Stop the running fleet
    Stop,
    /// Run a single worker in the foreground. Spawned by the supervisor.
    #[command(hide = true)]
    Run,
    /// Supervise a fleet in the foreground. Spawned by `worker start`.
    #[command(hide = true)]
    Supervise {
        #[arg(long)]
        count: usize,
    },
}

impl Cli {
    pub async fn run() -> Result<(), CliError> {
        let cli = match Cli::try_parse() {
            Ok(cli) => cli,
            Err(error) => {
                let displayed = matches!(
                    error.kind(),
                    clap::error::ErrorKind::DisplayHelp | clap::error::ErrorKind::DisplayVersion
                );
                drop(error.print());
                if displayed {
                    return Ok(());
                }
                std::process::exit(EXIT_USAGE);
            }
        };

        cli.dispatch().await
    }

    async fn dispatch(self) -> Result<(), CliError> {
        let Cli {
            db,
            logs_dir,
            command,
        } = self;

        match command {
            Commands::Init => {
                let store = connect(&db).await?;
                store.init().await?;
                println!("store initialized at {}", db.display());
            }

            Commands::Enqueue(args) => {
                let store = connect(&db).await?;
                let job = store.insert(args.into_init()?).await?;
                println!("enqueued {} ({})", job.id, job.state);
            }

            Commands::List { state, limit } => {
                let state = state.as_deref().map(str::parse).transpose()?;
                let store = connect(&db).await?;
                let jobs = store.list(JobFilter { state, limit }).await?;
                print_jobs(&jobs);
            }

            Commands::Dlq { cmd } => {
                let store = connect(&db).await?;
                match cmd {
                    DlqCommand::List { limit } => {
                        let jobs = store
                            .list(JobFilter {
                                state: Some(JobState::Dead),
                                limit,
                            })
                            .await?;
                        print_jobs(&jobs);
                    }
                    DlqCommand::Retry { id } => {
                        store.retry_dead(&id).await?;
                        println!("job {id} returned to the queue");
                    }
                    DlqCommand::Purge => {
                        let purged = store.purge_dead().await?;
                        println!("purged {purged} dead jobs");
                    }
                }
            }

            Commands::Config { cmd } => {
                let store = connect(&db).await?;
                match cmd {
                    ConfigCommand::Set { key, value } => {
                        ensure_recognized_key(&key)?;
                        store.config_set(&key, &value).await?;
                        println!("{key} = {value}");
                    }
                    ConfigCommand::Get { key } => {
                        ensure_recognized_key(&key)?;
                        let value = match store.config_get(&key).await? {
                            Some(value) => value,
                            None => default_for(&key).to_string(),
                        };
                        println!("{value}");
                    }
                }
            }

            Commands::Worker { cmd } => {
                run_worker_command(cmd, &db, &logs_dir).await?;
            }

            Commands::Status => {
                let store = connect(&db).await?;
                print_status(&store).await?;
            }

            Commands::Logs { id, stderr } => {
                let store = connect(&db).await?;
                if store.get(&id).await?.is_none() {
                    return Err(QueueError::NotFound(id).into());
                }

                let suffix = if stderr { "err" } else { "out" };
                let path = logs_dir.join(format!("{id}.{suffix}.log"));
                match std::fs::read_to_string(&path) {
                    Ok(contents) => print!("{contents}"),
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                        warn!(path = %path.display(), "no captured output for this job yet");
                    }
                    Err(error) => return Err(error.into()),
                }
            }
        }

        Ok(())
    }
}

async fn run_worker_command(
    cmd: WorkerCommand,
    db: &Path,
    logs_dir: &Path,
) -> Result<(), CliError> {
    match cmd {
        WorkerCommand::Start { count } => {
            if count == 0 {
                return Err(CliError::Usage("--count must be at least 1".to_owned()));
            }

            let mut config = SupervisorConfig::new(count, db);
            config.logs_dir = logs_dir.to_path_buf();

            // Fail fast with a state error before forking anything off.
            Supervisor::new(config.clone()).ensure_not_running()?;

            let pids = supervisor::launch_detached(&config).await?;
            let parent = pids.first().copied().unwrap_or_default();
            println!("started {count} workers (supervisor pid {parent})");
        }

        WorkerCommand::Stop => {
            let mut config = SupervisorConfig::new(0, db);
            config.logs_dir = logs_dir.to_path_buf();
            Supervisor::new(config).stop().await?;
            println!("fleet stopped");
        }

        WorkerCommand::Run => {
            let config = WorkerConfig::init_from_env()
                .map_err(|error| CliError::Usage(format!("invalid worker environment: {error}")))?;

            let shutdown = CancellationToken::new();
            supervisor::listen_for_shutdown(shutdown.clone());

            let worker = QueueWorker::from_config(&config, shutdown).await?;
            worker.run().await?;
        }

        WorkerCommand::Supervise { count } => {
            let mut config = SupervisorConfig::new(count, db);
            config.logs_dir = logs_dir.to_path_buf();
            Supervisor::new(config).start().await?;
        }
    }

    Ok(())
}

async fn connect(db: &Path) -> Result<Store, CliError> {
    Ok(Store::connect(StoreConfig::new(db)).await?)
}

fn parse_run_at(s: &str) -> Result<DateTime<Utc>, CliError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| CliError::Usage(format!("invalid run_at timestamp {s:?}: {error}")))
}

fn ensure_recognized_key(key: &str) -> Result<(), CliError> {
    match key {
        CONFIG_MAX_RETRIES | CONFIG_BACKOFF_BASE => Ok(()),
        other => Err(CliError::Usage(format!(
            "unrecognized config key {other:?}; expected {CONFIG_MAX_RETRIES} or {CONFIG_BACKOFF_BASE}"
        ))),
    }
}

fn default_for(key: &str) -> i64 {
    match key {
        CONFIG_MAX_RETRIES => DEFAULT_MAX_RETRIES,
        _ => DEFAULT_BACKOFF_BASE,
    }
}

fn print_jobs(jobs: &[Job]) {
    if jobs.is_empty() {
        println!("no jobs");
        return;
    }

    println!(
        "{:<28} {:<10} {:>8} {:>8}  {:<19}  {}",
        "ID", "STATE", "PRIORITY", "ATTEMPTS", "CREATED", "LAST ERROR"
    );
    for job in jobs {
        println!(
            "{:<28} {:<10} {:>8} {:>8}  {:<19}  {}",
            job.id,
            job.state,
            job.priority,
            job.attempts,
            job.created_at.format("%Y-%m-%d %H:%M:%S"),
            job.last_error.as_deref().unwrap_or("-"),
        );
    }
}

async fn print_status(store: &Store) -> Result<(), CliError> {
    let counts = store.counts_by_state().await?;
    let count_of = |state: JobState| {
        counts
            .iter()
            .find(|(s, _)| *s == state)
            .map(|(_, n)| *n)
            .unwrap_or(0)
    };

    println!("jobs:");
    for state in [
        JobState::Scheduled,
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ] {
        println!("  {:<12} {}", state, count_of(state));
    }
    if let Some(next) = store.next_scheduled_run().await? {
        println!("next scheduled run: {}", next.to_rfc3339());
    }

    let liveness = LivenessFile::new(queuectl_worker::config::LIVENESS_FILE);
    match liveness.read() {
        Ok(pids) => {
            println!("workers:");
            let mut pids = pids.into_iter();
            if let Some(parent) = pids.next() {
                println!(
                    "  supervisor {} ({})",
                    parent,
                    if pid_alive(parent) { "alive" } else { "gone" }
                );
            }
            for pid in pids {
                println!(
                    "  worker     {} ({})",
                    pid,
                    if pid_alive(pid) { "alive" } else { "gone" }
                );
            }
        }
        Err(_) => println!("workers: none"),
    }

    Ok(())
}
