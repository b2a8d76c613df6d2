//! The per-process worker loop: lease, execute, commit, repeat.

use std::time::Duration;

use chrono::Utc;
use queuectl_core::{Job, Outcome, QueueError, Store, StoreConfig};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Instrument};

use crate::config::WorkerConfig;
use crate::error::WorkerError;
use crate::executor::Executor;

/// A worker to poll the store and execute jobs one at a time under a stable
/// identity. Concurrency comes from running several worker processes, not
/// from parallelism inside one.
pub struct QueueWorker {
    /// An identifier for this worker. Used to mark leases we have taken.
    worker_id: String,
    store: Store,
    executor: Executor,
    /// The interval for polling the store when the queue is drained.
    poll_interval: Duration,
    /// How long a cancelled attempt may run on before being abandoned.
    shutdown_grace: Duration,
    shutdown: CancellationToken,
}

impl QueueWorker {
    pub fn new(
        worker_id: &str,
        store: Store,
        executor: Executor,
        poll_interval: Duration,
        shutdown_grace: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            worker_id: worker_id.to_owned(),
            store,
            executor,
            poll_interval,
            shutdown_grace,
            shutdown,
        }
    }

    pub async fn from_config(
        config: &WorkerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self, WorkerError> {
        let store = Store::connect(StoreConfig::new(&config.db_path)).await?;
        Ok(Self::new(
            &config.worker_id(),
            store,
            Executor::new(&config.logs_dir),
            config.poll_interval.0,
            config.shutdown_grace.0,
            shutdown,
        ))
    }

    /// Run this worker to continuously process jobs until cancellation.
    ///
    /// A clean return means the worker drained gracefully; `Err` means a
    /// fatal store or I/O condition took it down.
    pub async fn run(&self) -> Result<(), WorkerError> {
        info!(worker_id = %self.worker_id, "worker started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }

            match self.store.lease(&self.worker_id, Utc::now()).await {
                Ok(Some(job)) => {
                    if !self.process_job(job).await? {
                        break;
                    }
                }
                Ok(None) => self.idle().await,
                Err(error) if error.is_transient() => {
                    warn!(worker_id = %self.worker_id, "lease contention: {error}");
                    self.idle().await;
                }
                Err(error) => return Err(error.into()),
            }
        }

        info!(worker_id = %self.worker_id, "worker stopped");
        Ok(())
    }

    /// Execute a leased job and write the outcome back through the retry
    /// policy. Returns `false` when shutdown abandoned the attempt; the row
    /// keeps its lease for recovery and the loop must exit.
    async fn process_job(&self, job: Job) -> Result<bool, WorkerError> {
        let span = tracing::info_span!(
            "attempt",
            job_id = %job.id,
            worker_id = %self.worker_id,
            attempt = job.attempts,
        );

        async {
            metrics::counter!("queuectl_attempts_total").increment(1);
            let started = tokio::time::Instant::now();

            let outcome = self
                .executor
                .run_attempt(&job, &self.shutdown, self.shutdown_grace)
                .await?;

            metrics::histogram!("queuectl_attempt_duration_seconds")
                .record(started.elapsed().as_secs_f64());

            if outcome == Outcome::Cancelled {
                info!("attempt interrupted by shutdown, leaving the lease in place");
                return Ok(false);
            }

            match self.store.commit_outcome(&job, &outcome, Utc::now()).await {
                Ok(()) => {}
                // Duplicate delivery; the first commit won and this one must
                // not double-apply.
                Err(QueueError::StateMismatch { actual, .. }) => {
                    warn!(%actual, "outcome already committed, skipping");
                }
                Err(error) => return Err(error.into()),
            }

            match &outcome {
                Outcome::Success => {
                    metrics::counter!("queuectl_jobs_completed_total").increment(1);
                    info!("job completed");
                }
                failure => {
                    metrics::counter!("queuectl_jobs_failed_total").increment(1);
                    warn!("attempt failed: {}", failure.describe());
                }
            }

            Ok(true)
        }
        .instrument(span)
        .await
    }

    async fn idle(&self) {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => {}
            _ = self.shutdown.cancelled() => {}
        }
    }
}
