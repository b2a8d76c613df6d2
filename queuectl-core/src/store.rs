use std::time::Instant;

use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqlitePool, Transaction};
use tracing::{debug, warn};

use crate::config::{StoreConfig, CONFIG_BACKOFF_BASE, CONFIG_MAX_RETRIES};
use crate::error::QueueError;
use crate::ops::{admin, lease, meta, store as store_ops};
use crate::retry::{Disposition, RetryPolicy};
use crate::types::{Job, JobFilter, JobInit, JobState, Outcome};

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!();

const LEASE_RETRY_INITIAL_BACKOFF_MS: u64 = 50;
const LEASE_RETRY_MAX_BACKOFF_MS: u64 = 1_000;

/// The durable state layer: jobs and config in a single SQLite file shared by
/// the supervisor, the workers, and admin commands. All cross-process
/// serialization happens here, through the store's exclusive write
/// transactions.
pub struct Store {
    pool: SqlitePool,
    config: StoreConfig,
}

impl Store {
    pub async fn connect(config: StoreConfig) -> Result<Self, QueueError> {
        let pool = config.connect().await?;
        Ok(Self { pool, config })
    }

    // Designed mostly to be used for testing, but safe enough to expose publicly
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self {
            pool,
            config: StoreConfig::new(crate::config::STORE_FILE),
        }
    }

    /// Create tables if absent and seed config defaults. Safe to run any
    /// number of times.
    pub async fn init(&self) -> Result<(), QueueError> {
        MIGRATOR.run(&self.pool).await?;
        let mut conn = self.pool.acquire().await?;
        store_ops::seed_config_defaults(conn.as_mut()).await
    }

    /// Begin a transaction that takes the store's write lock up front.
    /// Readers proceed concurrently under WAL; writers queue behind it up to
    /// the busy timeout.
    pub async fn begin_exclusive(&self) -> Result<Transaction<'static, Sqlite>, QueueError> {
        Ok(self.pool.begin_with("BEGIN IMMEDIATE").await?)
    }

    pub async fn insert(&self, init: JobInit) -> Result<Job, QueueError> {
        self.insert_at(init, Utc::now()).await
    }

    pub async fn insert_at(&self, init: JobInit, now: DateTime<Utc>) -> Result<Job, QueueError> {
        let mut conn = self.pool.acquire().await?;
        store_ops::insert_job(conn.as_mut(), init, now).await
    }

    pub async fn get(&self, id: &str) -> Result<Option<Job>, QueueError> {
        store_ops::get_job(&self.pool, id).await
    }

    pub async fn list(&self, filter: JobFilter) -> Result<Vec<Job>, QueueError> {
        store_ops::list_jobs(&self.pool, filter).await
    }

    /// Atomically claim the next eligible job for `worker_id`.
    ///
    /// The select-then-update runs inside one exclusive transaction, which is
    /// the mechanism keeping two workers from leasing the same job. Lock
    /// contention is retried with backoff up to the store's busy timeout
    /// before surfacing as a transient [`QueueError::Busy`].
    pub async fn lease(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let deadline = Instant::now() + self.config.busy_timeout();
        let mut backoff = std::time::Duration::from_millis(LEASE_RETRY_INITIAL_BACKOFF_MS);

        loop {
            match self.try_lease(worker_id, now).await {
                Err(error) if error.is_transient() && Instant::now() + backoff < deadline => {
                    debug!(worker_id, "store busy, retrying lease");
                    tokio::time::sleep(backoff).await;
                    backoff = std::cmp::min(
                        backoff * 2,
                        std::time::Duration::from_millis(LEASE_RETRY_MAX_BACKOFF_MS),
                    );
                }
                other => return other,
            }
        }
    }

    async fn try_lease(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, QueueError> {
        let mut tx = self.begin_exclusive().await?;
        let leased = lease::lease_next(&mut tx, worker_id, now).await?;
        tx.commit().await?;
        Ok(leased)
    }

    /// Write an attempt's outcome back through the retry policy.
    ///
    /// Guarded on the row still being `processing`: a duplicate delivery
    /// fails the guard and reports [`QueueError::StateMismatch`] without
    /// touching the row, so committing an outcome twice cannot double-apply.
    pub async fn commit_outcome(
        &self,
        job: &Job,
        outcome: &Outcome,
        now: DateTime<Utc>,
    ) -> Result<(), QueueError> {
        if matches!(outcome, Outcome::Cancelled) {
            // Shutdown interrupted the attempt; the row stays leased for the
            // reaper or an operator to resolve.
            warn!(job_id = %job.id, "attempt cancelled, leaving job leased");
            return Ok(());
        }

        let mut conn = self.pool.acquire().await?;
        let policy = RetryPolicy::for_job(job);
        match policy.disposition(job.attempts, outcome, now) {
            Disposition::Complete => lease::complete_job(conn.as_mut(), &job.id).await,
            Disposition::Retry { run_at, error } => {
                lease::fail_job(conn.as_mut(), &job.id, run_at, &error).await
            }
            Disposition::Bury { error } => lease::bury_job(conn.as_mut(), &job.id, &error).await,
        }
    }

    pub async fn config_get(&self, key: &str) -> Result<Option<String>, QueueError> {
        store_ops::config_get(&self.pool, key).await
    }

    /// Set a config key. Values for the recognized retry knobs must parse as
    /// integers in range; the table itself is key-agnostic.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        match key {
            CONFIG_MAX_RETRIES => {
                value
                    .parse::<i64>()
                    .ok()
                    .filter(|n| *n >= 0)
                    .ok_or_else(|| {
                        QueueError::InvalidSpec(format!(
                            "{CONFIG_MAX_RETRIES} must be a non-negative integer, got {value:?}"
                        ))
                    })?;
            }
            CONFIG_BACKOFF_BASE => {
                value.parse::<i64>().ok().filter(|n| *n >= 1).ok_or_else(|| {
                    QueueError::InvalidSpec(format!(
                        "{CONFIG_BACKOFF_BASE} must be a positive integer, got {value:?}"
                    ))
                })?;
            }
            _ => {}
        }
        store_ops::config_set(&self.pool, key, value).await
    }

    pub async fn counts_by_state(&self) -> Result<Vec<(JobState, i64)>, QueueError> {
        let mut conn = self.pool.acquire().await?;
        meta::count_by_state(conn.as_mut()).await
    }

    /// The earliest `run_at` among scheduled jobs, if any.
    pub async fn next_scheduled_run(&self) -> Result<Option<DateTime<Utc>>, QueueError> {
        let mut conn = self.pool.acquire().await?;
        meta::next_scheduled_run(conn.as_mut()).await
    }

    pub async fn retry_dead(&self, id: &str) -> Result<(), QueueError> {
        let mut conn = self.pool.acquire().await?;
        admin::retry_dead(conn.as_mut(), id).await
    }

    pub async fn purge_dead(&self) -> Result<u64, QueueError> {
        admin::purge_dead(&self.pool).await
    }

    /// Reset rows stranded in `processing` by a fleet that died without
    /// committing outcomes. Callers must first establish that no fleet is
    /// running.
    pub async fn reclaim_abandoned(&self, note: &str) -> Result<u64, QueueError> {
        admin::reclaim_abandoned(&self.pool, note).await
    }
}
