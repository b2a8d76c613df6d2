use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection};

use crate::config::{
    CONFIG_BACKOFF_BASE, CONFIG_MAX_RETRIES, DEFAULT_BACKOFF_BASE, DEFAULT_MAX_RETRIES,
};
use crate::error::{is_unique_violation, QueueError};
use crate::types::{Job, JobFilter, JobInit, JobState};

/// Insert a new job, snapshotting retry knobs from the config table unless
/// the init overrides them. A future `run_at` inserts as `scheduled`,
/// anything else as `pending`.
pub(crate) async fn insert_job(
    conn: &mut SqliteConnection,
    init: JobInit,
    now: DateTime<Utc>,
) -> Result<Job, QueueError> {
    validate(&init)?;

    let max_retries = match init.max_retries {
        Some(n) => n,
        None => config_int(&mut *conn, CONFIG_MAX_RETRIES, DEFAULT_MAX_RETRIES).await?,
    };
    let backoff_base = config_int(&mut *conn, CONFIG_BACKOFF_BASE, DEFAULT_BACKOFF_BASE).await?;

    let state = match init.run_at {
        Some(run_at) if run_at > now => JobState::Scheduled,
        _ => JobState::Pending,
    };

    let inserted = sqlx::query_as::<_, Job>(
        r#"
INSERT INTO jobs
    (id, command, state, priority, attempts, max_retries, backoff_base,
     timeout_seconds, run_at, created_at, last_error, worker_id, leased_at)
VALUES
    (?1, ?2, ?3, ?4, 0, ?5, ?6, ?7, ?8, ?9, NULL, NULL, NULL)
RETURNING *
        "#,
    )
    .bind(&init.id)
    .bind(&init.command)
    .bind(state)
    .bind(init.priority)
    .bind(max_retries)
    .bind(backoff_base)
    .bind(init.timeout_seconds)
    .bind(init.run_at)
    .bind(now)
    .fetch_one(conn)
    .await
    .map_err(|error| {
        if is_unique_violation(&error) {
            QueueError::Duplicate(init.id.clone())
        } else {
            error.into()
        }
    })?;

    Ok(inserted)
}

fn validate(init: &JobInit) -> Result<(), QueueError> {
    if init.id.trim().is_empty() {
        return Err(QueueError::InvalidSpec("id must not be blank".to_owned()));
    }
    if init.command.trim().is_empty() {
        return Err(QueueError::InvalidSpec(
            "command must not be blank".to_owned(),
        ));
    }
    if matches!(init.timeout_seconds, Some(t) if t <= 0) {
        return Err(QueueError::InvalidSpec(
            "timeout must be a positive number of seconds".to_owned(),
        ));
    }
    if matches!(init.max_retries, Some(n) if n < 0) {
        return Err(QueueError::InvalidSpec(
            "max_retries must not be negative".to_owned(),
        ));
    }
    Ok(())
}

pub(crate) async fn get_job<'c, E>(executor: E, id: &str) -> Result<Option<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let job = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
        .bind(id)
        .fetch_optional(executor)
        .await?;

    Ok(job)
}

/// List jobs for the admin surface, newest first.
pub(crate) async fn list_jobs<'c, E>(executor: E, filter: JobFilter) -> Result<Vec<Job>, QueueError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let mut query = QueryBuilder::new("SELECT * FROM jobs");
    if let Some(state) = filter.state {
        query.push(" WHERE state = ");
        query.push_bind(state);
    }
    query.push(" ORDER BY created_at DESC, id DESC");
    if let Some(limit) = filter.limit {
        query.push(" LIMIT ");
        query.push_bind(limit);
    }

    let jobs = query.build_query_as::<Job>().fetch_all(executor).await?;
    Ok(jobs)
}

pub(crate) async fn config_get<'c, E>(executor: E, key: &str) -> Result<Option<String>, QueueError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM config WHERE key = ?1")
        .bind(key)
        .fetch_optional(executor)
        .await?;

    Ok(value)
}

pub(crate) async fn config_set<'c, E>(executor: E, key: &str, value: &str) -> Result<(), QueueError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    sqlx::query(
        "INSERT INTO config (key, value) VALUES (?1, ?2) ON CONFLICT (key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(executor)
    .await?;

    Ok(())
}

/// Seed the recognized keys with their defaults, leaving existing values alone.
pub(crate) async fn seed_config_defaults(conn: &mut SqliteConnection) -> Result<(), QueueError> {
    for (key, value) in [
        (CONFIG_MAX_RETRIES, DEFAULT_MAX_RETRIES),
        (CONFIG_BACKOFF_BASE, DEFAULT_BACKOFF_BASE),
    ] {
        sqlx::query("INSERT OR IGNORE INTO config (key, value) VALUES (?1, ?2)")
            .bind(key)
            .bind(value.to_string())
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

// Config values are stored as text; a row that fails to parse falls back to
// the compiled-in default rather than wedging the queue.
async fn config_int(
    conn: &mut SqliteConnection,
    key: &str,
    default: i64,
) -> Result<i64, QueueError> {
    let value = config_get(&mut *conn, key).await?;
    Ok(value.and_then(|v| v.parse().ok()).unwrap_or(default))
}
