use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use crate::error::QueueError;
use crate::ops::meta::missing_row_error;
use crate::types::{Job, JobState};

/// Claim the next eligible job for `worker_id`, or report that the queue is
/// drained. Must run inside an exclusive write transaction: the select and
/// the update below are only atomic because the caller already holds the
/// store's write lock.
///
/// Eligibility and ordering follow the queue contract: `pending` rows plus
/// `scheduled`/`failed` rows whose `run_at` has passed, highest priority
/// first, then oldest, then smallest id.
pub(crate) async fn lease_next(
    conn: &mut SqliteConnection,
    worker_id: &str,
    now: DateTime<Utc>,
) -> Result<Option<Job>, QueueError> {
    let candidate: Option<Job> = sqlx::query_as::<_, Job>(
        r#"
SELECT * FROM jobs
WHERE
    state = 'pending'
    OR (state IN ('scheduled', 'failed') AND run_at <= ?1)
ORDER BY
    priority DESC,
    created_at ASC,
    id ASC
LIMIT 1
        "#,
    )
    .bind(now)
    .fetch_optional(&mut *conn)
    .await?;

    let Some(job) = candidate else {
        return Ok(None);
    };

    let leased = sqlx::query_as::<_, Job>(
        r#"
UPDATE jobs
SET
    state = 'processing',
    worker_id = ?1,
    leased_at = ?2,
    attempts = attempts + 1
WHERE id = ?3
RETURNING *
        "#,
    )
    .bind(worker_id)
    .bind(now)
    .bind(&job.id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(Some(leased))
}

/// Mark a processing job as successfully completed, releasing the lease.
pub(crate) async fn complete_job(conn: &mut SqliteConnection, id: &str) -> Result<(), QueueError> {
    let res = sqlx::query(
        r#"
UPDATE jobs
SET state = 'completed', worker_id = NULL, leased_at = NULL, last_error = NULL
WHERE id = ?1 AND state = 'processing'
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() == 0 {
        return Err(missing_row_error(conn, id, JobState::Processing).await);
    }
    Ok(())
}

/// Return a processing job to the queue as `failed`, scheduled to become
/// eligible again at `run_at`.
pub(crate) async fn fail_job(
    conn: &mut SqliteConnection,
    id: &str,
    run_at: DateTime<Utc>,
    error: &str,
) -> Result<(), QueueError> {
    let res = sqlx::query(
        r#"
UPDATE jobs
SET state = 'failed', run_at = ?1, last_error = ?2, worker_id = NULL, leased_at = NULL
WHERE id = ?3 AND state = 'processing'
        "#,
    )
    .bind(run_at)
    .bind(error)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() == 0 {
        return Err(missing_row_error(conn, id, JobState::Processing).await);
    }
    Ok(())
}

/// Move a processing job that exhausted its retry budget to the dead-letter
/// queue.
pub(crate) async fn bury_job(
    conn: &mut SqliteConnection,
    id: &str,
    error: &str,
) -> Result<(), QueueError> {
    let res = sqlx::query(
        r#"
UPDATE jobs
SET state = 'dead', run_at = NULL, last_error = ?1, worker_id = NULL, leased_at = NULL
WHERE id = ?2 AND state = 'processing'
        "#,
    )
    .bind(error)
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() == 0 {
        return Err(missing_row_error(conn, id, JobState::Processing).await);
    }
    Ok(())
}
