use sqlx::SqliteConnection;

use crate::error::QueueError;
use crate::types::{Job, JobState};

/// Resolve a guarded UPDATE that affected zero rows into the precise error:
/// the row either does not exist, or is not in the state the caller expected.
pub(crate) async fn missing_row_error(
    conn: &mut SqliteConnection,
    id: &str,
    expected: JobState,
) -> QueueError {
    let found: Result<Option<Job>, sqlx::Error> =
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await;

    match found {
        Ok(Some(job)) => QueueError::StateMismatch {
            id: id.to_owned(),
            expected,
            actual: job.state,
        },
        Ok(None) => QueueError::NotFound(id.to_owned()),
        Err(error) => error.into(),
    }
}

pub(crate) async fn count_by_state(
    conn: &mut SqliteConnection,
) -> Result<Vec<(JobState, i64)>, QueueError> {
    let rows = sqlx::query_as::<_, (JobState, i64)>(
        "SELECT state, COUNT(*) FROM jobs GROUP BY state ORDER BY state",
    )
    .fetch_all(conn)
    .await?;

    Ok(rows)
}

pub(crate) async fn next_scheduled_run(
    conn: &mut SqliteConnection,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, QueueError> {
    let next = sqlx::query_scalar::<_, Option<chrono::DateTime<chrono::Utc>>>(
        "SELECT MIN(run_at) FROM jobs WHERE state = 'scheduled'",
    )
    .fetch_one(conn)
    .await?;

    Ok(next)
}
