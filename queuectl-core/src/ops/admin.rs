use sqlx::{Sqlite, SqliteConnection};

use crate::error::QueueError;
use crate::ops::meta::missing_row_error;
use crate::types::JobState;

/// Send a dead job back to the queue with a fresh retry budget. Retrying a
/// job in any other state is a state violation.
pub(crate) async fn retry_dead(conn: &mut SqliteConnection, id: &str) -> Result<(), QueueError> {
    let res = sqlx::query(
        r#"
UPDATE jobs
SET state = 'pending', attempts = 0, last_error = NULL, run_at = NULL,
    worker_id = NULL, leased_at = NULL
WHERE id = ?1 AND state = 'dead'
        "#,
    )
    .bind(id)
    .execute(&mut *conn)
    .await?;

    if res.rows_affected() == 0 {
        return Err(missing_row_error(conn, id, JobState::Dead).await);
    }
    Ok(())
}

pub(crate) async fn purge_dead<'c, E>(executor: E) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let res = sqlx::query("DELETE FROM jobs WHERE state = 'dead'")
        .execute(executor)
        .await?;

    Ok(res.rows_affected())
}

/// Reclaim rows a dead fleet left in `processing`. Only safe to run when no
/// workers are alive, which the supervisor's liveness check establishes
/// before calling this. Attempt counts are preserved.
pub(crate) async fn reclaim_abandoned<'c, E>(executor: E, note: &str) -> Result<u64, QueueError>
where
    E: sqlx::Executor<'c, Database = Sqlite>,
{
    let res = sqlx::query(
        r#"
UPDATE jobs
SET state = 'pending', worker_id = NULL, leased_at = NULL, last_error = ?1
WHERE state = 'processing'
        "#,
    )
    .bind(note)
    .execute(executor)
    .await?;

    Ok(res.rows_affected())
}
