//! Job pointers kept in step with the builds of a job.

use buildlog_core::{BuildId, BuildStatus};
use sqlx::PgConnection;

use crate::DbResult;

/// Point `next_build_id` at the oldest build that has not completed.
pub async fn update_next_build(conn: &mut PgConnection, job_id: i64) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET next_build_id = (
            SELECT min(id) FROM builds
            WHERE job_id = $1 AND status IN ('pending', 'started')
        )
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Record a finished build. Runs inside the finishing transaction.
pub async fn update_after_finish(
    conn: &mut PgConnection,
    job_id: i64,
    build_id: BuildId,
    status: BuildStatus,
) -> DbResult<()> {
    // Compare against the latest completed build before it moves.
    update_transition_build(conn, job_id, build_id, status).await?;
    update_latest_completed_build(conn, job_id, build_id).await?;
    update_next_build(conn, job_id).await
}

async fn update_latest_completed_build(
    conn: &mut PgConnection,
    job_id: i64,
    build_id: BuildId,
) -> DbResult<()> {
    sqlx::query(
        r#"
        UPDATE jobs
        SET latest_completed_build_id = $2
        WHERE id = $1
          AND (latest_completed_build_id IS NULL OR latest_completed_build_id < $2)
        "#,
    )
    .bind(job_id)
    .bind(build_id.get())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn update_transition_build(
    conn: &mut PgConnection,
    job_id: i64,
    build_id: BuildId,
    status: BuildStatus,
) -> DbResult<()> {
    let latest: Option<(i64, String)> = sqlx::query_as(
        r#"
        SELECT b.id, b.status
        FROM jobs j
        JOIN builds b ON b.id = j.latest_completed_build_id
        WHERE j.id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(&mut *conn)
    .await?;

    if let Some((latest_id, latest_status)) = latest {
        if build_id.get() < latest_id || latest_status == status.as_str() {
            return Ok(());
        }
    }

    sqlx::query("UPDATE jobs SET transition_build_id = $2 WHERE id = $1")
        .bind(job_id)
        .bind(build_id.get())
        .execute(&mut *conn)
        .await?;
    Ok(())
}
