//! Event log storage.
//!
//! Events live in per-owner partitions of `build_events` and are numbered by
//! a counter row in `build_event_sequences`. Everything here runs on the
//! caller's connection so it joins the caller's transaction.

use buildlog_core::{BuildId, EncodedEvent, EventId, EventRecord};
use sqlx::PgConnection;

use crate::repo::BuildScope;
use crate::{DbError, DbResult};

/// Start numbering events for a build at 0.
pub async fn create_sequence(conn: &mut PgConnection, build_id: BuildId) -> DbResult<()> {
    sqlx::query("INSERT INTO build_event_sequences (build_id, next_event_id) VALUES ($1, 0)")
        .bind(build_id.get())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Close the sequence; later appends fail with [`DbError::SequenceClosed`].
pub async fn drop_sequence(conn: &mut PgConnection, build_id: BuildId) -> DbResult<()> {
    sqlx::query("DELETE FROM build_event_sequences WHERE build_id = $1")
        .bind(build_id.get())
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Create the partition for `scope` if it does not exist yet.
pub async fn ensure_partition(conn: &mut PgConnection, scope: &BuildScope) -> DbResult<()> {
    let table = scope.events_table();

    // Concurrent CREATE TABLE IF NOT EXISTS can still collide on the catalog.
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(&table)
        .execute(&mut *conn)
        .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {table} () INHERITS (build_events)"
    ))
    .execute(&mut *conn)
    .await?;

    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS {table}_build_id_event_id ON {table} (build_id, event_id)"
    ))
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Append one event and return the id it was given.
pub async fn append(
    conn: &mut PgConnection,
    scope: &BuildScope,
    build_id: BuildId,
    event: &EncodedEvent,
) -> DbResult<EventId> {
    let event_id: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE build_event_sequences
        SET next_event_id = next_event_id + 1
        WHERE build_id = $1
        RETURNING next_event_id - 1
        "#,
    )
    .bind(build_id.get())
    .fetch_optional(&mut *conn)
    .await?;
    let event_id = event_id.ok_or(DbError::SequenceClosed(build_id))?;

    sqlx::query(&format!(
        "INSERT INTO {} (build_id, event_id, type, version, payload) VALUES ($1, $2, $3, $4, $5)",
        scope.events_table()
    ))
    .bind(build_id.get())
    .bind(event_id)
    .bind(&event.event_type)
    .bind(&event.version)
    .bind(serde_json::to_string(&event.payload)?)
    .execute(&mut *conn)
    .await?;

    Ok(event_id)
}

#[derive(sqlx::FromRow)]
struct EventRow {
    event_id: i64,
    #[sqlx(rename = "type")]
    event_type: String,
    version: String,
    payload: String,
}

/// Up to `limit` events of a build with ids from `from` on, in id order.
pub async fn fetch(
    conn: &mut PgConnection,
    build_id: BuildId,
    from: EventId,
    limit: u32,
) -> DbResult<Vec<EventRecord>> {
    let rows = sqlx::query_as::<_, EventRow>(
        r#"
        SELECT event_id, type, version, payload
        FROM build_events
        WHERE build_id = $1 AND event_id >= $2
        ORDER BY event_id ASC
        LIMIT $3
        "#,
    )
    .bind(build_id.get())
    .bind(from)
    .bind(i64::from(limit))
    .fetch_all(&mut *conn)
    .await?;

    rows.into_iter()
        .map(|row| {
            Ok(EventRecord {
                event_id: row.event_id,
                build_id,
                event_type: row.event_type,
                version: row.version,
                payload: serde_json::from_str(&row.payload)?,
            })
        })
        .collect()
}

/// Remove every event of a build, whichever partition holds them.
pub async fn delete_all(conn: &mut PgConnection, build_id: BuildId) -> DbResult<()> {
    sqlx::query("DELETE FROM build_events WHERE build_id = $1")
        .bind(build_id.get())
        .execute(&mut *conn)
        .await?;
    Ok(())
}
