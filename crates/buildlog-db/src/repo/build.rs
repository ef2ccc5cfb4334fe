//! Build rows and their state transitions.

use async_trait::async_trait;
use buildlog_core::{BuildId, BuildStatus, EncodedEvent, Event, EventId, EventRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgConnection, PgPool};

use crate::repo::{events, jobs};
use crate::{DbError, DbResult};

/// Who a build belongs to. Decides which event partition it writes to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildScope {
    /// One-off build owned by a team.
    Team { team_id: i64 },
    /// Build of a pipeline, optionally of one of its jobs.
    Pipeline {
        team_id: i64,
        pipeline_id: i64,
        job_id: Option<i64>,
    },
}

impl BuildScope {
    pub fn team_id(&self) -> i64 {
        match self {
            BuildScope::Team { team_id } | BuildScope::Pipeline { team_id, .. } => *team_id,
        }
    }

    pub fn pipeline_id(&self) -> Option<i64> {
        match self {
            BuildScope::Team { .. } => None,
            BuildScope::Pipeline { pipeline_id, .. } => Some(*pipeline_id),
        }
    }

    pub fn job_id(&self) -> Option<i64> {
        match self {
            BuildScope::Team { .. } => None,
            BuildScope::Pipeline { job_id, .. } => *job_id,
        }
    }

    /// Partition holding this scope's events.
    pub fn events_table(&self) -> String {
        match self {
            BuildScope::Team { team_id } => format!("team_build_events_{}", team_id),
            BuildScope::Pipeline { pipeline_id, .. } => {
                format!("pipeline_build_events_{}", pipeline_id)
            }
        }
    }
}

/// A build row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub id: BuildId,
    pub name: String,
    pub status: BuildStatus,
    pub scope: BuildScope,
    pub check: bool,
    pub interceptible: bool,
    pub drained: bool,
    pub aborted: bool,
    pub completed: bool,
    pub tracked_by: Option<String>,
    pub create_time: DateTime<Utc>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub reap_time: Option<DateTime<Utc>>,
}

/// The pointers a job keeps to its builds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct JobRecord {
    pub id: i64,
    pub next_build_id: Option<i64>,
    pub latest_completed_build_id: Option<i64>,
    pub transition_build_id: Option<i64>,
}

/// One page of a build's events.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventPage {
    pub events: Vec<EventRecord>,
    /// Whether the build had completed before the events were read. When set,
    /// nothing beyond this page's end will ever be appended.
    pub completed: bool,
}

/// Storage for builds. Every operation is atomic: it either applies fully or
/// leaves nothing behind. Operations on a row that no longer exists fail with
/// [`DbError::BuildDisappeared`].
#[async_trait]
pub trait BuildRepo: Send + Sync {
    /// Insert a pending build together with its event sequence and partition.
    async fn create(&self, scope: &BuildScope, name: &str) -> DbResult<BuildRecord>;

    /// Insert an already started check build and write `events` as its first
    /// events, in order.
    async fn create_started_check(
        &self,
        scope: &BuildScope,
        name: &str,
        events: &[EncodedEvent],
    ) -> DbResult<BuildRecord>;

    async fn get(&self, id: BuildId) -> DbResult<Option<BuildRecord>>;

    /// Move a pending, non-aborted build to started and append its start
    /// event. `None` when the build was not pending any more.
    async fn start(&self, id: BuildId, tracked_by: &str) -> DbResult<Option<BuildRecord>>;

    async fn save_event(
        &self,
        id: BuildId,
        scope: &BuildScope,
        event: &EncodedEvent,
    ) -> DbResult<EventId>;

    /// Move a build to a terminal status, append the status event, close the
    /// sequence and update the job's pointers.
    async fn finish(
        &self,
        id: BuildId,
        scope: &BuildScope,
        status: BuildStatus,
    ) -> DbResult<BuildRecord>;

    async fn mark_aborted(&self, id: BuildId) -> DbResult<()>;

    async fn is_aborted(&self, id: BuildId) -> DbResult<bool>;

    async fn set_interceptible(&self, id: BuildId, interceptible: bool) -> DbResult<()>;

    async fn interceptible(&self, id: BuildId) -> DbResult<bool>;

    async fn set_drained(&self, id: BuildId, drained: bool) -> DbResult<()>;

    /// Remove a build and all of its events.
    async fn delete(&self, id: BuildId) -> DbResult<()>;

    /// Up to `limit` events from `from` on, plus whether the build completed
    /// before they were read.
    async fn events(&self, id: BuildId, from: EventId, limit: u32) -> DbResult<EventPage>;

    async fn job(&self, job_id: i64) -> DbResult<Option<JobRecord>>;
}

const BUILD_COLUMNS: &str = "id, name, status, team_id, pipeline_id, job_id, check_build, \
    interceptible, drained, aborted, completed, tracked_by, create_time, start_time, end_time, \
    reap_time";

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: i64,
    name: String,
    status: String,
    team_id: i64,
    pipeline_id: Option<i64>,
    job_id: Option<i64>,
    check_build: bool,
    interceptible: bool,
    drained: bool,
    aborted: bool,
    completed: bool,
    tracked_by: Option<String>,
    create_time: DateTime<Utc>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    reap_time: Option<DateTime<Utc>>,
}

impl TryFrom<BuildRow> for BuildRecord {
    type Error = DbError;

    fn try_from(row: BuildRow) -> DbResult<Self> {
        let scope = match row.pipeline_id {
            Some(pipeline_id) => BuildScope::Pipeline {
                team_id: row.team_id,
                pipeline_id,
                job_id: row.job_id,
            },
            None => BuildScope::Team {
                team_id: row.team_id,
            },
        };

        Ok(BuildRecord {
            id: BuildId::new(row.id),
            name: row.name,
            status: row.status.parse()?,
            scope,
            check: row.check_build,
            interceptible: row.interceptible,
            drained: row.drained,
            aborted: row.aborted,
            completed: row.completed,
            tracked_by: row.tracked_by,
            create_time: row.create_time,
            start_time: row.start_time,
            end_time: row.end_time,
            reap_time: row.reap_time,
        })
    }
}

fn status_event(status: BuildStatus, at: Option<DateTime<Utc>>) -> DbResult<EncodedEvent> {
    let time = at.unwrap_or_else(Utc::now).timestamp();
    Ok(Event::Status { status, time }.encode()?)
}

/// PostgreSQL implementation of BuildRepo.
pub struct PgBuildRepo {
    pool: PgPool,
}

impl PgBuildRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn exists(conn: &mut PgConnection, id: BuildId) -> DbResult<bool> {
        let exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM builds WHERE id = $1)")
            .bind(id.get())
            .fetch_one(&mut *conn)
            .await?;
        Ok(exists)
    }

    async fn insert(
        conn: &mut PgConnection,
        scope: &BuildScope,
        name: &str,
        started: bool,
    ) -> DbResult<BuildRecord> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            INSERT INTO builds (name, team_id, pipeline_id, job_id, status, check_build, start_time)
            VALUES ($1, $2, $3, $4, $5, $6, CASE WHEN $6 THEN now() END)
            RETURNING {BUILD_COLUMNS}
            "#
        ))
        .bind(name)
        .bind(scope.team_id())
        .bind(scope.pipeline_id())
        .bind(scope.job_id())
        .bind(if started {
            BuildStatus::Started.as_str()
        } else {
            BuildStatus::Pending.as_str()
        })
        .bind(started)
        .fetch_one(&mut *conn)
        .await?;
        let record = BuildRecord::try_from(row)?;

        events::ensure_partition(conn, scope).await?;
        events::create_sequence(conn, record.id).await?;

        Ok(record)
    }

    async fn update_flag(&self, id: BuildId, column: &str, value: bool) -> DbResult<()> {
        let result = sqlx::query(&format!("UPDATE builds SET {column} = $2 WHERE id = $1"))
            .bind(id.get())
            .bind(value)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::BuildDisappeared(id));
        }
        Ok(())
    }

    async fn read_flag(&self, id: BuildId, column: &str) -> DbResult<bool> {
        let value: Option<bool> =
            sqlx::query_scalar(&format!("SELECT {column} FROM builds WHERE id = $1"))
                .bind(id.get())
                .fetch_optional(&self.pool)
                .await?;
        value.ok_or(DbError::BuildDisappeared(id))
    }
}

#[async_trait]
impl BuildRepo for PgBuildRepo {
    async fn create(&self, scope: &BuildScope, name: &str) -> DbResult<BuildRecord> {
        let mut tx = self.pool.begin().await?;
        let record = Self::insert(&mut tx, scope, name, false).await?;
        if let Some(job_id) = scope.job_id() {
            jobs::update_next_build(&mut tx, job_id).await?;
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn create_started_check(
        &self,
        scope: &BuildScope,
        name: &str,
        buffered: &[EncodedEvent],
    ) -> DbResult<BuildRecord> {
        let mut tx = self.pool.begin().await?;
        let record = Self::insert(&mut tx, scope, name, true).await?;
        for event in buffered {
            events::append(&mut tx, scope, record.id, event).await?;
        }
        tx.commit().await?;
        Ok(record)
    }

    async fn get(&self, id: BuildId) -> DbResult<Option<BuildRecord>> {
        let row = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT {BUILD_COLUMNS} FROM builds WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;
        row.map(BuildRecord::try_from).transpose()
    }

    async fn start(&self, id: BuildId, tracked_by: &str) -> DbResult<Option<BuildRecord>> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            UPDATE builds
            SET status = 'started', start_time = now(), tracked_by = $2
            WHERE id = $1 AND status = 'pending' AND NOT aborted
            RETURNING {BUILD_COLUMNS}
            "#
        ))
        .bind(id.get())
        .bind(tracked_by)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            if Self::exists(&mut tx, id).await? {
                return Ok(None);
            }
            return Err(DbError::BuildDisappeared(id));
        };
        let record = BuildRecord::try_from(row)?;

        let event = status_event(BuildStatus::Started, record.start_time)?;
        events::append(&mut tx, &record.scope, id, &event).await?;

        tx.commit().await?;
        Ok(Some(record))
    }

    async fn save_event(
        &self,
        id: BuildId,
        scope: &BuildScope,
        event: &EncodedEvent,
    ) -> DbResult<EventId> {
        let mut tx = self.pool.begin().await?;
        let event_id = match events::append(&mut tx, scope, id, event).await {
            Ok(event_id) => event_id,
            Err(DbError::SequenceClosed(_)) if Self::exists(&mut tx, id).await? => {
                return Err(DbError::SequenceClosed(id));
            }
            Err(DbError::SequenceClosed(_)) => return Err(DbError::BuildDisappeared(id)),
            Err(e) => return Err(e),
        };
        tx.commit().await?;
        Ok(event_id)
    }

    async fn finish(
        &self,
        id: BuildId,
        scope: &BuildScope,
        status: BuildStatus,
    ) -> DbResult<BuildRecord> {
        if !status.is_terminal() {
            return Err(DbError::InvalidTransition(format!(
                "cannot finish build {} with status {}",
                id, status
            )));
        }

        let mut tx = self.pool.begin().await?;

        let row = sqlx::query_as::<_, BuildRow>(&format!(
            r#"
            UPDATE builds
            SET status = $2, end_time = now(), completed = true
            WHERE id = $1
            RETURNING {BUILD_COLUMNS}
            "#
        ))
        .bind(id.get())
        .bind(status.as_str())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(DbError::BuildDisappeared(id))?;
        let record = BuildRecord::try_from(row)?;

        let event = status_event(status, record.end_time)?;
        events::append(&mut tx, scope, id, &event).await?;
        events::drop_sequence(&mut tx, id).await?;

        if let Some(job_id) = record.scope.job_id() {
            jobs::update_after_finish(&mut tx, job_id, id, status).await?;
        }

        tx.commit().await?;
        Ok(record)
    }

    async fn mark_aborted(&self, id: BuildId) -> DbResult<()> {
        self.update_flag(id, "aborted", true).await
    }

    async fn is_aborted(&self, id: BuildId) -> DbResult<bool> {
        self.read_flag(id, "aborted").await
    }

    async fn set_interceptible(&self, id: BuildId, interceptible: bool) -> DbResult<()> {
        self.update_flag(id, "interceptible", interceptible).await
    }

    async fn interceptible(&self, id: BuildId) -> DbResult<bool> {
        self.read_flag(id, "interceptible").await
    }

    async fn set_drained(&self, id: BuildId, drained: bool) -> DbResult<()> {
        self.update_flag(id, "drained", drained).await
    }

    async fn delete(&self, id: BuildId) -> DbResult<()> {
        let mut tx = self.pool.begin().await?;

        events::delete_all(&mut tx, id).await?;
        let result = sqlx::query("DELETE FROM builds WHERE id = $1")
            .bind(id.get())
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(DbError::BuildDisappeared(id));
        }

        tx.commit().await?;
        Ok(())
    }

    async fn events(&self, id: BuildId, from: EventId, limit: u32) -> DbResult<EventPage> {
        let mut tx = self.pool.begin().await?;

        // Read the flag first: events that committed before completion are
        // then guaranteed to be visible to the query below.
        let completed: bool = sqlx::query_scalar("SELECT completed FROM builds WHERE id = $1")
            .bind(id.get())
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(DbError::BuildDisappeared(id))?;

        let events = events::fetch(&mut tx, id, from, limit).await?;
        tx.commit().await?;

        Ok(EventPage { events, completed })
    }

    async fn job(&self, job_id: i64) -> DbResult<Option<JobRecord>> {
        let job = sqlx::query_as::<_, JobRecord>(
            r#"
            SELECT id, next_build_id, latest_completed_build_id, transition_build_id
            FROM jobs
            WHERE id = $1
            "#,
        )
        .bind(job_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(job)
    }
}
