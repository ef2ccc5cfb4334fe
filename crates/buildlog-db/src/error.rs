//! Database error types.

use buildlog_core::BuildId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    /// The build row was deleted concurrently (e.g. its pipeline was destroyed).
    #[error("build {0} disappeared")]
    BuildDisappeared(BuildId),

    /// The build reached a terminal status and its event sequence is gone.
    #[error("event sequence for build {0} is closed")]
    SequenceClosed(BuildId),

    /// A tailer read every event of a completed build.
    #[error("end of build event stream")]
    EndOfStream,

    /// The caller closed its own tailer.
    #[error("build event stream closed")]
    StreamClosed,

    /// Events were requested for a build that has no durable log yet.
    #[error("build has no events")]
    NoEvents,

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("not supported for in-memory check builds: {0}")]
    Unsupported(&'static str),

    #[error("listen transport: {0}")]
    Listen(String),

    #[error("listen connection error: {0}")]
    Postgres(#[from] tokio_postgres::Error),

    #[error("event encoding error: {0}")]
    Event(#[from] buildlog_core::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
