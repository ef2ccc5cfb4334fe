//! Tracking locks: at most one process drives a given build at a time.
//!
//! Acquisition never blocks. A `None` result means somebody else holds the
//! lock and the caller should leave the build alone.

use async_trait::async_trait;
use buildlog_core::BuildId;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::pool::PoolConnection;
use sqlx::postgres::Postgres;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::warn;

use crate::DbResult;

/// What a check build checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckableKind {
    Resource,
    ResourceType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockId {
    BuildTracking(BuildId),
    CheckBuildTracking { kind: CheckableKind, id: i64 },
}

impl LockId {
    /// Key used with PostgreSQL advisory locks. The top byte holds the lock
    /// namespace, the rest the id.
    pub fn advisory_key(&self) -> i64 {
        let (namespace, id) = match self {
            LockId::BuildTracking(build_id) => (1_i64, build_id.get()),
            LockId::CheckBuildTracking {
                kind: CheckableKind::Resource,
                id,
            } => (2, *id),
            LockId::CheckBuildTracking {
                kind: CheckableKind::ResourceType,
                id,
            } => (3, *id),
        };
        (namespace << 56) | (id & 0x00FF_FFFF_FFFF_FFFF)
    }
}

/// A held lock. Released explicitly or when dropped.
#[async_trait]
pub trait Lock: Send + Sync {
    fn id(&self) -> LockId;

    /// Release the lock. Releasing twice is a no-op.
    async fn release(&mut self) -> DbResult<()>;
}

#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Try to take `id`; `None` if it is already held.
    async fn acquire(&self, id: LockId) -> DbResult<Option<Box<dyn Lock>>>;
}

/// Locks held by this process.
#[derive(Clone, Default)]
pub struct LocalLockFactory {
    held: Arc<Mutex<HashSet<LockId>>>,
}

impl LocalLockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    fn try_take(&self, id: LockId) -> Option<LocalLock> {
        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        if !held.insert(id) {
            return None;
        }
        Some(LocalLock {
            id,
            held: Some(self.held.clone()),
        })
    }
}

#[async_trait]
impl LockFactory for LocalLockFactory {
    async fn acquire(&self, id: LockId) -> DbResult<Option<Box<dyn Lock>>> {
        Ok(self
            .try_take(id)
            .map(|lock| Box::new(lock) as Box<dyn Lock>))
    }
}

pub struct LocalLock {
    id: LockId,
    held: Option<Arc<Mutex<HashSet<LockId>>>>,
}

impl LocalLock {
    fn free(&mut self) {
        if let Some(held) = self.held.take() {
            held.lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&self.id);
        }
    }
}

#[async_trait]
impl Lock for LocalLock {
    fn id(&self) -> LockId {
        self.id
    }

    async fn release(&mut self) -> DbResult<()> {
        self.free();
        Ok(())
    }
}

impl Drop for LocalLock {
    fn drop(&mut self) {
        self.free();
    }
}

/// Cluster-wide locks on PostgreSQL advisory locks.
///
/// Advisory locks are re-entrant within a session, so each lock keeps its own
/// pooled connection and the in-process registry rejects a second holder in
/// this process before the database is asked.
pub struct PgLockFactory {
    pool: PgPool,
    local: LocalLockFactory,
}

impl PgLockFactory {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            local: LocalLockFactory::new(),
        }
    }
}

#[async_trait]
impl LockFactory for PgLockFactory {
    async fn acquire(&self, id: LockId) -> DbResult<Option<Box<dyn Lock>>> {
        let Some(local) = self.local.try_take(id) else {
            return Ok(None);
        };

        let mut conn = self.pool.acquire().await?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(id.advisory_key())
            .fetch_one(&mut *conn)
            .await?;
        if !acquired {
            return Ok(None);
        }

        Ok(Some(Box::new(PgLock {
            local,
            conn: Some(conn),
        })))
    }
}

pub struct PgLock {
    local: LocalLock,
    conn: Option<PoolConnection<Postgres>>,
}

#[async_trait]
impl Lock for PgLock {
    fn id(&self) -> LockId {
        self.local.id
    }

    async fn release(&mut self) -> DbResult<()> {
        let Some(mut conn) = self.conn.take() else {
            return Ok(());
        };

        let result: Result<bool, sqlx::Error> =
            sqlx::query_scalar("SELECT pg_advisory_unlock($1)")
                .bind(self.local.id.advisory_key())
                .fetch_one(&mut *conn)
                .await;
        self.local.free();

        match result {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(lock = ?self.local.id, "Advisory lock was not held on release");
                Ok(())
            }
            Err(e) => {
                // Never hand a session that may still hold the lock back to the pool.
                drop(conn.detach());
                Err(e.into())
            }
        }
    }
}

impl Drop for PgLock {
    fn drop(&mut self) {
        // Closing the session is the only synchronous way to give the
        // advisory lock up.
        if let Some(conn) = self.conn.take() {
            drop(conn.detach());
        }
    }
}
