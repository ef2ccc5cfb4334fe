//! Database layer for the build event log.
//!
//! Provides the listen transport and notification bus, condition notifiers,
//! the per-build event log and the build lifecycle, with PostgreSQL and
//! in-process implementations.

pub mod bus;
pub mod build;
pub mod check_build;
pub mod error;
pub mod event_source;
pub mod listener;
pub mod lock;
pub mod memory;
pub mod notifier;
pub mod repo;

pub use build::{Build, BuildFactory, StoredBuild};
pub use bus::{NotificationBus, Notify, PgNotify, Subscription};
pub use check_build::{CheckBuild, CheckBuildFactory, CheckBuildKey, Checkable};
pub use error::{DbError, DbResult};
pub use event_source::EventSource;
pub use listener::{ListenTransport, Notification, PgConnector};
pub use lock::{CheckableKind, LocalLockFactory, Lock, LockFactory, LockId, PgLockFactory};
pub use memory::{MemoryBuildRepo, MemoryHub};
pub use notifier::{ConditionNotifier, NoopNotifier, Notifier};
pub use repo::*;

use buildlog_config::SystemConfig;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::info;

/// Create a new database connection pool.
pub async fn create_pool(database_url: &str, max_connections: u32) -> DbResult<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .connect(database_url)
        .await?;
    Ok(pool)
}

/// Run database migrations.
pub async fn run_migrations(pool: &PgPool) -> DbResult<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Wire up everything against PostgreSQL: the pool, the dedicated listen
/// connection and the build factory on top of them.
pub async fn connect(config: &SystemConfig) -> DbResult<(BuildFactory, PgPool)> {
    let pool = create_pool(&config.database.url, config.database.max_connections).await?;

    let transport = ListenTransport::start(
        PgConnector::new(config.database.url.clone()),
        config.listener.clone(),
    )
    .await?;
    let bus = NotificationBus::new(transport, Arc::new(PgNotify::new(pool.clone())))?;
    info!("Connected to database");

    let factory = BuildFactory::new(
        Arc::new(PgBuildRepo::new(pool.clone())),
        Arc::new(bus),
        Arc::new(PgLockFactory::new(pool.clone())),
        config.notifier.clone(),
        config.events.clone(),
    );
    Ok((factory, pool))
}

/// Wire up everything in process, for a single node without a database.
/// The returned hub can be used to simulate connection loss.
pub async fn connect_in_memory(config: &SystemConfig) -> DbResult<(BuildFactory, MemoryHub)> {
    let hub = MemoryHub::new();
    let transport = ListenTransport::start(hub.clone(), config.listener.clone()).await?;
    let bus = NotificationBus::new(transport, Arc::new(hub.clone()))?;

    let factory = BuildFactory::new(
        Arc::new(MemoryBuildRepo::new()),
        Arc::new(bus),
        Arc::new(LocalLockFactory::new()),
        config.notifier.clone(),
        config.events.clone(),
    );
    Ok((factory, hub))
}
