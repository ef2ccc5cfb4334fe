//! CLI command implementations.

pub mod builds;

use anyhow::{Context, Result};
use buildlog_config::SystemConfig;
use buildlog_db::{Notify, PgNotify};
use sqlx::PgPool;

async fn pool(config: &SystemConfig) -> Result<PgPool> {
    buildlog_db::create_pool(&config.database.url, config.database.max_connections)
        .await
        .context("Failed to connect to database")
}

pub async fn migrate(config: &SystemConfig) -> Result<()> {
    let pool = pool(config).await?;
    buildlog_db::run_migrations(&pool)
        .await
        .context("Failed to run migrations")?;
    println!("Migrations applied");
    Ok(())
}

pub async fn notify(config: &SystemConfig, channel: &str) -> Result<()> {
    let pool = pool(config).await?;
    PgNotify::new(pool).notify(channel).await?;
    println!("Notified {}", channel);
    Ok(())
}
