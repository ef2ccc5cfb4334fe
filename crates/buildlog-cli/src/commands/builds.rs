//! Build commands.

use anyhow::{Context, Result, bail};
use buildlog_config::SystemConfig;
use buildlog_core::{BuildId, EventId};
use buildlog_db::{Build, BuildRepo, PgBuildRepo};
use futures::StreamExt;
use tracing::{error, info};

use super::pool;

const PAGE_SIZE: u32 = 500;

pub async fn show(config: &SystemConfig, id: BuildId) -> Result<()> {
    let repo = PgBuildRepo::new(pool(config).await?);
    let Some(build) = repo.get(id).await? else {
        bail!("Build {} not found", id);
    };
    println!("{}", serde_json::to_string_pretty(&build)?);
    Ok(())
}

pub async fn tail(config: &SystemConfig, id: BuildId, from: EventId, follow: bool) -> Result<()> {
    if !follow {
        return print_stored(config, id, from).await;
    }

    let (factory, _pool) = buildlog_db::connect(config)
        .await
        .context("Failed to connect to database")?;
    let Some(build) = factory.build(id).await? else {
        bail!("Build {} not found", id);
    };

    info!(build_id = %id, from, "Following build events");

    let mut events = Box::pin(build.events(from).await?.into_stream());
    loop {
        tokio::select! {
            event = events.next() => {
                let Some(event) = event else { break };
                println!("{}", serde_json::to_string(&event?)?);
            }
            _ = factory.transport_failed() => {
                error!(build_id = %id, "Lost the listen connection for good");
                bail!("Listen connection to the database could not be re-established");
            }
        }
    }

    info!(build_id = %id, "Build finished");
    factory.close().await;
    Ok(())
}

/// Print what is stored right now and stop.
async fn print_stored(config: &SystemConfig, id: BuildId, from: EventId) -> Result<()> {
    let repo = PgBuildRepo::new(pool(config).await?);
    let mut cursor = from;
    loop {
        let page = repo.events(id, cursor, PAGE_SIZE).await?;
        let Some(last) = page.events.last() else {
            return Ok(());
        };
        cursor = last.event_id + 1;

        for event in &page.events {
            println!("{}", serde_json::to_string(event)?);
        }
    }
}

pub async fn abort(config: &SystemConfig, id: BuildId) -> Result<()> {
    let (factory, _pool) = buildlog_db::connect(config)
        .await
        .context("Failed to connect to database")?;
    let Some(build) = factory.build(id).await? else {
        bail!("Build {} not found", id);
    };

    build.mark_as_aborted().await?;
    info!(build_id = %id, "Abort signalled");
    println!("Build {} marked as aborted", id);

    factory.close().await;
    Ok(())
}
