//! Build event log CLI tool.

use buildlog_config::SystemConfig;
use buildlog_core::{BuildId, EventId};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "buildlog")]
#[command(about = "Build event log CLI", long_about = None)]
struct Cli {
    /// Path to the system configuration
    #[arg(long, env = "BUILDLOG_CONFIG", default_value = "buildlog.kdl")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run database migrations
    Migrate,
    /// Show a build
    Show {
        /// Build ID
        id: BuildId,
    },
    /// Print a build's events as JSON lines
    Tail {
        /// Build ID
        id: BuildId,
        /// First event to print
        #[arg(long, default_value = "0")]
        from: EventId,
        /// Keep waiting for new events until the build finishes
        #[arg(short, long)]
        follow: bool,
    },
    /// Abort a build
    Abort {
        /// Build ID
        id: BuildId,
    },
    /// Send a signal on a notification channel
    Notify {
        /// Channel name
        channel: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries command output.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = SystemConfig::load(&cli.config)?;

    match cli.command {
        Commands::Migrate => {
            commands::migrate(&config).await?;
        }
        Commands::Show { id } => {
            commands::builds::show(&config, id).await?;
        }
        Commands::Tail { id, from, follow } => {
            commands::builds::tail(&config, id, from, follow).await?;
        }
        Commands::Abort { id } => {
            commands::builds::abort(&config, id).await?;
        }
        Commands::Notify { channel } => {
            commands::notify(&config, &channel).await?;
        }
    }

    Ok(())
}
