use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;

use commands::{ConfigCommand, RecordsCommand, WatchCommand, WhoamiCommand};
use config::Config;

#[derive(Parser)]
#[command(name = "medisync")]
#[command(version)]
#[command(
    about = "Clinic records that keep working when the connection does not",
    long_about = None
)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show who the configured API key signs in as
    Whoami(WhoamiCommand),

    /// List, show, add, update and delete records
    Records(RecordsCommand),

    /// Follow a collection live
    Watch(WatchCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "medisync=warn,medisync_core=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config)?;

    match cli.command {
        Some(Commands::Whoami(cmd)) => {
            cmd.run(&config).await?;
        }
        Some(Commands::Records(cmd)) => {
            let coordinator = commands::open_coordinator(&config).await?;
            let result = cmd.run(&coordinator).await;
            coordinator.shutdown();
            result?;
        }
        Some(Commands::Watch(cmd)) => {
            let coordinator = commands::open_coordinator(&config).await?;
            let result = cmd.run(&coordinator).await;
            coordinator.shutdown();
            result?;
        }
        Some(Commands::Config(cmd)) => {
            cmd.run(&config)?;
        }
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
