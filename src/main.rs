use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;
mod config;
mod resource_file;

use commands::{ChangesCommand, ConfigCommand, GetCommand, SyncCommand, ValidateCommand};
use config::Config;

#[derive(Parser)]
#[command(name = "sofa")]
#[command(version)]
#[command(about = "CouchDB resource mapper", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the database and synchronize design documents
    Sync(SyncCommand),

    /// Validate a JSON document against a resource schema
    Validate(ValidateCommand),

    /// Fetch one document by id
    Get(GetCommand),

    /// Follow the database change feed
    Changes(ChangesCommand),

    /// Manage configuration
    Config(ConfigCommand),
}

#[tokio::main]
async fn main() {
    // Logs go to stderr so command output stays pipeable
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sofa=info,sofa_core=info".into()),
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
        Some(Commands::Sync(cmd)) => cmd.run(&config).await?,
        Some(Commands::Validate(cmd)) => cmd.run(&config)?,
        Some(Commands::Get(cmd)) => cmd.run(&config).await?,
        Some(Commands::Changes(cmd)) => cmd.run(&config).await?,
        Some(Commands::Config(cmd)) => cmd.run(&config)?,
        None => {
            println!("Use --help to see available commands");
        }
    }

    Ok(())
}
