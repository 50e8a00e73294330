mod commands;
mod logging;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "onio")]
#[command(about = "Task-dispatch engine for chat bots", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file (JSON, JSON5 or YAML). Defaults to ~/.onio/config.json
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the dispatcher, the enabled connectors and the job scheduler
    Run,

    /// Load and validate configuration, then print a summary
    Check {
        /// Print the effective configuration as JSON
        #[arg(long)]
        json: bool,
    },

    /// List configured agents and the task kinds they handle
    Agents,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            commands::run::run(cli.config, cli.verbose).await?;
        }
        Commands::Check { json } => {
            commands::check::run(cli.config, json)?;
        }
        Commands::Agents => {
            commands::agents::run(cli.config)?;
        }
    }

    Ok(())
}
