//! pagestash CLI - capture web pages into single-file archives
//!
//! Entry point: parse arguments, set up logging, load configuration and
//! dispatch to the command implementations.

use anyhow::Result;
use clap::Parser;

mod cli;
mod commands;
mod output;
mod utils;

use cli::{Cli, Commands};
use utils::{initialize_logging, load_config};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    initialize_logging(&cli)?;

    execute_command(cli).await
}

async fn execute_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Capture(args) => {
            let config = load_config(cli.config.as_deref())?;
            commands::execute_capture(config, args, cli.quiet).await?;
        },

        Commands::Inspect { archive, format } => {
            commands::execute_inspect(&archive, format)?;
        },

        Commands::Config { format } => {
            let config = load_config(cli.config.as_deref())?;
            commands::execute_config(&config, format)?;
        },
    }

    Ok(())
}
