//! TileFetch CLI - fetch tile regions into a local store
//!
//! ```text
//! tilefetch fetch urls.txt --id hamburg --quota 4GB
//! tilefetch regions
//! tilefetch cleanup --purge
//! ```

mod commands;
mod error;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use console::style;
use tracing::info;

use commands::cleanup::CleanupArgs;
use commands::common::{CliContext, StoreArgs};
use commands::fetch::FetchArgs;
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "tilefetch", version, about = "Fetch tile regions with all-or-nothing commit")]
struct Cli {
    /// Path to config.ini (defaults to ~/.tilefetch/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every tile of a region and commit it
    Fetch(FetchArgs),
    /// List committed regions
    Regions(StoreArgs),
    /// Clear temporary storage state
    Cleanup(CleanupArgs),
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {}", style("error:").red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let ctx = CliContext::load(cli.config.as_deref())?;
    let _log_guard = ctx.init_logging()?;
    info!(version = env!("CARGO_PKG_VERSION"), command = ?cli.command, "tilefetch starting");

    match cli.command {
        Commands::Fetch(args) => commands::fetch::run(args, &ctx),
        Commands::Regions(args) => commands::regions::run(args, &ctx),
        Commands::Cleanup(args) => commands::cleanup::run(args, &ctx),
    }
}
