//! Cleanup command - clear staging markers and optionally purge unlinked tiles.

use tilefetch::config::format_size;
use tilefetch::TileStore;

use super::common::{build_runtime, CliContext, StoreArgs};
use crate::error::CliError;

/// Arguments for the cleanup command.
#[derive(Debug, clap::Args)]
pub struct CleanupArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Also delete tiles not linked to any committed region
    #[arg(long)]
    pub purge: bool,
}

/// Run the cleanup command.
pub fn run(args: CleanupArgs, ctx: &CliContext) -> Result<(), CliError> {
    let store = ctx.open_store(args.store.store.as_deref())?;
    println!("Cleaning tile store at: {}", store.root().display());

    let runtime = build_runtime()?;
    let stats = runtime.block_on(store.cleanup_temporary(args.purge))?;

    println!("  Staging markers cleared: {}", stats.staging_cleared);
    if args.purge {
        println!(
            "  Unlinked tiles deleted:  {} (freed {})",
            stats.tiles_purged,
            format_size(stats.bytes_freed)
        );
    }
    println!("  Stored now: {}", format_size(store.current_total_bytes()));
    Ok(())
}
