//! Regions command - list committed regions.

use console::style;
use tilefetch::config::format_size;
use tilefetch::store::RegionManifest;
use tilefetch::TileStore;

use super::common::{CliContext, StoreArgs};
use crate::error::CliError;

/// Run the regions command.
pub fn run(args: StoreArgs, ctx: &CliContext) -> Result<(), CliError> {
    let store = ctx.open_store(args.store.as_deref())?;
    let regions = store.list_regions()?;

    println!("Tile store: {}", store.root().display());
    println!("  Stored: {}", format_size(store.current_total_bytes()));
    println!();

    if regions.is_empty() {
        println!("No committed regions.");
        return Ok(());
    }

    println!(
        "{}",
        style(format!("{:<24} {:>8} {:>10}  {}", "REGION", "TILES", "SIZE", "COMMITTED")).bold()
    );
    for manifest in &regions {
        println!("{}", format_row(manifest));
    }
    println!();
    println!("{} region(s)", regions.len());
    Ok(())
}

fn format_row(manifest: &RegionManifest) -> String {
    format!(
        "{:<24} {:>8} {:>10}  {}",
        manifest.id,
        manifest.urls.len(),
        format_size(manifest.total_bytes),
        manifest.committed_at.format("%Y-%m-%d %H:%M:%S UTC")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_row() {
        let manifest = RegionManifest {
            id: "hamburg".to_string(),
            urls: vec!["a".to_string(), "b".to_string()],
            total_bytes: 2048,
            committed_at: "2025-01-02T03:04:05Z".parse().unwrap(),
        };

        let row = format_row(&manifest);

        assert!(row.starts_with("hamburg"));
        assert!(row.contains("2.0 KB"));
        assert!(row.ends_with("2025-01-02 03:04:05 UTC"));
    }
}
