//! Fetch command - download a region into the tile store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use tilefetch::config::format_size;
use tilefetch::{
    FetchConfig, Region, RegionFetcher, ReqwestTileClient, RunOutcome, TileClient, TileStore,
};

use super::common::{build_runtime, parse_size_arg, read_region, CliContext, StoreArgs};
use crate::error::CliError;

/// Arguments for the fetch command.
#[derive(Debug, clap::Args)]
pub struct FetchArgs {
    /// File listing one tile URL per line
    pub url_list: PathBuf,

    /// Region identifier (defaults to the file name without extension)
    #[arg(long)]
    pub id: Option<String>,

    #[command(flatten)]
    pub store: StoreArgs,

    /// Maximum concurrent workers
    #[arg(long)]
    pub workers: Option<usize>,

    /// Storage quota, e.g. 2GB
    #[arg(long, value_parser = parse_size_arg)]
    pub quota: Option<u64>,

    /// In-memory batch budget shared by all workers, e.g. 64MB
    #[arg(long, value_parser = parse_size_arg)]
    pub batch_heap: Option<u64>,

    /// Attempts per tile, including the first
    #[arg(long)]
    pub attempts: Option<u32>,

    /// Per-attempt timeout in seconds
    #[arg(long)]
    pub timeout: Option<u64>,

    /// Delete fetched tiles that are not linked to any region if the fetch aborts
    #[arg(long)]
    pub purge_on_abort: bool,

    /// Print the fetch plan and exit without fetching
    #[arg(long)]
    pub dry_run: bool,
}

impl FetchArgs {
    /// Apply command-line overrides on top of the configured values.
    pub fn apply(&self, mut config: FetchConfig) -> FetchConfig {
        if let Some(workers) = self.workers {
            config.max_concurrent_workers = workers;
        }
        if let Some(quota) = self.quota {
            config.max_total_storage_bytes = quota;
        }
        if let Some(batch_heap) = self.batch_heap {
            config.max_batch_heap_bytes = batch_heap;
        }
        if let Some(attempts) = self.attempts {
            config.max_attempts_per_tile = attempts;
        }
        if let Some(timeout) = self.timeout {
            config.per_attempt_timeout = Duration::from_secs(timeout);
        }
        if self.purge_on_abort {
            config.purge_unlinked_on_abort = true;
        }
        config
    }
}

/// Run the fetch command.
pub fn run(args: FetchArgs, ctx: &CliContext) -> Result<(), CliError> {
    let region = read_region(&args.url_list, args.id.clone())?;
    let config = args.apply(ctx.config().fetch.clone());
    let purge = config.purge_unlinked_on_abort;

    let store = Arc::new(ctx.open_store(args.store.store.as_deref())?);
    let client = ReqwestTileClient::new().map_err(|e| CliError::Http(e.to_string()))?;
    let fetcher = Arc::new(RegionFetcher::new(
        store.clone() as Arc<dyn TileStore>,
        Arc::new(client) as Arc<dyn TileClient>,
        config,
    )?);

    let plan = fetcher.plan(&region);
    println!("TileFetch v{}", env!("CARGO_PKG_VERSION"));
    println!("==============");
    println!();
    println!("Region:  {}", region);
    println!("Store:   {}", store.root().display());
    println!("Plan:    {}", plan);
    println!(
        "Quota:   {} ({} in use)",
        format_size(fetcher.config().max_total_storage_bytes),
        format_size(store.current_total_bytes())
    );
    println!();

    if args.dry_run {
        println!("Dry run, nothing fetched.");
        return Ok(());
    }

    let runtime = build_runtime()?;
    let outcome = runtime.block_on(fetch_with_progress(Arc::clone(&fetcher), &region, purge))?;

    report(&region, outcome)
}

async fn fetch_with_progress(
    fetcher: Arc<RegionFetcher>,
    region: &Region,
    purge: bool,
) -> Result<RunOutcome, CliError> {
    let bar = build_progress_bar(region.tile_count() as u64);

    let mut progress_rx = fetcher.subscribe_progress();
    let progress_bar = bar.clone();
    let progress_task = tokio::spawn(async move {
        loop {
            match progress_rx.recv().await {
                Ok(progress) => {
                    progress_bar.set_position(progress.completed_tiles as u64);
                    progress_bar.set_message(format_size(progress.cumulative_bytes_fetched));
                }
                Err(RecvError::Lagged(skipped)) => {
                    debug!(skipped, "Progress display lagging");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    let interrupt = CancellationToken::new();
    let handler_token = interrupt.clone();
    ctrlc::set_handler(move || handler_token.cancel())
        .map_err(|e| CliError::Signal(e.to_string()))?;

    let abort_fetcher = Arc::clone(&fetcher);
    let abort_bar = bar.clone();
    let abort_task = tokio::spawn(async move {
        interrupt.cancelled().await;
        abort_bar.println("Interrupted, aborting fetch...");
        info!("Ctrl-C received, aborting fetch");
        abort_fetcher.abort(purge).await;
    });

    let outcome = fetcher.fetch(region).await;

    abort_task.abort();
    progress_task.abort();
    match &outcome {
        RunOutcome::Committed {
            committed: true, ..
        } => bar.finish_with_message("committed"),
        _ => bar.abandon(),
    }

    Ok(outcome)
}

fn build_progress_bar(len: u64) -> ProgressBar {
    let bar = ProgressBar::new(len);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tiles ({msg}) ETA {eta}",
    ) {
        bar.set_style(style.progress_chars("=>-"));
    }
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

fn report(region: &Region, outcome: RunOutcome) -> Result<(), CliError> {
    match outcome {
        RunOutcome::Committed {
            committed: true,
            progress,
        } => {
            println!(
                "{} Region {} committed: {} tiles, {} downloaded",
                style("✓").green().bold(),
                region.id(),
                progress.total_tiles,
                format_size(progress.cumulative_bytes_fetched)
            );
            Ok(())
        }
        RunOutcome::Committed {
            committed: false, ..
        } => Err(CliError::CommitFailed(region.id().to_string())),
        RunOutcome::Aborted { reason, progress } => {
            println!(
                "{} Region {} aborted after {}/{} tiles",
                style("✗").red().bold(),
                region.id(),
                progress.completed_tiles,
                progress.total_tiles
            );
            Err(CliError::Aborted {
                region: region.id().to_string(),
                reason,
            })
        }
        RunOutcome::AlreadyRunning => Err(CliError::AlreadyRunning),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tilefetch::fetch::Progress;
    use tilefetch::AbortReason;

    fn args() -> FetchArgs {
        FetchArgs {
            url_list: PathBuf::from("urls.txt"),
            id: None,
            store: StoreArgs { store: None },
            workers: None,
            quota: None,
            batch_heap: None,
            attempts: None,
            timeout: None,
            purge_on_abort: false,
            dry_run: false,
        }
    }

    #[test]
    fn test_apply_without_overrides_keeps_config() {
        let config = FetchConfig::default().with_max_concurrent_workers(3);

        assert_eq!(args().apply(config.clone()), config);
    }

    #[test]
    fn test_apply_overrides() {
        let mut args = args();
        args.workers = Some(2);
        args.quota = Some(1024);
        args.timeout = Some(9);
        args.purge_on_abort = true;

        let config = args.apply(FetchConfig::default());

        assert_eq!(config.max_concurrent_workers, 2);
        assert_eq!(config.max_total_storage_bytes, 1024);
        assert_eq!(config.per_attempt_timeout, Duration::from_secs(9));
        assert!(config.purge_unlinked_on_abort);
    }

    #[test]
    fn test_report_maps_outcomes() {
        let region = Region::new("r", vec!["u".to_string()]);
        let progress = Progress::start(1);

        assert!(report(
            &region,
            RunOutcome::Committed {
                committed: true,
                progress
            }
        )
        .is_ok());
        assert!(matches!(
            report(
                &region,
                RunOutcome::Committed {
                    committed: false,
                    progress
                }
            ),
            Err(CliError::CommitFailed(_))
        ));
        assert!(matches!(
            report(
                &region,
                RunOutcome::Aborted {
                    reason: AbortReason::StorageFull,
                    progress
                }
            ),
            Err(CliError::Aborted {
                reason: AbortReason::StorageFull,
                ..
            })
        ));
    }
}
