//! Common types and utilities shared across CLI commands.

use std::fs;
use std::path::{Path, PathBuf};

use tilefetch::config::{config_directory, parse_size, ConfigFile};
use tilefetch::logging::{init_logging, LoggingConfig, LoggingGuard};
use tilefetch::{DiskTileStore, Region};

use crate::error::CliError;

/// Subdirectory of the config directory used for logs when none is configured.
const DEFAULT_LOG_SUBDIR: &str = "logs";

/// Loaded configuration plus helpers every command needs.
pub struct CliContext {
    config: ConfigFile,
}

impl CliContext {
    /// Load `config.ini` from `path`, or from the default location.
    pub fn load(path: Option<&Path>) -> Result<Self, CliError> {
        let config = match path {
            Some(path) => ConfigFile::load_from(path)?,
            None => ConfigFile::load()?,
        };
        Ok(Self { config })
    }

    #[cfg(test)]
    pub fn from_config(config: ConfigFile) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    /// Install file logging so log lines do not interleave with the progress bar.
    pub fn init_logging(&self) -> Result<LoggingGuard, CliError> {
        let directory = self
            .config
            .logging
            .directory
            .clone()
            .or_else(|| config_directory().ok().map(|dir| dir.join(DEFAULT_LOG_SUBDIR)));

        let guard = init_logging(&LoggingConfig {
            directory,
            default_filter: self.config.logging.filter.clone(),
        })?;
        Ok(guard)
    }

    /// Open the disk store at `override_dir`, or at the configured directory.
    pub fn open_store(&self, override_dir: Option<&Path>) -> Result<DiskTileStore, CliError> {
        let dir = override_dir
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.config.storage.directory.clone());
        Ok(DiskTileStore::open(dir)?)
    }
}

/// Build the multi-threaded runtime commands run on.
pub fn build_runtime() -> Result<tokio::runtime::Runtime, CliError> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(CliError::Runtime)
}

/// Clap value parser for human sizes such as `512MB`.
pub fn parse_size_arg(value: &str) -> Result<u64, String> {
    parse_size(value).ok_or_else(|| format!("invalid size: {}", value))
}

/// Read a region from a file listing one URL per line.
///
/// Blank lines and lines starting with `#` are skipped. The region id
/// defaults to the file stem.
pub fn read_region(path: &Path, id: Option<String>) -> Result<Region, CliError> {
    let content = fs::read_to_string(path).map_err(|source| CliError::UrlList {
        path: path.to_path_buf(),
        source,
    })?;

    let urls = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect();

    let id = id.unwrap_or_else(|| region_id_from_path(path));
    Ok(Region::new(id, urls))
}

fn region_id_from_path(path: &Path) -> String {
    path.file_stem()
        .map(|stem| stem.to_string_lossy().to_string())
        .unwrap_or_else(|| "region".to_string())
}

/// Directory argument shared by store-backed commands.
#[derive(Debug, Clone, clap::Args)]
pub struct StoreArgs {
    /// Tile store directory (defaults to [storage] directory in config.ini)
    #[arg(long)]
    pub store: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_region_skips_comments_and_blanks() {
        let mut file = tempfile::Builder::new()
            .prefix("hamburg")
            .suffix(".txt")
            .tempfile()
            .unwrap();
        writeln!(file, "# tiles").unwrap();
        writeln!(file, "https://t/1").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  https://t/2  ").unwrap();

        let region = read_region(file.path(), None).unwrap();

        assert_eq!(region.urls(), &["https://t/1".to_string(), "https://t/2".to_string()]);
        assert!(region.id().starts_with("hamburg"));
    }

    #[test]
    fn test_read_region_explicit_id() {
        let file = tempfile::NamedTempFile::new().unwrap();

        let region = read_region(file.path(), Some("custom".to_string())).unwrap();

        assert_eq!(region.id(), "custom");
        assert!(region.is_empty());
    }

    #[test]
    fn test_read_region_missing_file() {
        let result = read_region(Path::new("/nonexistent/urls.txt"), None);
        assert!(matches!(result, Err(CliError::UrlList { .. })));
    }

    #[test]
    fn test_parse_size_arg() {
        assert_eq!(parse_size_arg("1KB"), Ok(1024));
        assert!(parse_size_arg("lots").is_err());
    }

    #[test]
    fn test_open_store_override() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = CliContext::from_config(ConfigFile::default());

        let store = ctx.open_store(Some(dir.path())).unwrap();

        assert_eq!(store.root(), dir.path());
    }
}
