//! Fetch configuration and INI config file loading.
//!
//! [`FetchConfig`] is supplied once per fetch operation and is read-only for
//! the duration of the run. [`ConfigFile`] loads it, together with the storage
//! location, from `~/.tilefetch/config.ini`:
//!
//! ```ini
//! [fetch]
//! max_total_storage = 2GB
//! max_concurrent_workers = 8
//! max_batch_heap = 64MB
//! max_attempts_per_tile = 3
//! per_attempt_timeout_secs = 5
//! retry_backoff_ms = 100
//! purge_unlinked_on_abort = false
//!
//! [storage]
//! directory = ~/.tilefetch/store
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::Ini;
use thiserror::Error;

/// Default per-attempt network timeout.
pub const DEFAULT_PER_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default storage quota (2 GB).
pub const DEFAULT_MAX_TOTAL_STORAGE_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default upper bound on concurrently running workers.
pub const DEFAULT_MAX_CONCURRENT_WORKERS: usize = 8;

/// Default aggregate in-memory batch budget across all workers (64 MB).
pub const DEFAULT_MAX_BATCH_HEAP_BYTES: u64 = 64 * 1024 * 1024;

/// Default number of attempts per tile, including the first.
pub const DEFAULT_MAX_ATTEMPTS_PER_TILE: u32 = 3;

/// Default initial delay between attempts.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(100);

/// Default cap on the delay between attempts.
pub const DEFAULT_MAX_RETRY_BACKOFF: Duration = Duration::from_secs(5);

/// Default capacity of the progress broadcast channel.
pub const DEFAULT_PROGRESS_CHANNEL_CAPACITY: usize = 1024;

/// Name of the config directory under the user's home.
const CONFIG_DIR_NAME: &str = ".tilefetch";

/// Name of the config file inside the config directory.
const CONFIG_FILE_NAME: &str = "config.ini";

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The INI file could not be read or parsed.
    #[error("failed to read config file {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    /// A key holds a value that cannot be parsed.
    #[error("invalid value for [{section}] {key}: {value:?}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },

    /// The configuration is internally inconsistent.
    #[error("invalid configuration: {0}")]
    Invalid(String),

    /// The user's home directory could not be determined.
    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Configuration for one fetch operation.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchConfig {
    /// Maximum total stored bytes across all tiles (the quota).
    pub max_total_storage_bytes: u64,

    /// Upper bound on the number of concurrently running workers.
    pub max_concurrent_workers: usize,

    /// In-memory batch budget, shared evenly across all workers.
    pub max_batch_heap_bytes: u64,

    /// Attempts per tile, including the first.
    pub max_attempts_per_tile: u32,

    /// Timeout for each individual network attempt.
    pub per_attempt_timeout: Duration,

    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,

    /// Cap on the retry delay.
    pub max_retry_backoff: Duration,

    /// Delete fetched-but-unlinked tiles when a run aborts.
    ///
    /// Keeping them lets a later fetch of the same addresses skip the network.
    pub purge_unlinked_on_abort: bool,

    /// Capacity of the progress broadcast channel.
    pub progress_channel_capacity: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_total_storage_bytes: DEFAULT_MAX_TOTAL_STORAGE_BYTES,
            max_concurrent_workers: DEFAULT_MAX_CONCURRENT_WORKERS,
            max_batch_heap_bytes: DEFAULT_MAX_BATCH_HEAP_BYTES,
            max_attempts_per_tile: DEFAULT_MAX_ATTEMPTS_PER_TILE,
            per_attempt_timeout: DEFAULT_PER_ATTEMPT_TIMEOUT,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            max_retry_backoff: DEFAULT_MAX_RETRY_BACKOFF,
            purge_unlinked_on_abort: false,
            progress_channel_capacity: DEFAULT_PROGRESS_CHANNEL_CAPACITY,
        }
    }
}

impl FetchConfig {
    /// Create a configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the storage quota.
    pub fn with_max_total_storage_bytes(mut self, bytes: u64) -> Self {
        self.max_total_storage_bytes = bytes;
        self
    }

    /// Set the worker ceiling.
    pub fn with_max_concurrent_workers(mut self, workers: usize) -> Self {
        self.max_concurrent_workers = workers;
        self
    }

    /// Set the aggregate batch budget.
    pub fn with_max_batch_heap_bytes(mut self, bytes: u64) -> Self {
        self.max_batch_heap_bytes = bytes;
        self
    }

    /// Set the number of attempts per tile.
    pub fn with_max_attempts_per_tile(mut self, attempts: u32) -> Self {
        self.max_attempts_per_tile = attempts;
        self
    }

    /// Set the per-attempt timeout.
    pub fn with_per_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.per_attempt_timeout = timeout;
        self
    }

    /// Set the initial retry delay.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    /// Set the retry delay cap.
    pub fn with_max_retry_backoff(mut self, backoff: Duration) -> Self {
        self.max_retry_backoff = backoff;
        self
    }

    /// Enable or disable purging unlinked tiles on abort.
    pub fn with_purge_unlinked_on_abort(mut self, purge: bool) -> Self {
        self.purge_unlinked_on_abort = purge;
        self
    }

    /// Set the progress channel capacity.
    pub fn with_progress_channel_capacity(mut self, capacity: usize) -> Self {
        self.progress_channel_capacity = capacity;
        self
    }

    /// Check that the configuration can drive a fetch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_workers == 0 {
            return Err(ConfigError::Invalid(
                "max_concurrent_workers must be at least 1".to_string(),
            ));
        }
        if self.max_attempts_per_tile == 0 {
            return Err(ConfigError::Invalid(
                "max_attempts_per_tile must be at least 1".to_string(),
            ));
        }
        if self.per_attempt_timeout.is_zero() {
            return Err(ConfigError::Invalid(
                "per_attempt_timeout must be greater than zero".to_string(),
            ));
        }
        if self.progress_channel_capacity == 0 {
            return Err(ConfigError::Invalid(
                "progress_channel_capacity must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Storage settings from the `[storage]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct StorageSettings {
    /// Root directory of the disk tile store.
    pub directory: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        let directory = config_directory()
            .map(|dir| dir.join("store"))
            .unwrap_or_else(|_| std::env::temp_dir().join("tilefetch-store"));
        Self { directory }
    }
}

/// Logging settings from the `[logging]` section.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingSettings {
    /// Directory for the log file.
    pub directory: Option<PathBuf>,
    /// Default filter directive when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            directory: None,
            filter: "info,tilefetch=debug".to_string(),
        }
    }
}

/// Parsed contents of `config.ini`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    /// Fetch engine settings.
    pub fetch: FetchConfig,
    /// Storage settings.
    pub storage: StorageSettings,
    /// Logging settings.
    pub logging: LoggingSettings,
}

impl ConfigFile {
    /// Load from the default location, `~/.tilefetch/config.ini`.
    ///
    /// A missing file is not an error; defaults are returned instead.
    pub fn load() -> Result<Self, ConfigError> {
        let path = config_file_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_file(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    /// Parse from INI text.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(content).map_err(|e| ConfigError::Read {
            path: PathBuf::from("<string>"),
            reason: e.to_string(),
        })?;
        Self::from_ini(&ini)
    }

    fn from_ini(ini: &Ini) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(section) = ini.section(Some("fetch")) {
            let fetch = &mut config.fetch;
            let get = |key: &str| section.get(key);

            if let Some(v) = get("max_total_storage") {
                fetch.max_total_storage_bytes = parse_size_value("fetch", "max_total_storage", v)?;
            }
            if let Some(v) = get("max_concurrent_workers") {
                fetch.max_concurrent_workers = parse_value("fetch", "max_concurrent_workers", v)?;
            }
            if let Some(v) = get("max_batch_heap") {
                fetch.max_batch_heap_bytes = parse_size_value("fetch", "max_batch_heap", v)?;
            }
            if let Some(v) = get("max_attempts_per_tile") {
                fetch.max_attempts_per_tile = parse_value("fetch", "max_attempts_per_tile", v)?;
            }
            if let Some(v) = get("per_attempt_timeout_secs") {
                let secs: u64 = parse_value("fetch", "per_attempt_timeout_secs", v)?;
                fetch.per_attempt_timeout = Duration::from_secs(secs);
            }
            if let Some(v) = get("retry_backoff_ms") {
                let ms: u64 = parse_value("fetch", "retry_backoff_ms", v)?;
                fetch.retry_backoff = Duration::from_millis(ms);
            }
            if let Some(v) = get("max_retry_backoff_ms") {
                let ms: u64 = parse_value("fetch", "max_retry_backoff_ms", v)?;
                fetch.max_retry_backoff = Duration::from_millis(ms);
            }
            if let Some(v) = get("purge_unlinked_on_abort") {
                fetch.purge_unlinked_on_abort = parse_value("fetch", "purge_unlinked_on_abort", v)?;
            }
            if let Some(v) = get("progress_channel_capacity") {
                fetch.progress_channel_capacity =
                    parse_value("fetch", "progress_channel_capacity", v)?;
            }
        }

        if let Some(section) = ini.section(Some("storage")) {
            if let Some(v) = section.get("directory") {
                config.storage.directory = expand_tilde(v);
            }
        }

        if let Some(section) = ini.section(Some("logging")) {
            if let Some(v) = section.get("directory") {
                config.logging.directory = Some(expand_tilde(v));
            }
            if let Some(v) = section.get("filter") {
                config.logging.filter = v.to_string();
            }
        }

        config.fetch.validate()?;
        Ok(config)
    }
}

/// Directory holding the config file, `~/.tilefetch`.
pub fn config_directory() -> Result<PathBuf, ConfigError> {
    dirs::home_dir()
        .map(|home| home.join(CONFIG_DIR_NAME))
        .ok_or(ConfigError::NoHomeDir)
}

/// Full path of the default config file.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    Ok(config_directory()?.join(CONFIG_FILE_NAME))
}

/// Parse a human-readable size such as `512MB`, `2 GB` or `4096`.
///
/// Units are binary (1 KB = 1024 bytes). Returns `None` for malformed input.
pub fn parse_size(input: &str) -> Option<u64> {
    let trimmed = input.trim();
    let split = trimmed
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let value = f64::from_str(number).ok()?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "K" | "KB" | "KIB" => 1024,
        "M" | "MB" | "MIB" => 1024 * 1024,
        "G" | "GB" | "GIB" => 1024 * 1024 * 1024,
        "T" | "TB" | "TIB" => 1024 * 1024 * 1024 * 1024,
        _ => return None,
    };

    if value < 0.0 {
        return None;
    }
    Some((value * multiplier as f64) as u64)
}

/// Format a byte count for display, e.g. `1.5 GB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }

    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn parse_value<T: FromStr>(section: &str, key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_size_value(section: &str, key: &str, value: &str) -> Result<u64, ConfigError> {
    parse_size(value).ok_or_else(|| ConfigError::InvalidValue {
        section: section.to_string(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn expand_tilde(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(rest) => dirs::home_dir()
            .map(|home| home.join(rest))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
