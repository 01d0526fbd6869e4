//! Configuration for locvault.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (LOCVAULT_HOME, LOCVAULT_ARCHIVE)
//! 2. Config file (.locvault/config.yaml)
//! 3. Defaults (~/.locvault, archive at ~/.locvault/archive)
//!
//! Config file discovery:
//! - Searches current directory and parents for .locvault/config.yaml
//! - `paths.home` is relative to the .locvault/ directory, `paths.archive`
//!   to the directory containing it

use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::core::ImportSettings;
use crate::ingest::default_denylist;
use crate::jobs::{RetryPolicy, SchedulerSettings};

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

const ENV_HOME: &str = "LOCVAULT_HOME";
const ENV_ARCHIVE: &str = "LOCVAULT_ARCHIVE";

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub import: ImportConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub watch: WatchConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (catalog, batch log)
    pub home: Option<String>,
    /// Archive root holding `locations/<id>/`
    pub archive: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ImportConfig {
    /// Upper bound on one file copy
    #[serde(default = "default_copy_timeout")]
    pub copy_timeout_secs: u64,

    /// Files hashed in parallel within a batch
    #[serde(default = "default_hash_concurrency")]
    pub hash_concurrency: usize,

    /// File name globs skipped when expanding directories
    #[serde(default = "default_denylist")]
    pub denylist: Vec<String>,
}

fn default_copy_timeout() -> u64 {
    300
}
fn default_hash_concurrency() -> usize {
    4
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            copy_timeout_secs: default_copy_timeout(),
            hash_concurrency: default_hash_concurrency(),
            denylist: default_denylist(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    /// Full check recurrence per location
    #[serde(default = "default_interval_hours")]
    pub interval_hours: u64,

    /// Backoff for checks that fail operationally
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_interval_hours() -> u64 {
    24 * 7
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            interval_hours: default_interval_hours(),
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default = "default_true")]
    pub validate_on_start: bool,
}

fn default_workers() -> usize {
    2
}
fn default_queue_capacity() -> usize {
    64
}
fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            validate_on_start: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WatchConfig {
    /// Seconds a dropped file must keep its size before import
    #[serde(default = "default_stability_delay")]
    pub stability_delay_secs: u64,
}

fn default_stability_delay() -> u64 {
    5
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            stability_delay_secs: default_stability_delay(),
        }
    }
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    /// Engine state directory
    pub home: PathBuf,
    /// Archive root
    pub archive: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub import: ImportConfig,
    pub validation: ValidationConfig,
    pub scheduler: SchedulerConfig,
    pub watch: WatchConfig,
}

impl ResolvedConfig {
    /// Defaults rooted at `home`, archive inside it
    pub fn with_home(home: PathBuf) -> Self {
        Self {
            archive: home.join("archive"),
            home,
            config_file: None,
            import: ImportConfig::default(),
            validation: ValidationConfig::default(),
            scheduler: SchedulerConfig::default(),
            watch: WatchConfig::default(),
        }
    }

    /// SQLite catalog ($LOCVAULT_HOME/catalog.sqlite)
    pub fn catalog_path(&self) -> PathBuf {
        self.home.join("catalog.sqlite")
    }

    /// Batch completion log ($LOCVAULT_HOME/batches.jsonl)
    pub fn batch_log_path(&self) -> PathBuf {
        self.home.join("batches.jsonl")
    }

    pub fn import_settings(&self) -> ImportSettings {
        ImportSettings {
            copy_timeout: Duration::from_secs(self.import.copy_timeout_secs),
            hash_concurrency: self.import.hash_concurrency.max(1),
        }
    }

    pub fn scheduler_settings(&self) -> SchedulerSettings {
        SchedulerSettings {
            workers: self.scheduler.workers.max(1),
            queue_capacity: self.scheduler.queue_capacity.max(1),
            validation_interval: self.validation_interval(),
            validate_on_start: self.scheduler.validate_on_start,
            retry: self.validation.retry.clone(),
        }
    }

    pub fn validation_interval(&self) -> Duration {
        Duration::from_secs(self.validation.interval_hours * 3600)
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".locvault").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's parent
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

/// Combine file, environment and defaults
fn resolve(
    default_home: PathBuf,
    config_file: Option<PathBuf>,
    env_home: Option<String>,
    env_archive: Option<String>,
) -> Result<ResolvedConfig> {
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    // .locvault/ and the directory containing it
    let dot_dir = config_file.as_deref().and_then(Path::parent);
    let base_dir = dot_dir.and_then(Path::parent);

    let home = match (env_home, &file.paths.home, dot_dir) {
        (Some(env), _, _) => PathBuf::from(env),
        (None, Some(home), Some(dir)) => resolve_path(dir, home),
        _ => default_home,
    };

    let archive = match (env_archive, &file.paths.archive, base_dir) {
        (Some(env), _, _) => PathBuf::from(env),
        (None, Some(archive), Some(dir)) => resolve_path(dir, archive),
        _ => home.join("archive"),
    };

    Ok(ResolvedConfig {
        home,
        archive,
        config_file,
        import: file.import,
        validation: file.validation,
        scheduler: file.scheduler,
        watch: file.watch,
    })
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".locvault");

    resolve(
        default_home,
        find_config_file(),
        std::env::var(ENV_HOME).ok(),
        std::env::var(ENV_ARCHIVE).ok(),
    )
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}
