//! Configuration system for the Sluice CLI.

use serde::{Deserialize, Serialize};
use sluice_core::SchedulerConfig;
use sluice_files::chunker::ChunkSizePolicy;
use sluice_files::hasher::HasherConfig;
use sluice_files::worker::MAX_HASH_WORKERS;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Sluice configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Scheduler configuration
    #[serde(default)]
    pub scheduler: SchedulerSection,
    /// Hashing configuration
    #[serde(default)]
    pub hashing: HashingSection,
    /// Upload record storage
    #[serde(default)]
    pub storage: StorageSection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingSection,
}

/// Scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Maximum concurrent chunk uploads
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_tasks: usize,
    /// Retries per chunk after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between attempts (milliseconds)
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Abort once more chunks than this failed permanently
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_budget: Option<usize>,
}

/// Hashing configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HashingSection {
    /// Number of hash workers
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Chunk size in MiB (absent = size-tiered)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size_mb: Option<f64>,
}

/// Upload record storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageSection {
    /// Directory holding upload records
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Records inactive for longer than this are removed
    #[serde(default = "default_max_age_days")]
    pub max_age_days: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSection {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_max_concurrent() -> usize {
    sluice_core::default_concurrency()
}

fn default_max_retries() -> u32 {
    sluice_core::config::DEFAULT_MAX_RETRIES
}

fn default_retry_delay_ms() -> u64 {
    sluice_core::config::DEFAULT_RETRY_DELAY.as_millis() as u64
}

fn default_workers() -> usize {
    HasherConfig::default().workers
}

fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("sluice/uploads")
}

fn default_max_age_days() -> u64 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            max_concurrent_tasks: default_max_concurrent(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            error_budget: None,
        }
    }
}

impl Default for HashingSection {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            chunk_size_mb: None,
        }
    }
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            max_age_days: default_max_age_days(),
        }
    }
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("sluice/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.scheduler.max_concurrent_tasks == 0 || self.scheduler.max_concurrent_tasks > 1000 {
            anyhow::bail!("scheduler.max_concurrent_tasks must be between 1 and 1000");
        }

        if self.hashing.workers == 0 || self.hashing.workers > MAX_HASH_WORKERS {
            anyhow::bail!("hashing.workers must be between 1 and {}", MAX_HASH_WORKERS);
        }

        if let Some(mb) = self.hashing.chunk_size_mb {
            if !mb.is_finite() || mb < 1.0 || mb > 1024.0 {
                anyhow::bail!("hashing.chunk_size_mb must be between 1 and 1024");
            }
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Scheduler configuration for chunk uploads
    #[must_use]
    pub fn scheduler_config(&self) -> SchedulerConfig {
        let config = SchedulerConfig::default()
            .with_max_concurrent_tasks(self.scheduler.max_concurrent_tasks)
            .with_max_retries(self.scheduler.max_retries)
            .with_retry_delay(Duration::from_millis(self.scheduler.retry_delay_ms));

        match self.scheduler.error_budget {
            Some(budget) => config.with_error_budget(budget),
            None => config,
        }
    }

    /// Hasher configuration
    #[must_use]
    pub fn hasher_config(&self) -> HasherConfig {
        HasherConfig {
            workers: self.hashing.workers,
            chunk_policy: self
                .hashing
                .chunk_size_mb
                .map_or(ChunkSizePolicy::Auto, ChunkSizePolicy::Custom),
        }
    }
}
