use std::fs;
use std::path::Path;
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::error::DaemonError;

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    pub dbdaemon: String,
    /// Directory for log files. Logs go to stderr when unset.
    pub directory: Option<String>,
}

impl LoggingConfig {
    const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
    const DBDAEMON_LEVEL: &str = "info";

    fn ensure_valid(&mut self) {
        let str_original = self.dbdaemon.clone();
        self.dbdaemon = self.dbdaemon.trim().to_ascii_lowercase();
        if !Self::LOG_LEVELS.contains(&self.dbdaemon.as_str()) {
            warn!(
                "Config error: dbdaemon log level of '{}' is invalid - using default of '{}'",
                str_original,
                Self::DBDAEMON_LEVEL
            );
            self.dbdaemon = Self::DBDAEMON_LEVEL.to_owned();
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            dbdaemon: Self::DBDAEMON_LEVEL.to_string(),
            directory: None,
        }
    }
}

/// Tuning for the general purpose daemon scheduler.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// Upper bound on how long the worker rests between passes.
    pub timer_delay_ms: u64,
    /// Urgent queue length above which `enqueue` reports backpressure.
    pub optimal_queue_size: usize,
    /// Number of processed items after which the worker yields.
    pub yield_every: usize,
    pub yield_ms: u64,
}

impl SchedulerConfig {
    const TIMER_DELAY_MS: u64 = 10_000;
    const OPTIMAL_QUEUE_SIZE: usize = 100;
    const YIELD_EVERY: usize = 100;
    const YIELD_MS: u64 = 1;

    pub fn timer_delay(&self) -> Duration {
        Duration::from_millis(self.timer_delay_ms)
    }

    pub fn yield_pause(&self) -> Duration {
        Duration::from_millis(self.yield_ms)
    }

    fn ensure_valid(&mut self) {
        if self.timer_delay_ms == 0 {
            warn!(
                "Config error: scheduler timer_delay_ms must be positive - using default of {}",
                Self::TIMER_DELAY_MS
            );
            self.timer_delay_ms = Self::TIMER_DELAY_MS;
        }
        if self.optimal_queue_size == 0 {
            warn!(
                "Config error: scheduler optimal_queue_size must be positive - using default of {}",
                Self::OPTIMAL_QUEUE_SIZE
            );
            self.optimal_queue_size = Self::OPTIMAL_QUEUE_SIZE;
        }
        if self.yield_every == 0 {
            warn!(
                "Config error: scheduler yield_every must be positive - using default of {}",
                Self::YIELD_EVERY
            );
            self.yield_every = Self::YIELD_EVERY;
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            timer_delay_ms: Self::TIMER_DELAY_MS,
            optimal_queue_size: Self::OPTIMAL_QUEUE_SIZE,
            yield_every: Self::YIELD_EVERY,
            yield_ms: Self::YIELD_MS,
        }
    }
}

/// Tuning for the index statistics refresher.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct IndexStatsConfig {
    /// Maximum number of tables waiting for a refresh.
    pub queue_size: usize,
    /// Emit routine activity messages, not only failures.
    pub log_activity: bool,
    /// Rows fetched from an index scan per batch.
    pub fetch_size: usize,
    /// Pause before the single whole-table retry after a lock timeout.
    pub outer_retry_delay_ms: u64,
    pub write_retries: u32,
    pub invalidate_retries: u32,
    pub backoff_base_ms: u64,
    /// Consecutive unhandled failures after which the daemon disables itself.
    pub max_consecutive_errors: u32,
}

impl IndexStatsConfig {
    const QUEUE_SIZE: usize = 20;
    const FETCH_SIZE: usize = 16;
    const OUTER_RETRY_DELAY_MS: u64 = 1000;
    const WRITE_RETRIES: u32 = 3;
    const INVALIDATE_RETRIES: u32 = 3;
    const BACKOFF_BASE_MS: u64 = 100;
    const MAX_CONSECUTIVE_ERRORS: u32 = 50;

    pub fn outer_retry_delay(&self) -> Duration {
        Duration::from_millis(self.outer_retry_delay_ms)
    }

    pub fn backoff(&self, factor: u32) -> Duration {
        Duration::from_millis(self.backoff_base_ms.saturating_mul(factor as u64))
    }

    fn ensure_valid(&mut self) {
        if self.queue_size == 0 {
            warn!(
                "Config error: index_stats queue_size must be positive - using default of {}",
                Self::QUEUE_SIZE
            );
            self.queue_size = Self::QUEUE_SIZE;
        }
        if self.fetch_size == 0 {
            warn!(
                "Config error: index_stats fetch_size must be positive - using default of {}",
                Self::FETCH_SIZE
            );
            self.fetch_size = Self::FETCH_SIZE;
        }
        if self.max_consecutive_errors == 0 {
            warn!(
                "Config error: index_stats max_consecutive_errors must be positive - using default of {}",
                Self::MAX_CONSECUTIVE_ERRORS
            );
            self.max_consecutive_errors = Self::MAX_CONSECUTIVE_ERRORS;
        }
    }
}

impl Default for IndexStatsConfig {
    fn default() -> Self {
        IndexStatsConfig {
            queue_size: Self::QUEUE_SIZE,
            log_activity: false,
            fetch_size: Self::FETCH_SIZE,
            outer_retry_delay_ms: Self::OUTER_RETRY_DELAY_MS,
            write_retries: Self::WRITE_RETRIES,
            invalidate_retries: Self::INVALIDATE_RETRIES,
            backoff_base_ms: Self::BACKOFF_BASE_MS,
            max_consecutive_errors: Self::MAX_CONSECUTIVE_ERRORS,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct Config {
    pub logging: LoggingConfig,
    pub scheduler: SchedulerConfig,
    pub index_stats: IndexStatsConfig,
}

impl Config {
    const ENV_PREFIX: &str = "DBDAEMON_";

    /// Builds the configuration from the defaults, then the TOML file at `path`
    /// (if given and present), then `DBDAEMON_` environment variables.
    /// Nested keys use a double underscore, e.g. `DBDAEMON_INDEX_STATS__QUEUE_SIZE`.
    pub fn load(path: Option<&Path>) -> Result<Self, DaemonError> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(path) = path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed(Self::ENV_PREFIX).split("__"));

        let mut config: Config = figment.extract()?;
        config.ensure_valid();

        Ok(config)
    }

    /// Writes the default configuration to `path`, creating parent directories.
    pub fn write_default(path: &Path) -> Result<(), DaemonError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let toml_string = toml::to_string_pretty(&Config::default())
            .map_err(|e| DaemonError::Error(format!("Failed to serialize default config: {e}")))?;
        fs::write(path, toml_string)?;
        Ok(())
    }

    fn ensure_valid(&mut self) {
        self.logging.ensure_valid();
        self.scheduler.ensure_valid();
        self.index_stats.ensure_valid();
    }
}
