//! Configuration for engined

use engine_process::{CloseRetryPolicy, NativeBinaries, ProcessManagerConfig, UploadLimits};
use engine_types::DEFAULT_IDLE_TIMEOUT_SECS;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main daemon configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Native process configuration
    #[serde(default)]
    pub process: ProcessConfig,

    /// Idle timeout configuration
    #[serde(default)]
    pub timeouts: TimeoutConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Native process configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessConfig {
    /// Path of the autodetect binary
    #[serde(default = "default_autodetect")]
    pub autodetect: PathBuf,

    /// Path of the normalize binary
    #[serde(default = "default_normalize")]
    pub normalize: PathBuf,

    /// Directory for scratch files; the system temp dir when unset
    #[serde(default)]
    pub scratch_dir: Option<PathBuf>,

    /// How often a flush wait re-checks the process, in seconds
    #[serde(default = "default_flush_poll_interval")]
    pub flush_poll_interval_secs: u64,

    /// Wait between attempts to close a busy job, in seconds
    #[serde(default = "default_close_retry_backoff")]
    pub close_retry_backoff_secs: u64,

    #[serde(default = "default_max_bad_timestamp_percent")]
    pub max_bad_timestamp_percent: u64,

    #[serde(default = "default_max_out_of_order_percent")]
    pub max_out_of_order_percent: u64,
}

impl Default for ProcessConfig {
    fn default() -> Self {
        Self {
            autodetect: default_autodetect(),
            normalize: default_normalize(),
            scratch_dir: None,
            flush_poll_interval_secs: default_flush_poll_interval(),
            close_retry_backoff_secs: default_close_retry_backoff(),
            max_bad_timestamp_percent: default_max_bad_timestamp_percent(),
            max_out_of_order_percent: default_max_out_of_order_percent(),
        }
    }
}

impl ProcessConfig {
    pub fn binaries(&self) -> NativeBinaries {
        NativeBinaries {
            autodetect: self.autodetect.clone(),
            normalize: self.normalize.clone(),
            scratch_dir: self
                .scratch_dir
                .clone()
                .unwrap_or_else(std::env::temp_dir),
        }
    }

    pub fn manager_config(&self) -> ProcessManagerConfig {
        ProcessManagerConfig {
            flush_poll_interval: Duration::from_secs(self.flush_poll_interval_secs),
            max_bad_timestamp_percent: self.max_bad_timestamp_percent,
            max_out_of_order_percent: self.max_out_of_order_percent,
            ..Default::default()
        }
    }

    pub fn close_retry_policy(&self) -> CloseRetryPolicy {
        CloseRetryPolicy {
            backoff: Duration::from_secs(self.close_retry_backoff_secs),
        }
    }
}

/// Idle timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Used for jobs that do not set their own timeout
    #[serde(default = "default_idle_timeout")]
    pub default_idle_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            default_idle_secs: default_idle_timeout(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,

    /// JSON format
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

// Default value helpers
fn default_autodetect() -> PathBuf {
    PathBuf::from("/opt/engine/bin/autodetect")
}

fn default_normalize() -> PathBuf {
    PathBuf::from("/opt/engine/bin/normalize")
}

fn default_flush_poll_interval() -> u64 {
    1
}

fn default_close_retry_backoff() -> u64 {
    10
}

fn default_max_bad_timestamp_percent() -> u64 {
    UploadLimits::default().max_bad_timestamp_percent
}

fn default_max_out_of_order_percent() -> u64 {
    UploadLimits::default().max_out_of_order_percent
}

fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_SECS
}

fn default_log_level() -> String {
    "info".to_string()
}

impl EngineConfig {
    /// Load configuration: defaults, then the optional file, then
    /// `ENGINE_` environment variables (`ENGINE_PROCESS__AUTODETECT=...`)
    pub fn load(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();

        builder = builder.add_source(config::Config::try_from(&EngineConfig::default())?);

        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("ENGINE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
