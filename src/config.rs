//! Layered configuration using Figment
//!
//! Configuration is loaded from:
//! 1. `config/seaflow-opp.toml` (base configuration, optional)
//! 2. Environment variables prefixed with `SEAFLOW_OPP_`, nested keys
//!    separated by `__` (e.g. `SEAFLOW_OPP_BATCH__WORKERS=8`)
//!
//! Every section has defaults, so an empty or missing file is valid apart
//! from the cruise name, which must come from somewhere before a batch run.
//!
//! # Example
//! ```no_run
//! use seaflow_opp::config::OppConfig;
//!
//! let config = OppConfig::load()?;
//! println!("Application: {}", config.application.name);
//! # Ok::<(), figment::Error>(())
//! ```

use crate::batch::BatchConfig;
use crate::db::StorageConfig;
use crate::gating::FilterOptions;
use crate::retry::RetryPolicy;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default configuration file location, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "config/seaflow-opp.toml";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OppConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Gating parameters
    pub filter: FilterConfig,
    /// Batch run settings
    pub batch: BatchSettings,
    /// Database settings
    pub storage: StorageSettings,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    pub log_format: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "seaflow-opp".to_string(),
            log_level: "info".to_string(),
            log_format: "compact".to_string(),
        }
    }
}

/// Gating parameters; absent notches and origin are inferred per file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Alignment band half-width
    pub width: f64,
    /// Notch line shift
    pub offset: f64,
    /// D1 notch slope
    pub notch1: Option<f64>,
    /// D2 notch slope
    pub notch2: Option<f64>,
    /// D2 - D1 correction
    pub origin: Option<f64>,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            width: 0.5,
            offset: 0.0,
            notch1: None,
            notch2: None,
            origin: None,
        }
    }
}

impl FilterConfig {
    /// Gating options for these settings.
    pub fn options(&self) -> FilterOptions {
        FilterOptions {
            notch1: self.notch1,
            notch2: self.notch2,
            offset: Some(self.offset),
            origin: self.origin,
            width: Some(self.width),
        }
    }
}

/// Batch run configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSettings {
    /// Cruise name recorded with every summary
    pub cruise: String,
    /// Root directory for gated OPP files
    pub output_dir: PathBuf,
    /// Number of files processed concurrently
    pub workers: usize,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            cruise: String::new(),
            output_dir: PathBuf::from("opp"),
            workers: default_workers(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// SQLite database file
    pub db_path: PathBuf,
    /// SQLite busy timeout in seconds
    pub busy_timeout_secs: u64,
    /// Retries after a busy or locked failure
    pub retry_attempts: u32,
    /// Delay between retries in milliseconds
    pub retry_backoff_ms: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("seaflow.db"),
            busy_timeout_secs: 120,
            retry_attempts: 3,
            retry_backoff_ms: 100,
        }
    }
}

impl StorageSettings {
    /// Connection settings for [`crate::db::Repository::open`].
    pub fn storage_config(&self) -> StorageConfig {
        StorageConfig {
            busy_timeout: Duration::from_secs(self.busy_timeout_secs),
            retry: RetryPolicy {
                max_attempts: self.retry_attempts,
                backoff_delay: Duration::from_millis(self.retry_backoff_ms),
            },
        }
    }
}

// Default value functions
fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl OppConfig {
    /// Load configuration from `config/seaflow-opp.toml` and environment
    /// variables
    ///
    /// Environment variables override the file with prefix `SEAFLOW_OPP_`.
    /// Example: `SEAFLOW_OPP_APPLICATION__LOG_LEVEL=debug`
    pub fn load() -> Result<Self, figment::Error> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SEAFLOW_OPP_").split("__"))
            .extract()
    }

    /// Validate configuration after loading and any command-line overrides
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            ));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            ));
        }

        self.filter.options().validate().map_err(|e| e.to_string())?;

        if self.batch.cruise.trim().is_empty() {
            return Err("batch.cruise must be set".to_string());
        }

        if self.batch.workers == 0 {
            return Err("Invalid workers 0. Must be at least 1".to_string());
        }

        Ok(())
    }

    /// Batch settings combined with the filter parameters.
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            cruise: self.batch.cruise.clone(),
            output_dir: self.batch.output_dir.clone(),
            workers: self.batch.workers,
            options: self.filter.options(),
        }
    }
}
