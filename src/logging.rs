//! Log subscriber setup.
//!
//! Library code only emits `tracing` events (`file_id`, `opp_count` and the
//! like as fields); installing a subscriber is left to the binary and to
//! tests. Output goes to stderr so the tab-separated reports on stdout stay
//! machine-readable.
//!
//! # Example
//! ```no_run
//! use seaflow_opp::{config::OppConfig, logging};
//! use tracing::{info, warn};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = OppConfig::load()?;
//! logging::init_from_config(&config)?;
//!
//! info!("Batch started");
//! warn!(file_id = "2014_185/2014-07-04T00-00-02+00-00", "Truncated file");
//! # Ok(())
//! # }
//! ```

use crate::config::OppConfig;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::{
    filter::LevelFilter,
    fmt::{self, format::FmtSpan},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

/// Line format of the installed subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Multi-line, colored
    Pretty,
    /// One line per event
    Compact,
    /// One JSON object per event
    Json,
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(OutputFormat::Pretty),
            "compact" => Ok(OutputFormat::Compact),
            "json" => Ok(OutputFormat::Json),
            _ => Err(format!("unknown log format '{s}', expected pretty, compact or json")),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Most verbose level shown when `RUST_LOG` is unset
    pub level: Level,
    /// Line format
    pub format: OutputFormat,
    /// Log span open and close
    pub with_span_events: bool,
    /// Prefix events with their source location
    pub with_file_and_line: bool,
    /// Show the worker thread name
    pub with_thread_names: bool,
    /// Color output; JSON is never colored
    pub with_ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: OutputFormat::Compact,
            with_span_events: false,
            with_file_and_line: false,
            with_thread_names: true,
            with_ansi: true,
        }
    }
}

impl LoggingConfig {
    /// Settings from the `application` section.
    pub fn from_config(config: &OppConfig) -> Result<Self, String> {
        Ok(Self {
            level: parse_log_level(&config.application.log_level)?,
            format: config.application.log_format.parse()?,
            ..Default::default()
        })
    }

    /// Defaults with another level.
    pub fn new(level: Level) -> Self {
        Self {
            level,
            ..Default::default()
        }
    }

    /// Use `format`.
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.format = format;
        self
    }

    /// Toggle span open/close events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.with_span_events = enabled;
        self
    }

    /// Toggle color.
    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.with_ansi = enabled;
        self
    }
}

/// [`init`] with settings taken from the application configuration.
pub fn init_from_config(config: &OppConfig) -> Result<(), String> {
    init(LoggingConfig::from_config(config)?)
}

/// Install the global subscriber described by `config`.
///
/// `RUST_LOG`, when set, takes precedence over `config.level`. A second call
/// finds a subscriber already installed and leaves it in place.
///
/// # Example
/// ```no_run
/// use seaflow_opp::logging::{self, LoggingConfig, OutputFormat};
/// use tracing::Level;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let config = LoggingConfig::new(Level::DEBUG).with_format(OutputFormat::Json);
/// logging::init(config)?;
/// # Ok(())
/// # }
/// ```
pub fn init(config: LoggingConfig) -> Result<(), String> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::default().add_directive(LevelFilter::from_level(config.level).into())
    });

    let span_events = if config.with_span_events {
        FmtSpan::NEW | FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };

    let base = fmt::layer()
        .with_writer(std::io::stderr)
        .with_span_events(span_events)
        .with_file(config.with_file_and_line)
        .with_line_number(config.with_file_and_line)
        .with_thread_names(config.with_thread_names);

    let fmt_layer: Box<dyn Layer<Registry> + Send + Sync> = match config.format {
        OutputFormat::Pretty => base.pretty().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Compact => base.compact().with_ansi(config.with_ansi).boxed(),
        OutputFormat::Json => base.json().with_ansi(false).boxed(),
    };

    let installed = tracing_subscriber::registry()
        .with(fmt_layer.with_filter(env_filter))
        .try_init();
    match installed {
        Ok(()) => Ok(()),
        Err(_) if tracing::dispatcher::has_been_set() => Ok(()),
        Err(e) => Err(format!("cannot install log subscriber: {e}")),
    }
}

fn parse_log_level(level: &str) -> Result<Level, String> {
    level.parse::<Level>().map_err(|_| {
        format!("unknown log level '{level}', expected trace, debug, info, warn or error")
    })
}
