//! Logging setup for fanjoin.
//!
//! Logs never go to stdout, which carries merged worker output. By default
//! only warnings and errors are shown so that a normal run prints nothing
//! but what the workers print.
//!
//! While the joiner owns stderr, the feeder thread [`divert`]s its log lines
//! into the diagnostic relay so they cannot land inside a worker's record.
//!
//! # Environment Variables
//!
//! - `FANJOIN_LOG` - Log filter (overrides RUST_LOG)
//! - `FANJOIN_LOG_LEVEL` - Log level: error, warn, info, debug, trace
//! - `FANJOIN_LOG_FORMAT` - Output format: pretty, compact, json
//! - `FANJOIN_LOG_FILE` - Path to log file (in addition to stderr)
//! - `FANJOIN_LOG_ROTATION` - Log file rotation: hourly, daily, never
//! - `RUST_LOG` - Standard Rust log filter (fallback)
//!
//! # Example
//!
//! ```no_run
//! use fanjoin::logging::{LogConfig, init};
//!
//! init(LogConfig::from_verbosity(1, false).with_env_overrides());
//! ```

use std::cell::RefCell;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter, format::FmtSpan},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Log file name used when `--log-file` points at a directory-like path.
const DEFAULT_LOG_FILE: &str = "fanjoin.log";

thread_local! {
    /// Replacement for stderr on this thread, while a [`Diversion`] is live.
    static DIVERTED: RefCell<Option<Box<dyn Write>>> = const { RefCell::new(None) };
}

/// Stderr log writer that honors [`divert`] on the logging thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct StderrWriter;

impl<'a> MakeWriter<'a> for StderrWriter {
    type Writer = StderrWriter;

    fn make_writer(&'a self) -> Self::Writer {
        *self
    }
}

impl Write for StderrWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let diverted = DIVERTED
            .try_with(|slot| match slot.try_borrow_mut() {
                Ok(mut slot) => slot.as_mut().map(|writer| writer.write(buf)),
                Err(_) => None,
            })
            .ok()
            .flatten();
        match diverted {
            Some(Ok(n)) => Ok(n),
            // Diversion target gone: the line still belongs somewhere
            Some(Err(_)) | None => io::stderr().write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()
    }
}

/// Guard returned by [`divert`]; restores the previous destination on drop.
#[must_use = "log lines go back to stderr as soon as the guard is dropped"]
pub struct Diversion {
    previous: Option<Box<dyn Write>>,
}

impl Drop for Diversion {
    fn drop(&mut self) {
        let previous = self.previous.take();
        let _ = DIVERTED.try_with(|slot| {
            if let Ok(mut slot) = slot.try_borrow_mut() {
                *slot = previous;
            }
        });
    }
}

/// Send this thread's stderr log lines to `writer` until the guard drops.
///
/// Other threads keep logging to stderr. The log file, if any, is unaffected.
pub fn divert(writer: impl Write + 'static) -> Diversion {
    let previous = DIVERTED.with(|slot| slot.borrow_mut().replace(Box::new(writer)));
    Diversion { previous }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line human-readable format
    Pretty,
    /// Single-line format (default)
    #[default]
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

impl std::fmt::Display for LogFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Compact => write!(f, "compact"),
            Self::Json => write!(f, "json"),
        }
    }
}

/// Rotation of the optional log file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    /// Single file, appended to across runs (default)
    #[default]
    Never,
}

impl FromStr for LogRotation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "never" => Ok(Self::Never),
            _ => Err(format!(
                "Unknown log rotation: '{}'. Valid options: hourly, daily, never",
                s
            )),
        }
    }
}

impl From<LogRotation> for Rotation {
    fn from(rotation: LogRotation) -> Self {
        match rotation {
            LogRotation::Hourly => Rotation::HOURLY,
            LogRotation::Daily => Rotation::DAILY,
            LogRotation::Never => Rotation::NEVER,
        }
    }
}

/// Logging configuration.
///
/// Use the builder methods to customize, then pass to [`init`].
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: WARN)
    pub level: Level,
    /// Log format (default: Compact)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Rotation for file output (default: Never)
    pub rotation: LogRotation,
    /// Log span timing on close
    pub span_events: bool,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
    /// Show thread names, useful to tell feeder and joiner apart
    pub show_thread_names: bool,
    /// Emit ANSI colors on stderr
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::WARN,
            format: LogFormat::Compact,
            file_path: None,
            rotation: LogRotation::Never,
            span_events: false,
            filter: None,
            show_thread_names: false,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for `-v` repeated `verbose` times, or `-q`.
    ///
    /// An explicit flag pins the filter so environment variables cannot
    /// override it; with neither flag the environment decides.
    pub fn from_verbosity(verbose: u8, quiet: bool) -> Self {
        let level = match (quiet, verbose) {
            (true, _) => Level::ERROR,
            (false, 0) => Level::WARN,
            (false, 1) => Level::INFO,
            (false, 2) => Level::DEBUG,
            (false, _) => Level::TRACE,
        };
        let config = Self::default().with_level(level);
        if quiet || verbose > 0 {
            let config = config.with_filter(level.to_string().to_lowercase());
            Self {
                show_thread_names: verbose >= 2,
                span_events: verbose >= 3,
                ..config
            }
        } else {
            config
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    /// Enable span timing events.
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Set a custom filter string.
    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_ansi(mut self, enabled: bool) -> Self {
        self.ansi = enabled;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads from:
    /// - `FANJOIN_LOG` or `RUST_LOG` for filter (only if filter not already set from CLI)
    /// - `FANJOIN_LOG_LEVEL` for level (only if no filter is set)
    /// - `FANJOIN_LOG_FORMAT` for format
    /// - `FANJOIN_LOG_FILE` for file path
    /// - `FANJOIN_LOG_ROTATION` for file rotation
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("FANJOIN_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if self.filter.is_none()
            && let Ok(level_str) = std::env::var("FANJOIN_LOG_LEVEL")
        {
            self.level = parse_level(&level_str).unwrap_or(self.level);
        }

        if let Ok(format) = std::env::var("FANJOIN_LOG_FORMAT")
            && let Ok(f) = format.parse()
        {
            self.format = f;
        }

        if self.file_path.is_none()
            && let Ok(path) = std::env::var("FANJOIN_LOG_FILE")
        {
            self.file_path = Some(PathBuf::from(path));
        }

        if let Ok(rotation) = std::env::var("FANJOIN_LOG_ROTATION")
            && let Ok(r) = rotation.parse()
        {
            self.rotation = r;
        }

        self
    }

    /// Build the EnvFilter for this configuration.
    fn build_filter(&self) -> EnvFilter {
        let fallback = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(filter) => EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                fallback()
            }),
            None => fallback(),
        }
    }

    fn fmt_span(&self) -> FmtSpan {
        if self.span_events {
            FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        }
    }

    /// One formatting layer writing to `writer`.
    fn layer<S, W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + 'static,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_span_events(self.fmt_span())
            .with_thread_names(self.show_thread_names)
            .with_ansi(ansi)
            .with_writer(writer);

        match self.format {
            LogFormat::Json => layer.json().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Pretty => layer.pretty().boxed(),
        }
    }
}

/// Parse a log level string.
fn parse_level(s: &str) -> Option<Level> {
    match s.to_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Split a log file path into the directory and file name the appender wants.
fn appender_location(path: &Path) -> (&Path, &str) {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(DEFAULT_LOG_FILE);
    (dir, name)
}

/// Initialize the global tracing subscriber.
///
/// Logs go to stderr and, when `config.file_path` is set, also to that file
/// (without colors). Subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    let file_appender = config.file_path.as_deref().map(|path| {
        let (dir, name) = appender_location(path);
        RollingFileAppender::new(config.rotation.into(), dir, name)
    });

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(config.layer(StderrWriter, config.ansi))
        .with(file_appender.map(|appender| config.layer(appender, false)))
        .try_init();

    // Already initialized (tests, embedding) is fine
    let _ = result;
}
