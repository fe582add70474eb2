//! Logging setup shared by the supervisor and worker processes.
//!
//! Environment overrides, applied by [`LogConfig::with_env_overrides`]:
//!
//! - `STATHARVEST_LOG` - filter directives, falling back to `RUST_LOG`
//! - `STATHARVEST_LOG_LEVEL` - error, warn, info, debug or trace
//! - `STATHARVEST_LOG_FORMAT` - pretty, compact or json
//! - `STATHARVEST_LOG_FILE` - extra log file next to stderr
//! - `STATHARVEST_LOG_ROTATION` - hourly, daily or never
//!
//! ```no_run
//! use statharvest::logging::{LogConfig, init};
//!
//! init(LogConfig::for_worker().with_env_overrides());
//! ```

use std::path::{Path, PathBuf};

use clap::ValueEnum;
use tracing::{Level, Subscriber};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::{self, MakeWriter},
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// How log events are rendered.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Multi-line, human oriented
    #[default]
    Pretty,
    /// One line per event
    Compact,
    /// Newline-delimited JSON
    Json,
}

/// When the log file starts over.
///
/// Rotated files get a date suffix on the configured file name.
#[derive(ValueEnum, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogRotation {
    Hourly,
    Daily,
    /// Always write the exact file given
    #[default]
    Never,
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

#[derive(Debug, Clone)]
pub struct LogConfig {
    pub level: Level,
    /// Filter directives; when set, `level` is ignored.
    pub filter: Option<String>,
    pub format: LogFormat,
    /// Written in addition to stderr.
    pub file_path: Option<PathBuf>,
    pub rotation: LogRotation,
    pub show_target: bool,
    /// Color escapes on stderr.
    pub ansi: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            filter: None,
            format: LogFormat::Pretty,
            file_path: None,
            rotation: LogRotation::Never,
            show_target: true,
            ansi: true,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Preset for the pool supervisor and one-shot commands.
    pub fn for_supervisor() -> Self {
        Self::default()
    }

    /// Preset for worker processes.
    ///
    /// Several workers share one stderr, so each event stays on one line
    /// and module targets give way to the span fields.
    pub fn for_worker() -> Self {
        Self {
            format: LogFormat::Compact,
            show_target: false,
            ..Self::default()
        }
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
        self.filter = Some(filter.into());
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_rotation(mut self, rotation: LogRotation) -> Self {
        self.rotation = rotation;
        self
    }

    pub fn with_ansi(mut self, ansi: bool) -> Self {
        self.ansi = ansi;
        self
    }

    /// Fill in settings from the environment.
    ///
    /// Anything already chosen on the command line is kept: an explicit
    /// filter beats `STATHARVEST_LOG`, `RUST_LOG` and
    /// `STATHARVEST_LOG_LEVEL`, and an explicit file beats
    /// `STATHARVEST_LOG_FILE`.
    pub fn with_env_overrides(mut self) -> Self {
        let var = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

        if self.filter.is_none() {
            self.filter = var("STATHARVEST_LOG").or_else(|| var("RUST_LOG"));
        }
        if self.filter.is_none()
            && let Some(level) = var("STATHARVEST_LOG_LEVEL").as_deref().and_then(parse_level)
        {
            self.level = level;
        }
        if let Some(format) = var("STATHARVEST_LOG_FORMAT")
            && let Ok(format) = LogFormat::from_str(&format, true)
        {
            self.format = format;
        }
        if self.file_path.is_none() {
            self.file_path = var("STATHARVEST_LOG_FILE").map(PathBuf::from);
        }
        if let Some(rotation) = var("STATHARVEST_LOG_ROTATION")
            && let Ok(rotation) = LogRotation::from_str(&rotation, true)
        {
            self.rotation = rotation;
        }
        self
    }

    fn env_filter(&self) -> EnvFilter {
        let by_level = || EnvFilter::new(self.level.to_string().to_lowercase());
        match &self.filter {
            Some(directives) => EnvFilter::try_new(directives).unwrap_or_else(|e| {
                eprintln!("Ignoring invalid log filter '{}': {}", directives, e);
                by_level()
            }),
            None => by_level(),
        }
    }

    fn layer<S, W>(&self, writer: W, ansi: bool) -> Box<dyn Layer<S> + Send + Sync>
    where
        S: Subscriber + for<'a> LookupSpan<'a> + Send + Sync + 'static,
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let layer = fmt::layer()
            .with_target(self.show_target)
            .with_ansi(ansi)
            .with_writer(writer);
        match self.format {
            LogFormat::Pretty => layer.pretty().boxed(),
            LogFormat::Compact => layer.compact().boxed(),
            LogFormat::Json => layer.json().boxed(),
        }
    }
}

pub fn parse_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "error" => Some(Level::ERROR),
        "warn" | "warning" => Some(Level::WARN),
        "info" => Some(Level::INFO),
        "debug" => Some(Level::DEBUG),
        "trace" => Some(Level::TRACE),
        _ => None,
    }
}

/// Appender for `path`, rotated per `rotation`.
fn file_appender(path: &Path, rotation: LogRotation) -> RollingFileAppender {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "statharvest.log".to_string());
    RollingFileAppender::new(rotation.into(), dir, name)
}

/// Install the global subscriber. Only the first call has any effect.
pub fn init(config: LogConfig) {
    let file_layer = config
        .file_path
        .as_deref()
        .map(|path| config.layer(file_appender(path, config.rotation), false));

    let _ = tracing_subscriber::registry()
        .with(config.env_filter())
        .with(config.layer(std::io::stderr, config.ansi))
        .with(file_layer)
        .try_init();
}
