//! Tracing subscriber setup.
//!
//! Console output always goes to stderr (stdout belongs to the progress
//! display). When a log directory is configured, a second layer writes
//! plain-text logs to a daily rolling file through a non-blocking writer.
//!
//! `RUST_LOG` overrides the configured level.

use std::io;
use std::path::PathBuf;

use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::UtcOffset;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Default level when neither `RUST_LOG` nor the config sets one.
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// File name prefix of rolling log files.
pub const LOG_FILE_PREFIX: &str = "gamesync.log";

/// Errors installing the subscriber.
#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("failed to create log directory {}: {source}", path.display())]
    CreateDir { path: PathBuf, source: io::Error },

    #[error("failed to install tracing subscriber: {0}")]
    Init(String),
}

/// Logging settings.
#[derive(Debug, Clone)]
pub struct LoggingOptions {
    /// Filter directive, e.g. `info` or `gamesync=debug`.
    pub level: String,
    /// Directory for rolling log files; `None` logs to the console only.
    pub log_dir: Option<PathBuf>,
    /// Colored console output.
    pub ansi: bool,
}

impl Default for LoggingOptions {
    fn default() -> Self {
        Self {
            level: DEFAULT_LOG_LEVEL.to_string(),
            log_dir: None,
            ansi: true,
        }
    }
}

/// Keeps the file writer alive; logs are flushed when it is dropped.
#[derive(Debug)]
pub struct LoggingGuard {
    _file: Option<WorkerGuard>,
}

/// Build the level filter, letting `RUST_LOG` win.
pub fn build_filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

fn local_timer() -> OffsetTime<Rfc3339> {
    OffsetTime::local_rfc_3339().unwrap_or_else(|_| OffsetTime::new(UtcOffset::UTC, Rfc3339))
}

/// Install the global subscriber.
///
/// # Errors
///
/// Fails if the log directory cannot be created or a subscriber is already
/// installed.
pub fn init_logging(options: LoggingOptions) -> Result<LoggingGuard, LoggingError> {
    let console = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_timer(local_timer())
        .with_ansi(options.ansi)
        .with_target(false);

    let (file_layer, file_guard) = match &options.log_dir {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| LoggingError::CreateDir {
                path: dir.clone(),
                source: e,
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_timer(local_timer())
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(build_filter(&options.level))
        .with(console)
        .with(file_layer)
        .try_init()
        .map_err(|e| LoggingError::Init(e.to_string()))?;

    Ok(LoggingGuard { _file: file_guard })
}
