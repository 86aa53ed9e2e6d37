//! CLI error type and exit codes.

use gamesync::logging::LoggingError;
use gamesync::{ConfigError, DownloadError};
use thiserror::Error;

/// Exit code for a failed run.
pub const EXIT_FAILURE: u8 = 1;

/// Exit code for a run where some files failed or need repair.
pub const EXIT_INCOMPLETE: u8 = 2;

/// Exit code for a cancelled run (128 + SIGINT).
pub const EXIT_CANCELLED: u8 = 130;

/// Errors surfaced by CLI commands.
#[derive(Debug, Error)]
pub enum CliError {
    /// Missing or conflicting settings.
    #[error("{0}")]
    Config(String),

    #[error(transparent)]
    ConfigFile(#[from] ConfigError),

    #[error(transparent)]
    Logging(#[from] LoggingError),

    #[error(transparent)]
    Download(#[from] DownloadError),

    /// The operation finished but some files are not valid.
    #[error("{count} file(s) failed")]
    Incomplete { count: usize },

    /// Verify found files that need repair.
    #[error("{count} file(s) need repair")]
    NeedsRepair { count: usize },
}

impl CliError {
    /// Process exit code for this error.
    pub fn exit_code(&self) -> u8 {
        match self {
            CliError::Download(e) if e.is_cancelled() => EXIT_CANCELLED,
            CliError::Incomplete { .. } | CliError::NeedsRepair { .. } => EXIT_INCOMPLETE,
            _ => EXIT_FAILURE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Download(DownloadError::Cancelled).exit_code(), 130);
        assert_eq!(CliError::Incomplete { count: 1 }.exit_code(), 2);
        assert_eq!(CliError::NeedsRepair { count: 3 }.exit_code(), 2);
        assert_eq!(CliError::Config("no base url".to_string()).exit_code(), 1);
    }
}
