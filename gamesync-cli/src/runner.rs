//! Shared command setup: config file, logging and setting resolution.

use std::path::{Path, PathBuf};

use gamesync::logging::{init_logging, LoggingGuard, LoggingOptions, DEFAULT_LOG_LEVEL};
use gamesync::{ConfigFile, DownloadConfig};
use tracing::info;

use crate::error::CliError;

/// Options accepted by every subcommand.
#[derive(Debug, Clone, Default)]
pub struct GlobalOptions {
    pub verbose: u8,
    pub config: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
}

/// Loaded settings plus the logging guard for the duration of a command.
pub struct CliRunner {
    file: ConfigFile,
    _logging: LoggingGuard,
}

impl CliRunner {
    /// Load the config file and install logging.
    pub fn new(options: &GlobalOptions) -> Result<Self, CliError> {
        let file = match &options.config {
            Some(path) => ConfigFile::load(path)?,
            None => ConfigFile::load_default()?,
        };

        let logging = init_logging(LoggingOptions {
            level: log_level(options.verbose, file.logging.level.as_deref()),
            log_dir: options.log_dir.clone().or_else(|| file.logging.dir.clone()),
            ansi: true,
        })?;

        Ok(Self {
            file,
            _logging: logging,
        })
    }

    /// Log the command being run.
    pub fn log_startup(&self, command: &str) {
        info!(
            command,
            version = env!("CARGO_PKG_VERSION"),
            "gamesync starting"
        );
    }

    /// Library config with the file's values applied.
    pub fn download_config(&self) -> DownloadConfig {
        self.file.apply(DownloadConfig::default())
    }

    /// Base URL: CLI > config file.
    pub fn base_url(&self, cli: Option<String>) -> Result<String, CliError> {
        resolve_base_url(cli, &self.file)
    }

    /// Install directory: CLI > config file > current directory.
    pub fn install_dir(&self, cli: Option<PathBuf>) -> PathBuf {
        resolve_install_dir(cli, &self.file)
    }
}

/// Filter directive for a `-v` count and the configured level.
pub fn log_level(verbose: u8, configured: Option<&str>) -> String {
    match verbose {
        0 => configured.unwrap_or(DEFAULT_LOG_LEVEL).to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

fn resolve_base_url(cli: Option<String>, file: &ConfigFile) -> Result<String, CliError> {
    cli.or_else(|| file.download.base_url.clone())
        .filter(|url| !url.trim().is_empty())
        .ok_or_else(|| {
            CliError::Config(
                "no base URL: pass --base-url or set base_url in [download]".to_string(),
            )
        })
}

fn resolve_install_dir(cli: Option<PathBuf>, file: &ConfigFile) -> PathBuf {
    cli.or_else(|| file.download.install_dir.clone())
        .unwrap_or_else(|| Path::new(".").to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file_with(base_url: Option<&str>, install_dir: Option<&str>) -> ConfigFile {
        let mut file = ConfigFile::default();
        file.download.base_url = base_url.map(str::to_string);
        file.download.install_dir = install_dir.map(PathBuf::from);
        file
    }

    #[test]
    fn test_log_level() {
        assert_eq!(log_level(0, None), "info");
        assert_eq!(log_level(0, Some("warn")), "warn");
        assert_eq!(log_level(1, Some("warn")), "debug");
        assert_eq!(log_level(3, None), "trace");
    }

    #[test]
    fn test_base_url_cli_wins() {
        let file = file_with(Some("https://a.example/1"), None);
        let url = resolve_base_url(Some("https://b.example/2".to_string()), &file).unwrap();
        assert_eq!(url, "https://b.example/2");

        let url = resolve_base_url(None, &file).unwrap();
        assert_eq!(url, "https://a.example/1");
    }

    #[test]
    fn test_base_url_missing() {
        let result = resolve_base_url(None, &ConfigFile::default());
        assert!(matches!(result, Err(CliError::Config(_))));
    }

    #[test]
    fn test_install_dir_fallbacks() {
        let file = file_with(None, Some("/games/x"));
        assert_eq!(
            resolve_install_dir(Some(PathBuf::from("/other")), &file),
            PathBuf::from("/other")
        );
        assert_eq!(resolve_install_dir(None, &file), PathBuf::from("/games/x"));
        assert_eq!(
            resolve_install_dir(None, &ConfigFile::default()),
            PathBuf::from(".")
        );
    }
}
