//! Configuration for the download engine.
//!
//! [`DownloadConfig`] and [`TransferConfig`] are plain builder-style structs
//! with working defaults. [`ConfigFile`] reads the optional `config.ini`
//! and layers its values over a `DownloadConfig`; command-line flags are
//! applied after that by the caller.
//!
//! ```ini
//! [download]
//! base_url = https://cdn.example.com/game/1.4.2
//! install_dir = /games/example
//! concurrency = 4
//! part_concurrency = 4
//! include_optional = false
//!
//! [network]
//! max_attempts = 6
//! connect_timeout_secs = 30
//! read_timeout_secs = 60
//! stall_timeout_secs = 30
//!
//! [logging]
//! dir = /var/log/gamesync
//! level = info
//! ```

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use ini::{Ini, Properties};
use thiserror::Error;

use crate::download::retry::RetryPolicy;

/// Default number of concurrent single-file workers.
pub const DEFAULT_CONCURRENCY: usize = 4;

/// Default number of concurrent part workers per multi-part file.
pub const DEFAULT_PART_CONCURRENCY: usize = 4;

/// Default transfer attempts before a transfer gives up.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 6;

/// Default pause poll interval (250ms).
pub const DEFAULT_PAUSE_POLL_MS: u64 = 250;

const CONFIG_DIR_NAME: &str = "gamesync";
const CONFIG_FILE_NAME: &str = "config.ini";

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("failed to read config file {}: {source}", path.display())]
    Read { path: PathBuf, source: io::Error },

    /// The file is not valid INI.
    #[error("failed to parse config file {}: {reason}", path.display())]
    Parse { path: PathBuf, reason: String },

    /// A key holds a value of the wrong type or range.
    #[error("invalid value '{value}' for [{section}] {key}")]
    InvalidValue {
        section: String,
        key: String,
        value: String,
    },
}

/// Settings for the single-request transfer primitive.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Attempts per transfer call, including the first.
    pub max_attempts: u32,
    /// Backoff between attempts.
    pub retry: RetryPolicy,
    /// Socket connect timeout.
    pub connect_timeout: Duration,
    /// Socket read timeout (time between two reads).
    pub read_timeout: Duration,
    /// How often the stall watchdog looks at the stream.
    pub stall_check_interval: Duration,
    /// Stall threshold on the first attempt.
    pub stall_timeout: Duration,
    /// Added to the stall threshold for every later attempt.
    pub stall_timeout_step: Duration,
    /// Upper bound of the stall threshold.
    pub stall_timeout_max: Duration,
    /// User-Agent header sent with every request.
    pub user_agent: String,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            retry: RetryPolicy::exponential(),
            connect_timeout: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            stall_check_interval: Duration::from_secs(10),
            stall_timeout: Duration::from_secs(30),
            stall_timeout_step: Duration::from_secs(15),
            stall_timeout_max: Duration::from_secs(90),
            user_agent: format!("gamesync/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl TransferConfig {
    /// Stall threshold for a given attempt (1-based).
    pub fn stall_timeout_for(&self, attempt: u32) -> Duration {
        let extra = self.stall_timeout_step * attempt.saturating_sub(1);
        (self.stall_timeout + extra).min(self.stall_timeout_max)
    }

    /// Set the attempt bound (at least 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Set the backoff policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the socket connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the socket read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Set the stall watchdog check interval and first-attempt threshold.
    pub fn with_stall_detection(mut self, check_interval: Duration, timeout: Duration) -> Self {
        self.stall_check_interval = check_interval;
        self.stall_timeout = timeout;
        self.stall_timeout_max = self.stall_timeout_max.max(timeout);
        self
    }
}

/// Settings for one orchestrator.
#[derive(Debug, Clone)]
pub struct DownloadConfig {
    /// Concurrent single-file workers.
    pub concurrency: usize,
    /// Concurrent part workers for each multi-part file.
    pub part_concurrency: usize,
    /// Whether optional manifest entries are downloaded.
    pub include_optional: bool,
    /// Cap on attempts per part; `None` retries until success or cancel.
    pub part_max_attempts: Option<u32>,
    /// How often a paused worker re-checks the pause poller.
    pub pause_poll_interval: Duration,
    /// Minimum spacing of per-chunk progress events per artifact.
    pub progress_interval: Duration,
    /// Transfer settings.
    pub transfer: TransferConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            part_concurrency: DEFAULT_PART_CONCURRENCY,
            include_optional: false,
            part_max_attempts: None,
            pause_poll_interval: Duration::from_millis(DEFAULT_PAUSE_POLL_MS),
            progress_interval: Duration::from_millis(
                crate::download::progress::DEFAULT_PROGRESS_INTERVAL_MS,
            ),
            transfer: TransferConfig::default(),
        }
    }
}

impl DownloadConfig {
    /// Set the single-file worker count (at least 1).
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    /// Set the part worker count (at least 1).
    pub fn with_part_concurrency(mut self, workers: usize) -> Self {
        self.part_concurrency = workers.max(1);
        self
    }

    /// Include optional entries by default.
    pub fn with_include_optional(mut self, include: bool) -> Self {
        self.include_optional = include;
        self
    }

    /// Cap part retries.
    pub fn with_part_max_attempts(mut self, attempts: Option<u32>) -> Self {
        self.part_max_attempts = attempts.map(|a| a.max(1));
        self
    }

    /// Set the pause poll interval.
    pub fn with_pause_poll_interval(mut self, interval: Duration) -> Self {
        self.pause_poll_interval = interval;
        self
    }

    /// Set the progress throttle interval.
    pub fn with_progress_interval(mut self, interval: Duration) -> Self {
        self.progress_interval = interval;
        self
    }

    /// Set the transfer settings.
    pub fn with_transfer(mut self, transfer: TransferConfig) -> Self {
        self.transfer = transfer;
        self
    }
}

/// `[download]` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DownloadSection {
    pub base_url: Option<String>,
    pub install_dir: Option<PathBuf>,
    pub concurrency: Option<usize>,
    pub part_concurrency: Option<usize>,
    pub include_optional: Option<bool>,
}

/// `[network]` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkSection {
    pub max_attempts: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub read_timeout_secs: Option<u64>,
    pub stall_timeout_secs: Option<u64>,
}

/// `[logging]` section.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LoggingSection {
    pub dir: Option<PathBuf>,
    pub level: Option<String>,
}

/// Values read from `config.ini`. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConfigFile {
    pub download: DownloadSection,
    pub network: NetworkSection,
    pub logging: LoggingSection,
}

impl ConfigFile {
    /// `<config dir>/gamesync/config.ini`, if the platform has a config dir.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// Load the file at the default location; missing file gives defaults.
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) => Self::load(&path),
            None => Ok(Self::default()),
        }
    }

    /// Load a config file; a missing file gives defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: e,
                })
            }
        };
        Self::parse(&text).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse INI text.
    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let ini = Ini::load_from_str(text).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;

        let mut file = Self::default();

        if let Some(section) = ini.section(Some("download")) {
            file.download = DownloadSection {
                base_url: string_value(section, "base_url"),
                install_dir: string_value(section, "install_dir").map(PathBuf::from),
                concurrency: parse_value(section, "download", "concurrency")?,
                part_concurrency: parse_value(section, "download", "part_concurrency")?,
                include_optional: parse_value(section, "download", "include_optional")?,
            };
        }

        if let Some(section) = ini.section(Some("network")) {
            file.network = NetworkSection {
                max_attempts: parse_value(section, "network", "max_attempts")?,
                connect_timeout_secs: parse_value(section, "network", "connect_timeout_secs")?,
                read_timeout_secs: parse_value(section, "network", "read_timeout_secs")?,
                stall_timeout_secs: parse_value(section, "network", "stall_timeout_secs")?,
            };
        }

        if let Some(section) = ini.section(Some("logging")) {
            file.logging = LoggingSection {
                dir: string_value(section, "dir").map(PathBuf::from),
                level: string_value(section, "level"),
            };
        }

        Ok(file)
    }

    /// Layer the file's values over a config.
    pub fn apply(&self, mut config: DownloadConfig) -> DownloadConfig {
        if let Some(workers) = self.download.concurrency {
            config = config.with_concurrency(workers);
        }
        if let Some(workers) = self.download.part_concurrency {
            config = config.with_part_concurrency(workers);
        }
        if let Some(include) = self.download.include_optional {
            config.include_optional = include;
        }
        if let Some(attempts) = self.network.max_attempts {
            config.transfer = config.transfer.with_max_attempts(attempts);
        }
        if let Some(secs) = self.network.connect_timeout_secs {
            config.transfer.connect_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.network.read_timeout_secs {
            config.transfer.read_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = self.network.stall_timeout_secs {
            let check = config.transfer.stall_check_interval;
            config.transfer = config
                .transfer
                .with_stall_detection(check, Duration::from_secs(secs));
        }
        config
    }
}

fn string_value(section: &Properties, key: &str) -> Option<String> {
    section
        .get(key)
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_value<T: FromStr>(
    section: &Properties,
    section_name: &str,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match string_value(section, key) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                section: section_name.to_string(),
                key: key.to_string(),
                value: raw,
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = DownloadConfig::default();
        assert_eq!(config.concurrency, 4);
        assert_eq!(config.part_concurrency, 4);
        assert!(!config.include_optional);
        assert!(config.part_max_attempts.is_none());
        assert_eq!(config.pause_poll_interval, Duration::from_millis(250));
        assert_eq!(config.progress_interval, Duration::from_millis(100));
        assert_eq!(config.transfer.max_attempts, 6);
    }

    #[test]
    fn test_builder_pattern() {
        let config = DownloadConfig::default()
            .with_concurrency(0)
            .with_part_concurrency(8)
            .with_include_optional(true)
            .with_part_max_attempts(Some(3));

        assert_eq!(config.concurrency, 1);
        assert_eq!(config.part_concurrency, 8);
        assert!(config.include_optional);
        assert_eq!(config.part_max_attempts, Some(3));
    }

    #[test]
    fn test_stall_timeout_grows_and_caps() {
        let transfer = TransferConfig::default();
        assert_eq!(transfer.stall_timeout_for(1), Duration::from_secs(30));
        assert_eq!(transfer.stall_timeout_for(2), Duration::from_secs(45));
        assert_eq!(transfer.stall_timeout_for(3), Duration::from_secs(60));
        assert_eq!(transfer.stall_timeout_for(5), Duration::from_secs(90));
        assert_eq!(transfer.stall_timeout_for(50), Duration::from_secs(90));
    }

    #[test]
    fn test_parse_full_file() {
        let text = r#"
[download]
base_url = https://cdn.example.com/game
install_dir = /games/example
concurrency = 2
part_concurrency = 6
include_optional = true

[network]
max_attempts = 3
connect_timeout_secs = 5
read_timeout_secs = 15
stall_timeout_secs = 20

[logging]
dir = /tmp/logs
level = debug
"#;
        let file = ConfigFile::parse(text).unwrap();
        assert_eq!(
            file.download.base_url.as_deref(),
            Some("https://cdn.example.com/game")
        );
        assert_eq!(file.download.install_dir, Some(PathBuf::from("/games/example")));
        assert_eq!(file.network.max_attempts, Some(3));
        assert_eq!(file.logging.level.as_deref(), Some("debug"));

        let config = file.apply(DownloadConfig::default());
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.part_concurrency, 6);
        assert!(config.include_optional);
        assert_eq!(config.transfer.max_attempts, 3);
        assert_eq!(config.transfer.connect_timeout, Duration::from_secs(5));
        assert_eq!(config.transfer.read_timeout, Duration::from_secs(15));
        assert_eq!(config.transfer.stall_timeout, Duration::from_secs(20));
    }

    #[test]
    fn test_parse_invalid_value() {
        let result = ConfigFile::parse("[download]\nconcurrency = many\n");
        match result {
            Err(ConfigError::InvalidValue { section, key, value }) => {
                assert_eq!(section, "download");
                assert_eq!(key, "concurrency");
                assert_eq!(value, "many");
            }
            other => panic!("Expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let temp = TempDir::new().unwrap();
        let file = ConfigFile::load(&temp.path().join("missing.ini")).unwrap();
        assert_eq!(file, ConfigFile::default());
    }

    #[test]
    fn test_load_from_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.ini");
        std::fs::write(&path, "[network]\nmax_attempts = 9\n").unwrap();

        let file = ConfigFile::load(&path).unwrap();
        assert_eq!(file.network.max_attempts, Some(9));
        assert_eq!(file.download, DownloadSection::default());
    }
}
