//! Error types for the download engine.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Result type for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// HTTP statuses that are worth retrying after a backoff.
const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// Errors that can occur while fetching a manifest or its files.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The operation was cancelled through its `CancelToken`.
    ///
    /// Never retried; always propagates to the caller of `download_all`.
    #[error("download cancelled")]
    Cancelled,

    /// The manifest could not be fetched.
    #[error("failed to fetch manifest from {url}: {reason}")]
    ManifestFetch { url: String, reason: String },

    /// The manifest body was not valid JSON for the expected schema.
    #[error("failed to parse manifest from {url}: {reason}")]
    ManifestParse { url: String, reason: String },

    /// A request failed below the HTTP layer (socket, DNS, body stream).
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        retryable: bool,
        #[source]
        source: reqwest::Error,
    },

    /// The response body ended before the advertised length.
    #[error("{url} ended after {received} of {expected} bytes")]
    Truncated {
        url: String,
        received: u64,
        expected: u64,
    },

    /// The server answered with a status the transfer cannot use.
    #[error("{url} returned HTTP {status}")]
    HttpStatus { url: String, status: u16 },

    /// No bytes arrived for longer than the stall threshold.
    #[error("no data received from {url} for {}s", idle.as_secs())]
    Stalled { url: String, idle: Duration },

    /// The server answered a ranged request with the full body.
    #[error("server ignored range request for {url} at offset {offset}")]
    RangeIgnored { url: String, offset: u64 },

    /// The server rejected the resume offset.
    #[error("range not satisfiable for {url} at offset {offset}")]
    RangeNotSatisfiable { url: String, offset: u64 },

    /// Downloaded content did not hash to the manifest checksum.
    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    /// Failed to read a file.
    #[error("failed to read {}: {source}", path.display())]
    ReadFailed { path: PathBuf, source: io::Error },

    /// Failed to write, rename or remove a file.
    #[error("failed to write {}: {source}", path.display())]
    WriteFailed { path: PathBuf, source: io::Error },

    /// Failed to create a directory.
    #[error("failed to create directory {}: {source}", path.display())]
    CreateDirFailed { path: PathBuf, source: io::Error },

    /// A manifest path escapes the install directory or is otherwise unusable.
    #[error("invalid path: {0}")]
    InvalidPath(String),

    /// The shared HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    Client(#[source] reqwest::Error),

    /// A background task panicked or was aborted.
    #[error("background task failed: {0}")]
    TaskFailed(String),
}

impl DownloadError {
    /// Whether this error is the cancellation sentinel.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether the transfer layer should back off and resume.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport { retryable, .. } => *retryable,
            Self::Stalled { .. } | Self::Truncated { .. } => true,
            Self::HttpStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }

    /// Whether the transfer should discard its partial file and restart at 0.
    pub fn requires_restart(&self) -> bool {
        matches!(
            self,
            Self::RangeIgnored { .. } | Self::RangeNotSatisfiable { .. }
        )
    }
}

/// Whether an HTTP status is transient (rate limiting or gateway trouble).
pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUSES.contains(&status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancelled_is_not_retryable() {
        let err = DownloadError::Cancelled;
        assert!(err.is_cancelled());
        assert!(!err.is_retryable());
        assert!(!err.requires_restart());
    }

    #[test]
    fn test_retryable_statuses() {
        for status in [429, 500, 502, 503, 504] {
            let err = DownloadError::HttpStatus {
                url: "http://origin/a".to_string(),
                status,
            };
            assert!(err.is_retryable(), "{} should be retryable", status);
        }

        for status in [400, 403, 404, 410, 501] {
            let err = DownloadError::HttpStatus {
                url: "http://origin/a".to_string(),
                status,
            };
            assert!(!err.is_retryable(), "{} should be fatal", status);
        }
    }

    #[test]
    fn test_stall_is_retryable() {
        let err = DownloadError::Stalled {
            url: "http://origin/a".to_string(),
            idle: Duration::from_secs(31),
        };
        assert!(err.is_retryable());
        assert!(err.to_string().contains("31s"));
    }

    #[test]
    fn test_range_errors_require_restart() {
        let ignored = DownloadError::RangeIgnored {
            url: "http://origin/a".to_string(),
            offset: 10,
        };
        let unsatisfiable = DownloadError::RangeNotSatisfiable {
            url: "http://origin/a".to_string(),
            offset: 10,
        };
        assert!(ignored.requires_restart());
        assert!(unsatisfiable.requires_restart());
        assert!(!ignored.is_retryable());
    }

    #[test]
    fn test_checksum_mismatch_display() {
        let err = DownloadError::ChecksumMismatch {
            path: "data/a.pak".to_string(),
            expected: "abc".to_string(),
            actual: "def".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("data/a.pak"));
        assert!(msg.contains("expected abc"));
    }
}
