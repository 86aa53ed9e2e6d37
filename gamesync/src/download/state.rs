//! Per-file state and operation reports.
//!
//! Each planned file moves through
//!
//! ```text
//! Pending ─► Downloading ─► Verifying ─► Done
//!    │            │   ▲         │
//!    │            │   └─────────┘ (single-file retry)
//!    │            └─► Parts ─► Merging ─► Verifying
//!    ├─► Skipped
//!    └─► Failed (from any non-terminal state)
//! ```

use std::collections::BTreeMap;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

/// Processing state of one planned file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FileState {
    Pending,
    Downloading,
    Parts,
    Merging,
    Verifying,
    Done,
    Skipped,
    Failed,
}

impl FileState {
    /// Whether no further transition is possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Skipped | Self::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(self, next: FileState) -> bool {
        use FileState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Failed) => true,
            // Done straight from Pending happens when another caller did the work.
            (Pending, Downloading | Skipped | Done) => true,
            (Downloading, Parts | Verifying) => true,
            (Parts, Merging) => true,
            (Merging, Verifying) => true,
            (Verifying, Done | Downloading) => true,
            _ => false,
        }
    }
}

/// State of every planned file in one operation, keyed by normalized path.
#[derive(Debug, Default)]
pub struct StateTable {
    states: Mutex<BTreeMap<String, FileState>>,
}

impl StateTable {
    /// Start every key as `Pending`.
    pub fn new<'a, I>(keys: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let states = keys
            .into_iter()
            .map(|key| (key.to_string(), FileState::Pending))
            .collect();
        Self {
            states: Mutex::new(states),
        }
    }

    /// Move a file to a new state.
    ///
    /// Illegal transitions are logged and ignored; returns whether the state
    /// changed.
    pub fn advance(&self, key: &str, next: FileState) -> bool {
        let mut states = self.states.lock();
        let Some(current) = states.get_mut(key) else {
            warn!(key, ?next, "State change for unplanned file");
            return false;
        };
        if !current.can_transition_to(next) {
            warn!(key, from = ?*current, to = ?next, "Ignoring illegal state transition");
            return false;
        }
        *current = next;
        true
    }

    /// Current state of a file.
    pub fn get(&self, key: &str) -> Option<FileState> {
        self.states.lock().get(key).copied()
    }

    /// Copy of all states.
    pub fn snapshot(&self) -> BTreeMap<String, FileState> {
        self.states.lock().clone()
    }
}

/// A file that failed permanently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedFile {
    pub path: String,
    pub reason: String,
}

/// Result of a `download_all` call that was not cancelled.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DownloadReport {
    /// Version string from the manifest.
    pub game_version: String,
    /// Planned files.
    pub total_files: usize,
    /// Files fetched and verified by this call or a joined caller.
    pub downloaded: usize,
    /// Files already valid on disk.
    pub skipped: usize,
    /// Files that failed, with reasons.
    pub failed: Vec<FailedFile>,
    /// Bytes counted at the end (verified artifacts).
    pub bytes_done: u64,
    /// Planned bytes.
    pub total_bytes: u64,
    /// Final state of every planned file.
    pub states: BTreeMap<String, FileState>,
}

impl DownloadReport {
    /// Whether every planned file ended valid.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.downloaded + self.skipped == self.total_files
    }

    /// Whether any file failed.
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// Get the progress as a percentage based on bytes.
    ///
    /// Falls back to file-based progress if the total size is unknown.
    pub fn progress_percent(&self) -> f64 {
        if self.total_bytes == 0 {
            if self.total_files == 0 {
                100.0
            } else {
                ((self.downloaded + self.skipped) as f64 / self.total_files as f64) * 100.0
            }
        } else {
            (self.bytes_done as f64 / self.total_bytes as f64) * 100.0
        }
    }
}

/// Condition of one installed file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum InstallStatus {
    Valid,
    Missing,
    SizeMismatch { expected: u64, actual: u64 },
    ChecksumMismatch,
    /// The entry cannot be checked (bad path, unreadable file).
    Unreadable { reason: String },
}

impl InstallStatus {
    /// Whether the file needs to be downloaded again.
    pub fn needs_repair(&self) -> bool {
        !matches!(self, Self::Valid)
    }
}

/// Result of `verify_install`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerifyReport {
    pub game_version: String,
    /// Normalized path and status, in plan order.
    pub entries: Vec<(String, InstallStatus)>,
}

impl VerifyReport {
    /// Entries that need repair.
    pub fn needs_repair(&self) -> impl Iterator<Item = &(String, InstallStatus)> {
        self.entries.iter().filter(|(_, status)| status.needs_repair())
    }

    /// Whether every entry is valid.
    pub fn is_valid(&self) -> bool {
        self.needs_repair().next().is_none()
    }

    /// Number of valid entries.
    pub fn valid_count(&self) -> usize {
        self.entries.len() - self.needs_repair().count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_file_path() {
        let table = StateTable::new(["a.bin"]);
        assert_eq!(table.get("a.bin"), Some(FileState::Pending));
        assert!(table.advance("a.bin", FileState::Downloading));
        assert!(table.advance("a.bin", FileState::Verifying));
        // checksum mismatch, second attempt
        assert!(table.advance("a.bin", FileState::Downloading));
        assert!(table.advance("a.bin", FileState::Verifying));
        assert!(table.advance("a.bin", FileState::Done));
    }

    #[test]
    fn test_multi_part_path() {
        let table = StateTable::new(["big.pak"]);
        for next in [
            FileState::Downloading,
            FileState::Parts,
            FileState::Merging,
            FileState::Verifying,
            FileState::Done,
        ] {
            assert!(table.advance("big.pak", next), "{:?}", next);
        }
    }

    #[test]
    fn test_terminal_states_are_final() {
        let table = StateTable::new(["a.bin"]);
        assert!(table.advance("a.bin", FileState::Skipped));
        assert!(!table.advance("a.bin", FileState::Downloading));
        assert!(!table.advance("a.bin", FileState::Failed));
        assert_eq!(table.get("a.bin"), Some(FileState::Skipped));
    }

    #[test]
    fn test_illegal_transition_ignored() {
        let table = StateTable::new(["a.bin"]);
        assert!(!table.advance("a.bin", FileState::Merging));
        assert!(!table.advance("missing", FileState::Downloading));
        assert_eq!(table.get("a.bin"), Some(FileState::Pending));
    }

    #[test]
    fn test_report_completeness() {
        let mut report = DownloadReport {
            total_files: 3,
            downloaded: 2,
            skipped: 1,
            total_bytes: 100,
            bytes_done: 50,
            ..Default::default()
        };
        assert!(report.is_complete());
        assert_eq!(report.progress_percent(), 50.0);

        report.downloaded = 1;
        report.failed.push(FailedFile {
            path: "a.bin".to_string(),
            reason: "HTTP 404".to_string(),
        });
        assert!(!report.is_complete());
        assert!(report.has_failures());
    }

    #[test]
    fn test_empty_report_is_complete() {
        let report = DownloadReport::default();
        assert!(report.is_complete());
        assert_eq!(report.progress_percent(), 100.0);
    }

    #[test]
    fn test_verify_report() {
        let report = VerifyReport {
            game_version: "1".to_string(),
            entries: vec![
                ("a.bin".to_string(), InstallStatus::Valid),
                ("b.bin".to_string(), InstallStatus::Missing),
                (
                    "c.bin".to_string(),
                    InstallStatus::SizeMismatch {
                        expected: 5,
                        actual: 3,
                    },
                ),
            ],
        };
        assert!(!report.is_valid());
        assert_eq!(report.valid_count(), 1);
        assert_eq!(report.needs_repair().count(), 2);
    }
}
