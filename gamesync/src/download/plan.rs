//! Work planning: turn a manifest into ordered work for one operation.
//!
//! Planning normalizes paths, drops optional entries unless requested,
//! removes duplicates (first occurrence wins) and splits the remaining files
//! into single-request files and multi-part files.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::error::{DownloadError, DownloadResult};
use crate::manifest::{FileEntry, Manifest};

/// Normalize a manifest path to its comparison key.
///
/// Lowercase, `\` replaced by `/`, leading `./` and `/` stripped.
pub fn normalize_key(path: &str) -> String {
    relative_path(path).to_lowercase()
}

/// Normalize separators and strip leading `./` and `/`, keeping case.
pub fn relative_path(path: &str) -> String {
    let slashed = path.replace('\\', "/");
    strip_leading(&slashed).to_string()
}

fn strip_leading(mut path: &str) -> &str {
    loop {
        if let Some(stripped) = path.strip_prefix("./") {
            path = stripped;
        } else if let Some(stripped) = path.strip_prefix('/') {
            path = stripped;
        } else {
            return path;
        }
    }
}

/// Resolve a normalized relative path under the install directory.
///
/// # Errors
///
/// `InvalidPath` for empty paths, `..` components and drive prefixes.
pub fn install_path(install_dir: &Path, relative: &str) -> DownloadResult<PathBuf> {
    let invalid = || DownloadError::InvalidPath(relative.to_string());

    if relative.is_empty() {
        return Err(invalid());
    }
    let bytes = relative.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(invalid());
    }

    let mut resolved = install_dir.to_path_buf();
    for component in relative.split('/') {
        match component {
            "" | "." => continue,
            ".." => return Err(invalid()),
            name => resolved.push(name),
        }
    }
    if resolved == install_dir {
        return Err(invalid());
    }
    Ok(resolved)
}

/// Key identifying one install target across callers.
///
/// Two requests collide only when they write the same file of the same
/// install directory.
pub fn target_key(install_dir: &Path, key: &str) -> String {
    format!("{}::{}", install_dir.display(), key)
}

/// Append a suffix to a file name (`a.bin` → `a.bin.download`).
pub fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}

/// One file of the plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedFile {
    /// Comparison key (lowercase, normalized).
    pub key: String,
    /// Normalized relative path, original case.
    pub path: String,
    /// The manifest entry.
    pub entry: FileEntry,
}

impl PlannedFile {
    /// Bytes this file contributes to the plan total.
    pub fn planned_size(&self) -> u64 {
        self.entry.planned_size()
    }
}

/// Planned work for one `download_all` call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkPlan {
    /// Files fetched with one request each, in manifest order.
    pub singles: Vec<PlannedFile>,
    /// Files assembled from parts, in manifest order.
    pub multis: Vec<PlannedFile>,
    /// Sum of planned sizes.
    pub total_bytes: u64,
    /// Optional entries left out.
    pub optional_dropped: usize,
    /// Entries dropped as duplicates of an earlier key.
    pub duplicates_dropped: usize,
}

impl WorkPlan {
    /// Build the plan for a manifest.
    pub fn build(manifest: &Manifest, include_optional: bool) -> Self {
        let mut plan = Self::default();
        let mut seen = HashSet::new();

        for entry in &manifest.files {
            if entry.optional && !include_optional {
                plan.optional_dropped += 1;
                continue;
            }

            let key = normalize_key(&entry.path);
            if !seen.insert(key.clone()) {
                plan.duplicates_dropped += 1;
                continue;
            }

            let file = PlannedFile {
                key,
                path: relative_path(&entry.path),
                entry: entry.clone(),
            };
            plan.total_bytes += file.planned_size();
            if entry.is_multi_part() {
                plan.multis.push(file);
            } else {
                plan.singles.push(file);
            }
        }

        debug!(
            singles = plan.singles.len(),
            multis = plan.multis.len(),
            total_bytes = plan.total_bytes,
            optional_dropped = plan.optional_dropped,
            duplicates_dropped = plan.duplicates_dropped,
            "Work plan built"
        );
        plan
    }

    /// Number of planned files.
    pub fn total_files(&self) -> usize {
        self.singles.len() + self.multis.len()
    }

    /// All planned files, singles first.
    pub fn files(&self) -> impl Iterator<Item = &PlannedFile> {
        self.singles.iter().chain(self.multis.iter())
    }
}
