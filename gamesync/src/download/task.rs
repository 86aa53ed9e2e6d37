//! Per-file work: skip check, single-file download, multi-part assembly.
//!
//! A single file is fetched into `<path>.download`, hashed, and renamed over
//! the final path. A multi-part file fetches its parts into `<path>.partN`
//! with a small worker pool and then hands back a [`PendingMerge`], so the
//! caller can start on the next file while this one is concatenated and
//! hashed.

use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::checksum::{checksums_match, file_checksum, verify_file, BUFFER_SIZE};
use super::error::{DownloadError, DownloadResult};
use super::http::{join_url, remove_partial, HttpTransfer, TransferRequest};
use super::plan::{install_path, relative_path, with_suffix, PlannedFile};
use super::progress::{ByteTracker, ProgressEvent, ProgressReporter};
use super::state::{FileState, InstallStatus, StateTable};

/// Whole-file attempts for a single file before it is marked failed.
pub const SINGLE_FILE_ATTEMPTS: u32 = 2;

/// Suffix of an in-progress single file or merge output.
pub const DOWNLOAD_SUFFIX: &str = ".download";

/// Returns `true` while new work should wait.
pub type PausePoller = Arc<dyn Fn() -> bool + Send + Sync>;

/// A poller that never pauses.
pub fn never_paused() -> PausePoller {
    Arc::new(|| false)
}

/// Everything a file task needs, shared by the tasks of one operation.
pub(crate) struct TaskContext {
    pub transfer: HttpTransfer,
    pub base_url: String,
    pub install_dir: PathBuf,
    pub reporter: ProgressReporter,
    pub token: CancelToken,
    pub pause: PausePoller,
    pub pause_poll_interval: Duration,
    pub part_concurrency: usize,
    pub part_max_attempts: Option<u32>,
    pub states: Arc<StateTable>,
}

impl TaskContext {
    /// Wait while paused. Cancellation is re-checked on every poll.
    pub async fn wait_while_paused(&self) -> DownloadResult<()> {
        loop {
            self.token.check()?;
            if !(self.pause)() {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(self.pause_poll_interval) => {}
                _ = self.token.cancelled() => return Err(DownloadError::Cancelled),
            }
        }
    }
}

/// Result of a finished single file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Downloaded { bytes: u64 },
    Skipped { bytes: u64 },
}

/// Result of the parts stage of a multi-part file.
#[derive(Debug)]
pub enum PartsOutcome {
    /// The merged file is already valid.
    Skipped { bytes: u64 },
    /// All parts are on disk and verified; merge pending.
    Merge(PendingMerge),
}

/// Classify an installed file against its manifest entry.
///
/// `expected_size` of 0 skips the size check.
pub async fn inspect_file(path: &Path, expected_size: u64, checksum: &str) -> InstallStatus {
    let actual = match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len(),
        Ok(_) => {
            return InstallStatus::Unreadable {
                reason: "not a regular file".to_string(),
            }
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => return InstallStatus::Missing,
        Err(e) => {
            return InstallStatus::Unreadable {
                reason: e.to_string(),
            }
        }
    };

    if expected_size > 0 && actual != expected_size {
        return InstallStatus::SizeMismatch {
            expected: expected_size,
            actual,
        };
    }

    match file_checksum(path.to_path_buf()).await {
        Ok(hash) if checksums_match(checksum, &hash) => InstallStatus::Valid,
        Ok(_) => InstallStatus::ChecksumMismatch,
        Err(e) => InstallStatus::Unreadable {
            reason: e.to_string(),
        },
    }
}

/// Whether an error should end the file instead of starting it over.
fn is_fatal(error: &DownloadError) -> bool {
    match error {
        DownloadError::HttpStatus { .. } => !error.is_retryable(),
        DownloadError::InvalidPath(_)
        | DownloadError::CreateDirFailed { .. }
        | DownloadError::Client(_) => true,
        _ => false,
    }
}

/// Work on one planned file.
pub(crate) struct FileTask {
    ctx: Arc<TaskContext>,
    file: PlannedFile,
    final_path: PathBuf,
}

impl FileTask {
    /// Resolve the file under the install directory.
    ///
    /// # Errors
    ///
    /// `InvalidPath` when the manifest path escapes the install directory.
    pub fn new(ctx: Arc<TaskContext>, file: PlannedFile) -> DownloadResult<Self> {
        let final_path = install_path(&ctx.install_dir, &file.path)?;
        Ok(Self {
            ctx,
            file,
            final_path,
        })
    }

    /// Report the file as already valid, if it is.
    async fn try_skip(&self) -> Option<u64> {
        let size = self.file.planned_size();
        let status = inspect_file(&self.final_path, size, &self.file.entry.checksum).await;
        if status != InstallStatus::Valid {
            debug!(path = %self.file.path, ?status, "File needs download");
            return None;
        }

        let bytes = tokio::fs::metadata(&self.final_path)
            .await
            .map(|m| m.len())
            .unwrap_or(size);
        self.ctx.reporter.file_tracker(&self.file.path).settle(bytes);
        self.ctx.states.advance(&self.file.key, FileState::Skipped);
        self.ctx.reporter.emit(ProgressEvent::FileSkipped {
            path: self.file.path.clone(),
            size: bytes,
        });
        Some(bytes)
    }

    fn start(&self) {
        self.ctx.states.advance(&self.file.key, FileState::Downloading);
        self.ctx.reporter.emit(ProgressEvent::FileStarted {
            path: self.file.path.clone(),
            size: self.file.planned_size(),
        });
    }

    /// Download, verify and publish a single file.
    pub async fn run_single(&self) -> DownloadResult<TaskOutcome> {
        self.ctx.token.check()?;
        if let Some(bytes) = self.try_skip().await {
            return Ok(TaskOutcome::Skipped { bytes });
        }
        self.start();

        let entry = &self.file.entry;
        let url = join_url(&self.ctx.base_url, &self.file.path);
        let temp = with_suffix(&self.final_path, DOWNLOAD_SUFFIX);
        let tracker = self.ctx.reporter.file_tracker(&self.file.path);
        let mut last_error = None;

        for attempt in 1..=SINGLE_FILE_ATTEMPTS {
            self.ctx.token.check()?;
            if self.ctx.states.get(&self.file.key) == Some(FileState::Verifying) {
                self.ctx.states.advance(&self.file.key, FileState::Downloading);
            }

            let resume_from = file_len(&temp).await;
            tracker.count_existing(resume_from);

            let request = TransferRequest {
                url: &url,
                dest: &temp,
                resume_from,
                expected_total: entry.size,
            };
            let on_progress = |received: u64, total: u64| tracker.observe(received, total);

            let result = match self
                .ctx
                .transfer
                .download(&request, &on_progress, &self.ctx.token)
                .await
            {
                Ok(_) => {
                    self.ctx.states.advance(&self.file.key, FileState::Verifying);
                    self.ctx.reporter.emit(ProgressEvent::VerifyStarted {
                        path: self.file.path.clone(),
                    });
                    verify_file(temp.clone(), &entry.checksum, &self.file.path).await
                }
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    let bytes = publish(&temp, &self.final_path).await?;
                    tracker.settle(bytes);
                    self.ctx.states.advance(&self.file.key, FileState::Done);
                    info!(path = %self.file.path, bytes, "File downloaded");
                    return Ok(TaskOutcome::Downloaded { bytes });
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(
                        path = %self.file.path,
                        attempt,
                        error = %e,
                        "File attempt failed, discarding download"
                    );
                    remove_partial(&temp).await?;
                    tracker.rollback();
                    let fatal = is_fatal(&e);
                    last_error = Some(e);
                    if fatal {
                        break;
                    }
                }
            }
        }

        Err(last_error.unwrap_or(DownloadError::Cancelled))
    }

    /// Fetch and verify every part of a multi-part file.
    ///
    /// Returns the deferred merge; the parts stay on disk until it runs.
    pub async fn run_parts(self) -> DownloadResult<PartsOutcome> {
        self.ctx.token.check()?;
        if let Some(bytes) = self.try_skip().await {
            return Ok(PartsOutcome::Skipped { bytes });
        }
        self.start();
        self.ctx.states.advance(&self.file.key, FileState::Parts);

        let part_count = self.file.entry.parts().len();
        let trackers: Vec<ByteTracker> = (0..part_count)
            .map(|i| self.ctx.reporter.part_tracker(&self.file.path, i))
            .collect();
        let slots = Mutex::new(vec![None; part_count]);
        let cursor = AtomicUsize::new(0);

        let workers = self.ctx.part_concurrency.clamp(1, part_count.max(1));
        debug!(path = %self.file.path, parts = part_count, workers, "Fetching parts");

        let pool = (0..workers).map(|_| self.part_worker(&cursor, &trackers, &slots));
        if let Err(e) = futures::future::try_join_all(pool).await {
            if !e.is_cancelled() {
                for tracker in &trackers {
                    tracker.rollback();
                }
            }
            return Err(e);
        }

        let mut parts = Vec::with_capacity(part_count);
        for (index, slot) in slots.into_inner().into_iter().enumerate() {
            match slot {
                Some(path) => parts.push(path),
                None => {
                    return Err(DownloadError::TaskFailed(format!(
                        "part {} of {} was never fetched",
                        index, self.file.path
                    )))
                }
            }
        }

        Ok(PartsOutcome::Merge(PendingMerge {
            ctx: self.ctx,
            file: self.file,
            final_path: self.final_path,
            parts,
            trackers,
        }))
    }

    async fn part_worker(
        &self,
        cursor: &AtomicUsize,
        trackers: &[ByteTracker],
        slots: &Mutex<Vec<Option<PathBuf>>>,
    ) -> DownloadResult<()> {
        loop {
            self.ctx.wait_while_paused().await?;
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            if index >= trackers.len() {
                return Ok(());
            }
            let path = self.fetch_part(index, &trackers[index]).await?;
            slots.lock()[index] = Some(path);
        }
    }

    async fn fetch_part(&self, index: usize, tracker: &ByteTracker) -> DownloadResult<PathBuf> {
        let part = &self.file.entry.parts()[index];
        let dest = part_path(&self.final_path, index);
        let label = format!("{} (part {})", self.file.path, index);

        if inspect_file(&dest, part.size, &part.checksum).await == InstallStatus::Valid {
            let size = file_len(&dest).await;
            tracker.count_existing(size);
            self.ctx.reporter.emit(ProgressEvent::PartSkipped {
                path: self.file.path.clone(),
                part: index,
                size,
            });
            return Ok(dest);
        }

        let url = join_url(&self.ctx.base_url, &relative_path(&part.path));
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            self.ctx.token.check()?;

            let resume_from = file_len(&dest).await;
            tracker.count_existing(resume_from);

            let request = TransferRequest {
                url: &url,
                dest: &dest,
                resume_from,
                expected_total: part.size,
            };
            let on_progress = |received: u64, total: u64| tracker.observe(received, total);

            let result = match self
                .ctx
                .transfer
                .download(&request, &on_progress, &self.ctx.token)
                .await
            {
                Ok(_) => verify_file(dest.clone(), &part.checksum, &label).await,
                Err(e) => Err(e),
            };

            let error = match result {
                Ok(()) => {
                    tracker.settle(file_len(&dest).await);
                    return Ok(dest);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            // A corrupt part starts over; an interrupted one resumes.
            if matches!(error, DownloadError::ChecksumMismatch { .. }) {
                remove_partial(&dest).await?;
            }
            tracker.rollback();
            self.ctx.reporter.emit(ProgressEvent::PartReset {
                path: self.file.path.clone(),
                part: index,
                attempt,
                reason: error.to_string(),
            });
            warn!(path = %self.file.path, part = index, attempt, error = %error, "Part failed");

            let exhausted = self
                .ctx
                .part_max_attempts
                .is_some_and(|max| attempt >= max);
            if exhausted || is_fatal(&error) {
                return Err(error);
            }
            self.ctx
                .transfer
                .config()
                .retry
                .wait(attempt, &self.ctx.token)
                .await?;
        }
    }
}

/// Deferred merge of a multi-part file whose parts are all verified.
pub struct PendingMerge {
    ctx: Arc<TaskContext>,
    file: PlannedFile,
    final_path: PathBuf,
    parts: Vec<PathBuf>,
    trackers: Vec<ByteTracker>,
}

impl std::fmt::Debug for PendingMerge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingMerge")
            .field("path", &self.file.path)
            .field("parts", &self.parts.len())
            .finish()
    }
}

impl PendingMerge {
    /// Normalized key of the file.
    pub fn key(&self) -> &str {
        &self.file.key
    }

    /// Manifest path of the file.
    pub fn path(&self) -> &str {
        &self.file.path
    }

    /// Concatenate, verify and publish.
    ///
    /// Returns the size of the published file. On checksum mismatch the
    /// merged output is deleted and the file's bytes are rolled back.
    pub async fn run(self) -> DownloadResult<u64> {
        let ctx = &self.ctx;
        ctx.token.check()?;

        let path = self.file.path.clone();
        let part_count = self.parts.len();
        ctx.states.advance(&self.file.key, FileState::Merging);
        ctx.reporter.emit(ProgressEvent::MergeStarted {
            path: path.clone(),
            parts: part_count,
        });

        let temp = with_suffix(&self.final_path, DOWNLOAD_SUFFIX);
        let merged = {
            let parts = self.parts.clone();
            let output = temp.clone();
            let reporter = ctx.reporter.clone();
            let token = ctx.token.clone();
            let path = path.clone();
            tokio::task::spawn_blocking(move || {
                merge_parts(&parts, &output, &token, |part| {
                    reporter.emit(ProgressEvent::MergePart {
                        path: path.clone(),
                        part,
                        parts: part_count,
                    })
                })
            })
            .await
            .map_err(|e| DownloadError::TaskFailed(e.to_string()))?
        };

        let (bytes, digest) = match merged {
            Ok(result) => result,
            Err(e) => {
                remove_partial(&temp).await?;
                if !e.is_cancelled() {
                    self.rollback();
                }
                return Err(e);
            }
        };
        ctx.reporter
            .emit(ProgressEvent::MergeDone { path: path.clone() });

        ctx.states.advance(&self.file.key, FileState::Verifying);
        ctx.reporter
            .emit(ProgressEvent::VerifyStarted { path: path.clone() });

        if !checksums_match(&self.file.entry.checksum, &digest) {
            remove_partial(&temp).await?;
            self.rollback();
            return Err(DownloadError::ChecksumMismatch {
                path,
                expected: self.file.entry.checksum.to_lowercase(),
                actual: digest,
            });
        }

        publish(&temp, &self.final_path).await?;
        remove_part_residue(&self.final_path).await;
        ctx.states.advance(&self.file.key, FileState::Done);
        info!(path = %path, bytes, parts = part_count, "Multi-part file assembled");
        Ok(bytes)
    }

    fn rollback(&self) {
        for tracker in &self.trackers {
            tracker.rollback();
        }
    }
}

/// `<final>.partN`.
pub fn part_path(final_path: &Path, index: usize) -> PathBuf {
    with_suffix(final_path, &format!(".part{}", index))
}

/// Concatenate parts in order into `output`, hashing as it goes.
///
/// Each part is deleted once it has been copied. `on_part` is called with
/// the index of every copied part. Returns the merged size and its hex
/// SHA-256.
pub fn merge_parts(
    parts: &[PathBuf],
    output: &Path,
    token: &CancelToken,
    mut on_part: impl FnMut(usize),
) -> DownloadResult<(u64, String)> {
    let write_error = |e: io::Error| DownloadError::WriteFailed {
        path: output.to_path_buf(),
        source: e,
    };

    let file = std::fs::File::create(output).map_err(write_error)?;
    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;

    for (index, part) in parts.iter().enumerate() {
        token.check()?;

        let read_error = |e: io::Error| DownloadError::ReadFailed {
            path: part.clone(),
            source: e,
        };
        let mut reader = BufReader::new(std::fs::File::open(part).map_err(read_error)?);

        loop {
            let read = reader.read(&mut buffer).map_err(read_error)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
            writer.write_all(&buffer[..read]).map_err(write_error)?;
            total += read as u64;
        }

        drop(reader);
        std::fs::remove_file(part).map_err(write_error)?;
        on_part(index);
    }

    writer.flush().map_err(write_error)?;
    Ok((total, format!("{:x}", hasher.finalize())))
}

/// Atomically move a verified scratch file over the final path.
async fn publish(temp: &Path, final_path: &Path) -> DownloadResult<u64> {
    tokio::fs::rename(temp, final_path)
        .await
        .map_err(|e| DownloadError::WriteFailed {
            path: final_path.to_path_buf(),
            source: e,
        })?;
    Ok(file_len(final_path).await)
}

/// Remove leftover `<final>.partN` files next to a published file.
async fn remove_part_residue(final_path: &Path) {
    let (Some(parent), Some(name)) = (final_path.parent(), final_path.file_name()) else {
        return;
    };
    let prefix = format!("{}.part", name.to_string_lossy());

    let Ok(mut entries) = tokio::fs::read_dir(parent).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let is_part = file_name
            .strip_prefix(&prefix)
            .is_some_and(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()));
        if is_part {
            debug!(path = %entry.path().display(), "Removing stray part file");
            let _ = tokio::fs::remove_file(entry.path()).await;
        }
    }
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}
