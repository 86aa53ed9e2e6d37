//! Manifest download orchestrator.
//!
//! [`Orchestrator::download_all`] fetches the manifest, plans the work and
//! runs it in two stages:
//!
//! ```text
//! Stage 1: singles   ── `concurrency` workers ── FileTask::run_single
//!              │
//!              ▼  (wait for in-flight singles of other callers)
//! Stage 2: multis    ── one file at a time ── FileTask::run_parts
//!                                      │
//!                                      └── PendingMerge::run (spawned)
//! ```
//!
//! Every install target (install directory plus file key) is claimed in the
//! session's [`InFlightMap`] first, so callers sharing a [`DownloadSession`]
//! never fetch the same file into the same place twice.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::error::{DownloadError, DownloadResult};
use super::http::HttpTransfer;
use super::inflight::{Claim, FileOutcome, InFlightGuard, InFlightMap};
use super::plan::{install_path, target_key, PlannedFile, WorkPlan};
use super::progress::{ProgressEvent, ProgressReporter, ProgressSink};
use super::state::{
    DownloadReport, FailedFile, FileState, InstallStatus, StateTable, VerifyReport,
};
use super::task::{
    inspect_file, FileTask, PartsOutcome, PausePoller, TaskContext, TaskOutcome,
};
use crate::config::{DownloadConfig, TransferConfig};
use crate::manifest::{HttpManifestClient, Manifest, ManifestClient};

/// One download request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    /// Base URL of the game version on the origin.
    pub base_url: String,
    /// Local install directory.
    pub install_dir: PathBuf,
    /// Include optional manifest entries.
    pub include_optional: bool,
    /// Concurrent single-file workers.
    pub concurrency: usize,
    /// Concurrent part workers per multi-part file.
    pub part_concurrency: usize,
}

impl DownloadRequest {
    /// Request with the default worker counts.
    pub fn new(base_url: impl Into<String>, install_dir: impl Into<PathBuf>) -> Self {
        Self::from_config(base_url, install_dir, &DownloadConfig::default())
    }

    /// Request that takes its defaults from a config.
    pub fn from_config(
        base_url: impl Into<String>,
        install_dir: impl Into<PathBuf>,
        config: &DownloadConfig,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            install_dir: install_dir.into(),
            include_optional: config.include_optional,
            concurrency: config.concurrency,
            part_concurrency: config.part_concurrency,
        }
    }

    /// Also fetch optional manifest entries.
    pub fn with_include_optional(mut self, include: bool) -> Self {
        self.include_optional = include;
        self
    }

    /// Set the single-file worker count (at least 1).
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.concurrency = workers.max(1);
        self
    }

    /// Set the part worker count per multi-part file (at least 1).
    pub fn with_part_concurrency(mut self, workers: usize) -> Self {
        self.part_concurrency = workers.max(1);
        self
    }
}

/// State shared by orchestrators that must not duplicate each other's work.
///
/// Holds the connection pool and the in-flight map.
#[derive(Debug)]
pub struct DownloadSession {
    transfer: HttpTransfer,
    in_flight: InFlightMap,
}

impl DownloadSession {
    /// Create a session with its own HTTP client.
    pub fn new(config: TransferConfig) -> DownloadResult<Arc<Self>> {
        Ok(Arc::new(Self {
            transfer: HttpTransfer::new(config)?,
            in_flight: InFlightMap::new(),
        }))
    }

    /// The shared transfer primitive.
    pub fn transfer(&self) -> &HttpTransfer {
        &self.transfer
    }

    /// The in-flight map.
    pub fn in_flight(&self) -> &InFlightMap {
        &self.in_flight
    }
}

/// Per-operation tallies, shared with merge tasks.
#[derive(Debug, Default)]
struct Tally {
    downloaded: AtomicUsize,
    skipped: AtomicUsize,
    failed: Mutex<Vec<FailedFile>>,
}

/// Runs download and verify operations against one origin.
pub struct Orchestrator {
    config: DownloadConfig,
    session: Arc<DownloadSession>,
    manifests: Arc<dyn ManifestClient>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("config", &self.config)
            .field("session", &self.session)
            .finish()
    }
}

impl Orchestrator {
    /// Create an orchestrator with its own session.
    pub fn new(config: DownloadConfig) -> DownloadResult<Self> {
        let session = DownloadSession::new(config.transfer.clone())?;
        Ok(Self::with_session(config, session))
    }

    /// Create an orchestrator that shares a session (and its dedupe) with
    /// others.
    pub fn with_session(config: DownloadConfig, session: Arc<DownloadSession>) -> Self {
        let manifests = Arc::new(HttpManifestClient::new(session.transfer.client().clone()));
        Self {
            config,
            session,
            manifests,
        }
    }

    /// Replace the manifest source.
    pub fn with_manifest_client(mut self, manifests: Arc<dyn ManifestClient>) -> Self {
        self.manifests = manifests;
        self
    }

    /// The session this orchestrator uses.
    pub fn session(&self) -> &Arc<DownloadSession> {
        &self.session
    }

    /// Engine configuration.
    pub fn config(&self) -> &DownloadConfig {
        &self.config
    }

    async fn fetch_manifest(
        &self,
        request: &DownloadRequest,
        token: &CancelToken,
    ) -> DownloadResult<Manifest> {
        token.check()?;
        tokio::select! {
            biased;
            _ = token.cancelled() => Err(DownloadError::Cancelled),
            manifest = self.manifests.fetch(&request.base_url) => manifest,
        }
    }

    /// Bring the install directory in line with the manifest.
    ///
    /// # Errors
    ///
    /// Only cancellation and manifest failures are errors; per-file failures
    /// are listed in the report.
    pub async fn download_all(
        &self,
        request: &DownloadRequest,
        token: &CancelToken,
        pause: PausePoller,
        sink: Arc<dyn ProgressSink>,
    ) -> DownloadResult<DownloadReport> {
        let manifest = self.fetch_manifest(request, token).await?;
        let plan = WorkPlan::build(&manifest, request.include_optional);

        let reporter = ProgressReporter::new(sink, self.config.progress_interval);
        reporter
            .counters()
            .set_totals(plan.total_bytes, plan.total_files());
        reporter.emit(ProgressEvent::TotalBytes {
            total: plan.total_bytes,
            files: plan.total_files(),
        });
        info!(
            version = %manifest.game_version,
            files = plan.total_files(),
            bytes = plan.total_bytes,
            install_dir = %request.install_dir.display(),
            "Starting download"
        );

        let ctx = Arc::new(TaskContext {
            transfer: self.session.transfer.clone(),
            base_url: request.base_url.clone(),
            install_dir: request.install_dir.clone(),
            reporter: reporter.clone(),
            token: token.clone(),
            pause,
            pause_poll_interval: self.config.pause_poll_interval,
            part_concurrency: request.part_concurrency.max(1),
            part_max_attempts: self.config.part_max_attempts,
            states: Arc::new(StateTable::new(plan.files().map(|f| f.key.as_str()))),
        });
        let tally = Arc::new(Tally::default());

        self.run_singles(&ctx, &tally, &plan.singles, request.concurrency)
            .await?;

        let single_keys: Vec<String> = plan
            .singles
            .iter()
            .map(|f| target_key(&request.install_dir, &f.key))
            .collect();
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            _ = self.session.in_flight.wait_idle(single_keys.iter().map(String::as_str)) => {}
        }
        debug!(singles = plan.singles.len(), "Single files finished");

        let mut merges = Vec::new();
        let staged = self.run_multis(&ctx, &tally, &plan.multis, &mut merges).await;
        for merge in merges {
            if let Err(e) = merge.await {
                warn!(error = %e, "Merge task failed");
            }
        }
        staged?;
        token.check()?;

        let mut failed = std::mem::take(&mut *tally.failed.lock());
        failed.sort_by(|a, b| a.path.cmp(&b.path));

        let report = DownloadReport {
            game_version: manifest.game_version,
            total_files: plan.total_files(),
            downloaded: tally.downloaded.load(Ordering::SeqCst),
            skipped: tally.skipped.load(Ordering::SeqCst),
            failed,
            bytes_done: reporter.counters().bytes_done(),
            total_bytes: plan.total_bytes,
            states: ctx.states.snapshot(),
        };
        info!(
            downloaded = report.downloaded,
            skipped = report.skipped,
            failed = report.failed.len(),
            bytes = report.bytes_done,
            "Download finished"
        );
        Ok(report)
    }

    async fn run_singles(
        &self,
        ctx: &Arc<TaskContext>,
        tally: &Arc<Tally>,
        files: &[PlannedFile],
        concurrency: usize,
    ) -> DownloadResult<()> {
        if files.is_empty() {
            return Ok(());
        }
        let cursor = AtomicUsize::new(0);
        let workers = concurrency.clamp(1, files.len());
        let pool = (0..workers).map(|_| self.single_worker(ctx, tally, files, &cursor));
        futures::future::try_join_all(pool).await?;
        Ok(())
    }

    async fn single_worker(
        &self,
        ctx: &Arc<TaskContext>,
        tally: &Arc<Tally>,
        files: &[PlannedFile],
        cursor: &AtomicUsize,
    ) -> DownloadResult<()> {
        loop {
            ctx.wait_while_paused().await?;
            let index = cursor.fetch_add(1, Ordering::SeqCst);
            let Some(file) = files.get(index) else {
                return Ok(());
            };

            let guard = match self.claim(ctx, file).await? {
                Claimed::Settled(outcome) => {
                    finish_file(ctx, tally, file, Ok(outcome))?;
                    continue;
                }
                Claimed::Owner(guard) => guard,
            };

            let result = match FileTask::new(Arc::clone(ctx), file.clone()) {
                Ok(task) => task.run_single().await.map(FileOutcome::from),
                Err(e) => Err(e),
            };
            release(guard, &result);
            finish_file(ctx, tally, file, result)?;
        }
    }

    async fn run_multis(
        &self,
        ctx: &Arc<TaskContext>,
        tally: &Arc<Tally>,
        files: &[PlannedFile],
        merges: &mut Vec<JoinHandle<()>>,
    ) -> DownloadResult<()> {
        for file in files {
            ctx.wait_while_paused().await?;

            let guard = match self.claim(ctx, file).await? {
                Claimed::Settled(outcome) => {
                    finish_file(ctx, tally, file, Ok(outcome))?;
                    continue;
                }
                Claimed::Owner(guard) => guard,
            };

            let staged = match FileTask::new(Arc::clone(ctx), file.clone()) {
                Ok(task) => task.run_parts().await,
                Err(e) => Err(e),
            };

            match staged {
                Ok(PartsOutcome::Skipped { bytes }) => {
                    let result = Ok(FileOutcome::Skipped { bytes });
                    release(guard, &result);
                    finish_file(ctx, tally, file, result)?;
                }
                Ok(PartsOutcome::Merge(pending)) => {
                    debug!(path = %pending.path(), "Parts complete, merging in background");
                    let ctx = Arc::clone(ctx);
                    let tally = Arc::clone(tally);
                    let file = file.clone();
                    merges.push(tokio::spawn(async move {
                        let result = pending
                            .run()
                            .await
                            .map(|bytes| FileOutcome::Downloaded { bytes });
                        release(guard, &result);
                        // Cancellation is reported by the orchestrator itself.
                        let _ = finish_file(&ctx, &tally, &file, result);
                    }));
                }
                Err(e) => {
                    let result = Err(e);
                    release(guard, &result);
                    finish_file(ctx, tally, file, result)?;
                }
            }
        }
        Ok(())
    }

    /// Own a file's install target, or wait for the caller that owns it.
    async fn claim(&self, ctx: &TaskContext, file: &PlannedFile) -> DownloadResult<Claimed> {
        let key = target_key(&ctx.install_dir, &file.key);
        loop {
            match self.session.in_flight.claim(&key) {
                Claim::Owner(guard) => return Ok(Claimed::Owner(guard)),
                Claim::Joined(slot) => {
                    debug!(path = %file.path, "File in flight elsewhere, waiting");
                    let outcome = tokio::select! {
                        biased;
                        _ = ctx.token.cancelled() => return Err(DownloadError::Cancelled),
                        outcome = InFlightMap::wait(slot) => outcome,
                    };
                    if outcome == FileOutcome::Cancelled {
                        // The owner gave up; take over unless we are cancelled too.
                        ctx.token.check()?;
                        continue;
                    }
                    return Ok(Claimed::Settled(outcome));
                }
            }
        }
    }

    /// Check the install directory against the manifest without downloading.
    pub async fn verify_install(
        &self,
        request: &DownloadRequest,
        token: &CancelToken,
    ) -> DownloadResult<VerifyReport> {
        let manifest = self.fetch_manifest(request, token).await?;
        let plan = WorkPlan::build(&manifest, request.include_optional);
        info!(files = plan.total_files(), "Verifying install");

        let checks = plan.files().map(|file| {
            let install_dir = request.install_dir.clone();
            async move {
                token.check()?;
                let status = match install_path(&install_dir, &file.path) {
                    Ok(path) => {
                        inspect_file(&path, file.planned_size(), &file.entry.checksum).await
                    }
                    Err(e) => InstallStatus::Unreadable {
                        reason: e.to_string(),
                    },
                };
                Ok::<_, DownloadError>((file.path.clone(), status))
            }
        });

        let results: Vec<DownloadResult<(String, InstallStatus)>> = futures::stream::iter(checks)
            .buffered(request.concurrency.max(1))
            .collect()
            .await;
        let entries = results.into_iter().collect::<DownloadResult<Vec<_>>>()?;

        let report = VerifyReport {
            game_version: manifest.game_version,
            entries,
        };
        info!(
            valid = report.valid_count(),
            needs_repair = report.entries.len() - report.valid_count(),
            "Verify finished"
        );
        Ok(report)
    }
}

enum Claimed {
    Owner(InFlightGuard),
    Settled(FileOutcome),
}

impl From<TaskOutcome> for FileOutcome {
    fn from(outcome: TaskOutcome) -> Self {
        match outcome {
            TaskOutcome::Downloaded { bytes } => FileOutcome::Downloaded { bytes },
            TaskOutcome::Skipped { bytes } => FileOutcome::Skipped { bytes },
        }
    }
}

/// Publish an owner's result to waiting callers.
///
/// A cancelled owner drops its guard, which tells joiners to take over.
fn release(guard: InFlightGuard, result: &DownloadResult<FileOutcome>) {
    match result {
        Ok(outcome) => guard.complete(outcome.clone()),
        Err(e) if e.is_cancelled() => drop(guard),
        Err(e) => guard.complete(FileOutcome::Failed {
            reason: e.to_string(),
        }),
    }
}

/// Record a file's terminal result and emit its events.
fn finish_file(
    ctx: &TaskContext,
    tally: &Tally,
    file: &PlannedFile,
    result: DownloadResult<FileOutcome>,
) -> DownloadResult<()> {
    let reporter = &ctx.reporter;
    let completed = |state: FileState| {
        // Owners already moved the file to its terminal state.
        if ctx.states.get(&file.key) != Some(state) {
            ctx.states.advance(&file.key, state);
        }
        let completed = reporter.counters().file_completed();
        reporter.emit(ProgressEvent::FileDone {
            path: file.path.clone(),
            completed,
            total_files: reporter.counters().total_files(),
        });
    };

    match result {
        Ok(FileOutcome::Downloaded { bytes }) => {
            // Joined files arrive here still Pending; count their bytes once.
            if ctx.states.get(&file.key) == Some(FileState::Pending) {
                reporter.file_tracker(&file.path).settle(bytes);
            }
            tally.downloaded.fetch_add(1, Ordering::SeqCst);
            completed(FileState::Done);
            Ok(())
        }
        Ok(FileOutcome::Skipped { bytes }) => {
            if ctx.states.get(&file.key) == Some(FileState::Pending) {
                reporter.file_tracker(&file.path).settle(bytes);
            }
            tally.skipped.fetch_add(1, Ordering::SeqCst);
            completed(FileState::Skipped);
            Ok(())
        }
        Ok(FileOutcome::Failed { reason }) => {
            record_failure(ctx, tally, file, reason);
            Ok(())
        }
        Ok(FileOutcome::Cancelled) => Err(DownloadError::Cancelled),
        Err(e) if e.is_cancelled() => Err(e),
        Err(e) => {
            record_failure(ctx, tally, file, e.to_string());
            Ok(())
        }
    }
}

fn record_failure(ctx: &TaskContext, tally: &Tally, file: &PlannedFile, reason: String) {
    warn!(path = %file.path, error = %reason, "File failed");
    ctx.states.advance(&file.key, FileState::Failed);
    ctx.reporter.emit(ProgressEvent::FileError {
        path: file.path.clone(),
        message: reason.clone(),
    });
    tally.failed.lock().push(FailedFile {
        path: file.path.clone(),
        reason,
    });
}

/// Pause, resume and cancel for a running operation.
///
/// Every request is acknowledged with a `Paused`, `Resumed` or `Cancelled`
/// event on the sink.
#[derive(Clone)]
pub struct DownloadControl {
    token: CancelToken,
    paused: Arc<AtomicBool>,
    sink: Arc<dyn ProgressSink>,
}

impl std::fmt::Debug for DownloadControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadControl")
            .field("cancelled", &self.token.is_cancelled())
            .field("paused", &self.is_paused())
            .finish()
    }
}

impl DownloadControl {
    /// Create a control with a fresh token.
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            token: CancelToken::new(),
            paused: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// Token to pass to `download_all`.
    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Poller to pass to `download_all`.
    pub fn pause_poller(&self) -> PausePoller {
        let paused = Arc::clone(&self.paused);
        Arc::new(move || paused.load(Ordering::SeqCst))
    }

    /// Stop starting new work. Transfers already running continue.
    pub fn pause(&self) {
        if !self.paused.swap(true, Ordering::SeqCst) {
            info!("Download paused");
        }
        self.sink.emit(ProgressEvent::Paused);
    }

    /// Allow new work again.
    pub fn resume(&self) {
        if self.paused.swap(false, Ordering::SeqCst) {
            info!("Download resumed");
        }
        self.sink.emit(ProgressEvent::Resumed);
    }

    /// Cancel the operation and abort live requests.
    pub fn cancel(&self) {
        if !self.token.is_cancelled() {
            info!("Download cancelled");
        }
        self.token.cancel();
        self.sink.emit(ProgressEvent::Cancelled);
    }

    /// Whether new work is currently held back.
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }
}
