//! Download engine.
//!
//! This module fetches a manifest's files from an HTTP origin into an
//! install directory, including:
//! - Resumable single-request transfers with a stall watchdog (`http`)
//! - SHA-256 checksum verification (`checksum`)
//! - Cooperative cancellation of live requests (`cancel`)
//! - Backoff between attempts (`retry`)
//! - Progress events and byte accounting (`progress`)
//! - Per-path dedupe between concurrent callers (`inflight`)
//! - Planning, per-file state and reports (`plan`, `state`)
//! - Single-file and multi-part file work (`task`)
//! - The two-stage orchestrator and its controls (`orchestrator`)
//!
//! # Architecture
//!
//! ```text
//! Orchestrator::download_all
//!         │
//!         ├── ManifestClient (checksums.json)
//!         ├── WorkPlan (normalize, filter, dedupe, partition)
//!         ├── InFlightMap (inside DownloadSession)
//!         │
//!         └── FileTask
//!                 ├── HttpTransfer (resume, stall, retry)
//!                 ├── ByteTracker ──► ProgressSink
//!                 └── PendingMerge (multi-part files)
//! ```
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use gamesync::download::{ChannelSink, DownloadControl, DownloadRequest, Orchestrator};
//! use gamesync::config::DownloadConfig;
//!
//! let orchestrator = Orchestrator::new(DownloadConfig::default())?;
//! let (sink, mut events) = ChannelSink::new();
//! let sink = Arc::new(sink);
//! let control = DownloadControl::new(sink.clone());
//!
//! let request = DownloadRequest::new("https://cdn.example.com/game/1.4.2", "/games/example");
//! let report = orchestrator
//!     .download_all(&request, control.token(), control.pause_poller(), sink)
//!     .await?;
//! println!("{} files downloaded", report.downloaded);
//! ```

pub mod cancel;
pub mod checksum;
pub mod error;
pub mod http;
pub mod inflight;
pub mod orchestrator;
pub mod plan;
pub mod progress;
pub mod retry;
pub mod state;
pub mod task;

pub use cancel::{CancelToken, LiveRequest};
pub use error::{DownloadError, DownloadResult};
pub use http::{HttpTransfer, TransferRequest};
pub use inflight::{FileOutcome, InFlightMap};
pub use orchestrator::{DownloadControl, DownloadRequest, DownloadSession, Orchestrator};
pub use plan::{normalize_key, WorkPlan};
pub use progress::{
    ByteTracker, ChannelSink, NullSink, ProgressCounters, ProgressEvent, ProgressReporter,
    ProgressSink, TracingSink,
};
pub use retry::RetryPolicy;
pub use state::{DownloadReport, FailedFile, FileState, InstallStatus, VerifyReport};
pub use task::{never_paused, PausePoller, PendingMerge};
