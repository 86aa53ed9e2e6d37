//! Progress reporting for manifest downloads.
//!
//! Every observable step of a download is a [`ProgressEvent`] pushed into a
//! [`ProgressSink`]. Byte totals are kept in atomic [`ProgressCounters`]
//! shared by all workers; a [`ByteTracker`] per artifact (file or part)
//! turns "received so far" reports from a transfer into signed deltas and
//! can roll its contribution back when an attempt is thrown away.
//!
//! ```text
//! HttpTransfer ──on_progress──► ByteTracker ──add_bytes──► ProgressCounters
//!                                    │
//!                                    └──(throttled)──► ProgressSink ──► UI
//! ```

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Default minimum interval between per-chunk progress events (100ms).
pub const DEFAULT_PROGRESS_INTERVAL_MS: u64 = 100;

/// One observable step of a download operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// Total bytes the plan will verify; emitted once per operation.
    TotalBytes { total: u64, files: usize },
    /// A file started downloading.
    FileStarted { path: String, size: u64 },
    /// A file was already valid on disk.
    FileSkipped { path: String, size: u64 },
    /// Bytes received for a single file.
    FileProgress { path: String, received: u64, total: u64 },
    /// A file was verified and published.
    FileDone {
        path: String,
        completed: usize,
        total_files: usize,
    },
    /// A file failed permanently.
    FileError { path: String, message: String },
    /// Bytes received for one part of a multi-part file.
    PartProgress {
        path: String,
        part: usize,
        received: u64,
        total: u64,
    },
    /// A part attempt failed and its bytes were discarded.
    PartReset {
        path: String,
        part: usize,
        attempt: u32,
        reason: String,
    },
    /// A part already on disk matched its checksum.
    PartSkipped { path: String, part: usize, size: u64 },
    /// Parts of a file started merging.
    MergeStarted { path: String, parts: usize },
    /// One part was appended to the merged output.
    MergePart {
        path: String,
        part: usize,
        parts: usize,
    },
    /// All parts were appended.
    MergeDone { path: String },
    /// A file's content is being hashed.
    VerifyStarted { path: String },
    /// The byte counter moved; `delta` is negative on rollback.
    BytesDelta { delta: i64, bytes_done: u64 },
    /// Acknowledges a pause request.
    Paused,
    /// Acknowledges a resume request.
    Resumed,
    /// Acknowledges a cancel request.
    Cancelled,
}

/// Receiver of progress events.
///
/// Called from worker tasks; implementations must not block.
pub trait ProgressSink: Send + Sync {
    /// Deliver one event.
    fn emit(&self, event: ProgressEvent);
}

/// Sink that drops every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Sink that writes events to the tracing subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::FileDone { path, .. } => info!(path = %path, "File verified"),
            ProgressEvent::FileSkipped { path, .. } => debug!(path = %path, "File already valid"),
            ProgressEvent::FileError { path, message } => {
                warn!(path = %path, error = %message, "File failed")
            }
            ProgressEvent::PartReset {
                path,
                part,
                reason,
                ..
            } => warn!(path = %path, part, reason = %reason, "Part reset"),
            ProgressEvent::FileProgress { .. }
            | ProgressEvent::PartProgress { .. }
            | ProgressEvent::BytesDelta { .. } => trace!(?event, "Progress"),
            _ => debug!(?event, "Progress"),
        }
    }
}

/// Sink that forwards events, in order, to a single channel subscriber.
///
/// The channel is unbounded so a slow subscriber never stalls a transfer;
/// per-chunk events are throttled upstream by [`ByteTracker`].
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    /// Create a sink and the receiver that observes it.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        // A dropped receiver only means nobody is watching.
        let _ = self.tx.send(event);
    }
}

/// Shared progress counters for one download operation.
///
/// Safe to share across workers; all updates are atomic.
#[derive(Debug, Default)]
pub struct ProgressCounters {
    bytes_done: AtomicU64,
    total_bytes: AtomicU64,
    files_completed: AtomicUsize,
    total_files: AtomicUsize,
}

impl ProgressCounters {
    /// Create zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the planned totals.
    pub fn set_totals(&self, total_bytes: u64, total_files: usize) {
        self.total_bytes.store(total_bytes, Ordering::SeqCst);
        self.total_files.store(total_files, Ordering::SeqCst);
    }

    /// Apply a signed delta to the byte counter, saturating at zero.
    ///
    /// Returns the new value.
    pub fn add_bytes(&self, delta: i64) -> u64 {
        let previous = self
            .bytes_done
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                Some(apply_delta(current, delta))
            })
            .unwrap_or_else(|current| current);
        apply_delta(previous, delta)
    }

    /// Mark one more file as finished and return the new count.
    pub fn file_completed(&self) -> usize {
        self.files_completed.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Bytes counted so far.
    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::SeqCst)
    }

    /// Total bytes planned.
    pub fn total_bytes(&self) -> u64 {
        self.total_bytes.load(Ordering::SeqCst)
    }

    /// Files finished (downloaded or skipped).
    pub fn files_completed(&self) -> usize {
        self.files_completed.load(Ordering::SeqCst)
    }

    /// Files planned.
    pub fn total_files(&self) -> usize {
        self.total_files.load(Ordering::SeqCst)
    }
}

fn apply_delta(current: u64, delta: i64) -> u64 {
    if delta >= 0 {
        current.saturating_add(delta as u64)
    } else {
        current.saturating_sub(delta.unsigned_abs())
    }
}

/// Event sink and counters for one operation, cloned into every worker.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    counters: Arc<ProgressCounters>,
    interval: Duration,
}

impl std::fmt::Debug for ProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressReporter")
            .field("counters", &self.counters)
            .field("interval", &self.interval)
            .finish()
    }
}

impl ProgressReporter {
    /// Create a reporter.
    ///
    /// # Arguments
    ///
    /// * `sink` - Where events go
    /// * `interval` - Minimum spacing of per-chunk events for one artifact
    pub fn new(sink: Arc<dyn ProgressSink>, interval: Duration) -> Self {
        Self {
            sink,
            counters: Arc::new(ProgressCounters::new()),
            interval,
        }
    }

    /// Reporter that discards events.
    pub fn silent() -> Self {
        Self::new(Arc::new(NullSink), Duration::ZERO)
    }

    /// Send an event to the sink.
    pub fn emit(&self, event: ProgressEvent) {
        self.sink.emit(event);
    }

    /// Shared counters.
    pub fn counters(&self) -> &Arc<ProgressCounters> {
        &self.counters
    }

    /// Tracker for a single file.
    pub fn file_tracker(&self, path: &str) -> ByteTracker {
        ByteTracker::new(self.clone(), path.to_string(), None)
    }

    /// Tracker for one part of a multi-part file.
    pub fn part_tracker(&self, path: &str, part: usize) -> ByteTracker {
        ByteTracker::new(self.clone(), path.to_string(), Some(part))
    }
}

#[derive(Debug, Default)]
struct TrackerState {
    counted: u64,
    pending: i64,
    last_emit: Option<Instant>,
}

/// Byte accounting for one artifact.
///
/// `counted` is what this artifact currently contributes to
/// [`ProgressCounters::bytes_done`]. It only grows while data arrives and
/// returns to zero on [`rollback`](Self::rollback). Deltas are batched and
/// flushed as `BytesDelta` events at most once per reporter interval, so the
/// sum of emitted deltas always equals the counter movement.
#[derive(Debug)]
pub struct ByteTracker {
    reporter: ProgressReporter,
    path: String,
    part: Option<usize>,
    state: Mutex<TrackerState>,
}

impl ByteTracker {
    fn new(reporter: ProgressReporter, path: String, part: Option<usize>) -> Self {
        Self {
            reporter,
            path,
            part,
            state: Mutex::new(TrackerState::default()),
        }
    }

    /// Bytes this artifact currently contributes.
    pub fn counted(&self) -> u64 {
        self.state.lock().counted
    }

    /// Count bytes that were already on disk (resume prefix or reused data).
    pub fn count_existing(&self, bytes: u64) {
        let mut state = self.state.lock();
        if bytes > state.counted {
            let delta = (bytes - state.counted) as i64;
            self.apply(&mut state, delta);
        }
        self.flush(&mut state);
    }

    /// Observe a "received so far" report from a transfer.
    ///
    /// Only growth beyond what was already counted moves the counter, so a
    /// transfer that restarts at zero never counts its bytes twice.
    pub fn observe(&self, received: u64, total: u64) {
        let mut state = self.state.lock();
        if received > state.counted {
            let delta = (received - state.counted) as i64;
            self.apply(&mut state, delta);
        }

        let due = match state.last_emit {
            Some(at) => at.elapsed() >= self.reporter.interval,
            None => true,
        };
        if due {
            let event = match self.part {
                Some(part) => ProgressEvent::PartProgress {
                    path: self.path.clone(),
                    part,
                    received,
                    total,
                },
                None => ProgressEvent::FileProgress {
                    path: self.path.clone(),
                    received,
                    total,
                },
            };
            self.reporter.emit(event);
            self.flush(&mut state);
            state.last_emit = Some(Instant::now());
        }
    }

    /// Discard everything this artifact counted.
    ///
    /// Returns the number of bytes removed from the counter.
    pub fn rollback(&self) -> u64 {
        let mut state = self.state.lock();
        let removed = state.counted;
        if removed > 0 {
            self.apply(&mut state, -(removed as i64));
        }
        self.flush(&mut state);
        removed
    }

    /// Pin the contribution to the verified size of the artifact.
    pub fn settle(&self, size: u64) {
        let mut state = self.state.lock();
        let delta = size as i64 - state.counted as i64;
        if delta != 0 {
            self.apply(&mut state, delta);
        }
        self.flush(&mut state);
    }

    fn apply(&self, state: &mut TrackerState, delta: i64) {
        self.reporter.counters.add_bytes(delta);
        state.counted = apply_delta(state.counted, delta);
        state.pending += delta;
    }

    fn flush(&self, state: &mut TrackerState) {
        if state.pending != 0 {
            self.reporter.emit(ProgressEvent::BytesDelta {
                delta: state.pending,
                bytes_done: self.reporter.counters.bytes_done(),
            });
            state.pending = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel_reporter(
        interval: Duration,
    ) -> (ProgressReporter, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (sink, rx) = ChannelSink::new();
        (ProgressReporter::new(Arc::new(sink), interval), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ProgressEvent>) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn delta_sum(events: &[ProgressEvent]) -> i64 {
        events
            .iter()
            .filter_map(|e| match e {
                ProgressEvent::BytesDelta { delta, .. } => Some(*delta),
                _ => None,
            })
            .sum()
    }

    #[test]
    fn test_counters_saturate_at_zero() {
        let counters = ProgressCounters::new();
        assert_eq!(counters.add_bytes(10), 10);
        assert_eq!(counters.add_bytes(-25), 0);
        assert_eq!(counters.bytes_done(), 0);
    }

    #[test]
    fn test_file_completed_counts_up() {
        let counters = ProgressCounters::new();
        counters.set_totals(100, 2);
        assert_eq!(counters.file_completed(), 1);
        assert_eq!(counters.file_completed(), 2);
        assert_eq!(counters.total_files(), 2);
        assert_eq!(counters.total_bytes(), 100);
    }

    #[test]
    fn test_tracker_counts_growth_once() {
        let (reporter, mut rx) = channel_reporter(Duration::ZERO);
        let tracker = reporter.file_tracker("a.bin");

        tracker.count_existing(40);
        tracker.observe(60, 100);
        tracker.observe(60, 100);
        // transfer restarted from zero
        tracker.observe(10, 100);
        tracker.observe(100, 100);

        assert_eq!(tracker.counted(), 100);
        assert_eq!(reporter.counters().bytes_done(), 100);
        assert_eq!(delta_sum(&drain(&mut rx)), 100);
    }

    #[test]
    fn test_tracker_rollback_emits_negative_delta() {
        let (reporter, mut rx) = channel_reporter(Duration::ZERO);
        let tracker = reporter.part_tracker("big.pak", 1);

        tracker.observe(70, 100);
        assert_eq!(tracker.rollback(), 70);
        assert_eq!(reporter.counters().bytes_done(), 0);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ProgressEvent::BytesDelta { delta: -70, bytes_done: 0 }
        )));
        assert_eq!(delta_sum(&events), 0);
    }

    #[test]
    fn test_tracker_settle_pins_size() {
        let (reporter, mut rx) = channel_reporter(Duration::ZERO);
        let tracker = reporter.file_tracker("a.bin");

        tracker.observe(90, 0);
        tracker.settle(120);
        assert_eq!(reporter.counters().bytes_done(), 120);
        assert_eq!(delta_sum(&drain(&mut rx)), 120);
    }

    #[test]
    fn test_throttled_tracker_keeps_deltas_exact() {
        let (reporter, mut rx) = channel_reporter(Duration::from_secs(3600));
        let tracker = reporter.file_tracker("a.bin");

        for received in (1..=50).map(|i| i * 10) {
            tracker.observe(received, 500);
        }
        tracker.settle(500);

        let events = drain(&mut rx);
        let progress = events
            .iter()
            .filter(|e| matches!(e, ProgressEvent::FileProgress { .. }))
            .count();
        assert_eq!(progress, 1);
        assert_eq!(delta_sum(&events), 500);
    }

    #[test]
    fn test_event_serializes_with_tag() {
        let event = ProgressEvent::FileDone {
            path: "a.bin".to_string(),
            completed: 1,
            total_files: 3,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "file_done");
        assert_eq!(json["path"], "a.bin");

        let json = serde_json::to_value(ProgressEvent::Paused).unwrap();
        assert_eq!(json["event"], "paused");
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(ProgressEvent::Cancelled);
    }
}
