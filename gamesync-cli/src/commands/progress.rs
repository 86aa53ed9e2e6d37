//! Terminal progress bar fed by download events.

use std::time::Duration;

use gamesync::download::ProgressEvent;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}";

/// Handle to the renderer task.
pub struct ProgressDisplay {
    done: Option<oneshot::Sender<()>>,
    handle: JoinHandle<ProgressBar>,
}

impl ProgressDisplay {
    /// Spawn a renderer that consumes `events` until [`finish`](Self::finish).
    pub fn spawn(events: mpsc::UnboundedReceiver<ProgressEvent>) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(bar_style());
        bar.enable_steady_tick(Duration::from_millis(120));

        let (done_tx, done_rx) = oneshot::channel();
        let handle = tokio::spawn(render(bar, events, done_rx));
        Self {
            done: Some(done_tx),
            handle,
        }
    }

    /// Drain remaining events and close the bar.
    pub async fn finish(mut self, message: &str) {
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
        if let Ok(bar) = self.handle.await {
            bar.finish_with_message(message.to_string());
        }
    }
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::default_bar()
        .template(BAR_TEMPLATE)
        .map(|style| style.progress_chars("█▓░"))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

async fn render(
    bar: ProgressBar,
    mut events: mpsc::UnboundedReceiver<ProgressEvent>,
    mut done: oneshot::Receiver<()>,
) -> ProgressBar {
    loop {
        tokio::select! {
            biased;
            event = events.recv() => match event {
                Some(event) => apply_event(&bar, &event),
                None => return bar,
            },
            _ = &mut done => break,
        }
    }

    while let Ok(event) = events.try_recv() {
        apply_event(&bar, &event);
    }
    bar
}

/// Update the bar for one event.
pub fn apply_event(bar: &ProgressBar, event: &ProgressEvent) {
    match event {
        ProgressEvent::TotalBytes { total, files } => {
            bar.set_length(*total);
            bar.set_message(format!("0/{} files", files));
        }
        ProgressEvent::BytesDelta { bytes_done, .. } => bar.set_position(*bytes_done),
        ProgressEvent::FileDone {
            completed,
            total_files,
            ..
        } => bar.set_message(format!("{}/{} files", completed, total_files)),
        ProgressEvent::FileError { path, message } => {
            bar.println(format!("failed: {}: {}", path, message));
        }
        ProgressEvent::MergeStarted { path, parts } => {
            bar.set_message(format!("merging {} ({} parts)", path, parts));
        }
        ProgressEvent::VerifyStarted { path } => bar.set_message(format!("verifying {}", path)),
        ProgressEvent::Paused => bar.set_message("paused"),
        ProgressEvent::Resumed => bar.set_message("resumed"),
        ProgressEvent::Cancelled => bar.set_message("cancelling"),
        _ => {}
    }
}
