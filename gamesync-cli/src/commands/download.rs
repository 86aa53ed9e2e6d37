//! Download command - fetch or repair an install.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Args;
use gamesync::download::{
    ChannelSink, DownloadControl, DownloadReport, DownloadRequest, Orchestrator,
};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::progress::ProgressDisplay;
use crate::error::CliError;
use crate::runner::{CliRunner, GlobalOptions};

/// How often the pause file is checked.
const PAUSE_FILE_POLL: Duration = Duration::from_millis(250);

/// Arguments for the download command.
#[derive(Debug, Args)]
pub struct DownloadArgs {
    /// Base URL of the game version (overrides the config file)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Install directory (overrides the config file)
    #[arg(long)]
    pub install_dir: Option<PathBuf>,

    /// Also download optional files
    #[arg(long)]
    pub include_optional: bool,

    /// Concurrent file downloads
    #[arg(long)]
    pub concurrency: Option<usize>,

    /// Concurrent part downloads per multi-part file
    #[arg(long)]
    pub part_concurrency: Option<usize>,

    /// Pause while this file exists
    #[arg(long)]
    pub pause_file: Option<PathBuf>,
}

/// Run the download command.
pub async fn run(options: GlobalOptions, args: DownloadArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(&options)?;
    runner.log_startup("download");

    let config = runner.download_config();
    let base_url = runner.base_url(args.base_url.clone())?;
    let install_dir = runner.install_dir(args.install_dir.clone());
    let request = build_request(&base_url, install_dir, &config, &args);

    println!("gamesync v{}", env!("CARGO_PKG_VERSION"));
    println!("Source:  {}", request.base_url);
    println!("Install: {}", request.install_dir.display());
    println!();

    let orchestrator = Orchestrator::new(config)?;
    let (sink, events) = ChannelSink::new();
    let sink = Arc::new(sink);
    let control = DownloadControl::new(sink.clone());

    let ctrlc_control = control.clone();
    ctrlc::set_handler(move || ctrlc_control.cancel())
        .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let watcher = args
        .pause_file
        .clone()
        .map(|path| spawn_pause_watcher(path, control.clone()));

    let display = ProgressDisplay::spawn(events);
    let result = orchestrator
        .download_all(&request, control.token(), control.pause_poller(), sink)
        .await;

    if let Some(watcher) = watcher {
        watcher.abort();
    }

    match result {
        Ok(report) => {
            display.finish("done").await;
            print_summary(&report);
            if report.has_failures() {
                Err(CliError::Incomplete {
                    count: report.failed.len(),
                })
            } else {
                Ok(())
            }
        }
        Err(e) => {
            display.finish("stopped").await;
            Err(e.into())
        }
    }
}

fn build_request(
    base_url: &str,
    install_dir: PathBuf,
    config: &gamesync::DownloadConfig,
    args: &DownloadArgs,
) -> DownloadRequest {
    let mut request = DownloadRequest::from_config(base_url, install_dir, config);
    if args.include_optional {
        request = request.with_include_optional(true);
    }
    if let Some(workers) = args.concurrency {
        request = request.with_concurrency(workers);
    }
    if let Some(workers) = args.part_concurrency {
        request = request.with_part_concurrency(workers);
    }
    request
}

/// Pause while `path` exists, resume when it is removed.
fn spawn_pause_watcher(path: PathBuf, control: DownloadControl) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(PAUSE_FILE_POLL);
        loop {
            ticker.tick().await;
            let present = tokio::fs::try_exists(&path).await.unwrap_or(false);
            if present && !control.is_paused() {
                info!(path = %path.display(), "Pause file present");
                control.pause();
            } else if !present && control.is_paused() {
                control.resume();
            }
        }
    })
}

fn print_summary(report: &DownloadReport) {
    println!();
    println!("Download Summary");
    println!("────────────────");
    if !report.game_version.is_empty() {
        println!("  Version:    {}", report.game_version);
    }
    println!("  Files:      {}", report.total_files);
    println!("  Downloaded: {}", report.downloaded);
    println!("  Skipped:    {}", report.skipped);
    println!("  Failed:     {}", report.failed.len());
    println!(
        "  Bytes:      {}/{} ({:.1}%)",
        report.bytes_done,
        report.total_bytes,
        report.progress_percent()
    );

    for failure in &report.failed {
        warn!(path = %failure.path, reason = %failure.reason, "File failed");
        println!("  ✗ {}: {}", failure.path, failure.reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamesync::DownloadConfig;

    fn args() -> DownloadArgs {
        DownloadArgs {
            base_url: None,
            install_dir: None,
            include_optional: false,
            concurrency: None,
            part_concurrency: None,
            pause_file: None,
        }
    }

    #[test]
    fn test_request_uses_config_defaults() {
        let config = DownloadConfig::default()
            .with_concurrency(6)
            .with_include_optional(true);
        let request = build_request("https://cdn.example/1", "/g".into(), &config, &args());

        assert_eq!(request.concurrency, 6);
        assert!(request.include_optional);
    }

    #[test]
    fn test_cli_overrides_config() {
        let config = DownloadConfig::default().with_concurrency(6);
        let mut cli = args();
        cli.concurrency = Some(2);
        cli.part_concurrency = Some(8);
        cli.include_optional = true;

        let request = build_request("https://cdn.example/1", "/g".into(), &config, &cli);
        assert_eq!(request.concurrency, 2);
        assert_eq!(request.part_concurrency, 8);
        assert!(request.include_optional);
    }

    #[tokio::test]
    async fn test_pause_watcher_follows_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let pause = temp.path().join("pause");
        let control = DownloadControl::new(Arc::new(gamesync::download::NullSink));

        let watcher = spawn_pause_watcher(pause.clone(), control.clone());
        std::fs::write(&pause, b"").unwrap();
        for _ in 0..40 {
            if control.is_paused() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(control.is_paused());

        std::fs::remove_file(&pause).unwrap();
        for _ in 0..40 {
            if !control.is_paused() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(!control.is_paused());
        watcher.abort();
    }
}
