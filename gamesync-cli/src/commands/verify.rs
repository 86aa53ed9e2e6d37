//! Verify command - check an install without downloading.

use std::path::PathBuf;

use clap::Args;
use gamesync::download::{CancelToken, DownloadRequest, InstallStatus, Orchestrator, VerifyReport};

use crate::error::CliError;
use crate::runner::{CliRunner, GlobalOptions};

/// Arguments for the verify command.
#[derive(Debug, Args)]
pub struct VerifyArgs {
    /// Base URL of the game version (overrides the config file)
    #[arg(long)]
    pub base_url: Option<String>,

    /// Install directory (overrides the config file)
    #[arg(long)]
    pub install_dir: Option<PathBuf>,

    /// Also check optional files
    #[arg(long)]
    pub include_optional: bool,
}

/// Run the verify command.
pub async fn run(options: GlobalOptions, args: VerifyArgs) -> Result<(), CliError> {
    let runner = CliRunner::new(&options)?;
    runner.log_startup("verify");

    let config = runner.download_config();
    let base_url = runner.base_url(args.base_url)?;
    let install_dir = runner.install_dir(args.install_dir);
    let mut request = DownloadRequest::from_config(base_url, install_dir, &config);
    if args.include_optional {
        request = request.with_include_optional(true);
    }

    let orchestrator = Orchestrator::new(config)?;
    let token = CancelToken::new();
    let ctrlc_token = token.clone();
    ctrlc::set_handler(move || ctrlc_token.cancel())
        .map_err(|e| CliError::Config(format!("Failed to set signal handler: {}", e)))?;

    let report = orchestrator.verify_install(&request, &token).await?;
    print_report(&report);

    let broken = report.entries.len() - report.valid_count();
    if broken > 0 {
        Err(CliError::NeedsRepair { count: broken })
    } else {
        Ok(())
    }
}

fn print_report(report: &VerifyReport) {
    for (path, status) in report.needs_repair() {
        println!("  ✗ {}: {}", path, describe(status));
    }
    println!(
        "{}/{} files valid",
        report.valid_count(),
        report.entries.len()
    );
}

fn describe(status: &InstallStatus) -> String {
    match status {
        InstallStatus::Valid => "valid".to_string(),
        InstallStatus::Missing => "missing".to_string(),
        InstallStatus::SizeMismatch { expected, actual } => {
            format!("size {} (expected {})", actual, expected)
        }
        InstallStatus::ChecksumMismatch => "checksum mismatch".to_string(),
        InstallStatus::Unreadable { reason } => format!("unreadable: {}", reason),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_describe() {
        assert_eq!(describe(&InstallStatus::Missing), "missing");
        assert_eq!(
            describe(&InstallStatus::SizeMismatch {
                expected: 10,
                actual: 4
            }),
            "size 4 (expected 10)"
        );
    }
}
