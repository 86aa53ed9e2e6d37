//! gamesync CLI - download and verify game installs
//!
//! This binary drives the gamesync library from the command line.

mod commands;
mod error;
mod runner;

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};

use commands::download::DownloadArgs;
use commands::verify::VerifyArgs;
use runner::GlobalOptions;

#[derive(Debug, Parser)]
#[command(name = "gamesync")]
#[command(version, about = "Manifest-driven game file downloader", long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Config file (defaults to <config dir>/gamesync/config.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Write rolling log files to this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download or repair a game install
    Download(DownloadArgs),
    /// Check an install against its manifest without downloading
    Verify(VerifyArgs),
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let options = GlobalOptions {
        verbose: cli.verbose,
        config: cli.config,
        log_dir: cli.log_dir,
    };

    let result = match cli.command {
        Commands::Download(args) => commands::download::run(options, args).await,
        Commands::Verify(args) => commands::verify::run(options, args).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::from(e.exit_code())
        }
    }
}
