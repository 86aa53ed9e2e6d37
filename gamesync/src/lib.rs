//! gamesync - manifest-driven game file downloader
//!
//! This library fetches a versioned set of game files from an HTTP origin
//! into a local install directory, verifying every byte against the
//! manifest's SHA-256 checksums. Transfers resume after interruptions,
//! large files are fetched in parts, and an operation can be paused or
//! cancelled at any time.
//!
//! Start with [`download::Orchestrator`].

pub mod config;
pub mod download;
pub mod logging;
pub mod manifest;

pub use config::{ConfigError, ConfigFile, DownloadConfig, TransferConfig};
pub use download::{DownloadError, DownloadResult};
pub use manifest::{FileEntry, Manifest, ManifestClient, PartEntry};
