//! CLI command implementations.

pub mod download;
pub mod progress;
pub mod verify;
