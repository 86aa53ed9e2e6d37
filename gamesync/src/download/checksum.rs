//! SHA-256 checksum calculation for file verification.
//!
//! Hashing is blocking work; async callers go through [`file_checksum`],
//! which moves it onto the blocking thread pool.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use super::error::{DownloadError, DownloadResult};

/// Buffer size for reading files during checksum calculation (64KB).
pub(crate) const BUFFER_SIZE: usize = 64 * 1024;

/// Calculate SHA-256 checksum of a file.
///
/// # Returns
///
/// The lowercase hexadecimal SHA-256 hash of the file contents.
pub fn calculate_file_checksum(path: &Path) -> DownloadResult<String> {
    let mut file = File::open(path).map_err(|e| DownloadError::ReadFailed {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; BUFFER_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| DownloadError::ReadFailed {
                path: path.to_path_buf(),
                source: e,
            })?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Hash a file on the blocking pool.
pub async fn file_checksum(path: PathBuf) -> DownloadResult<String> {
    tokio::task::spawn_blocking(move || calculate_file_checksum(&path))
        .await
        .map_err(|e| DownloadError::TaskFailed(e.to_string()))?
}

/// Compare a manifest checksum with a computed one.
///
/// Manifests are not consistent about hex case, so the comparison is
/// case-insensitive and ignores surrounding whitespace.
pub fn checksums_match(expected: &str, actual: &str) -> bool {
    expected.trim().eq_ignore_ascii_case(actual.trim())
}

/// Verify that a file matches an expected checksum.
///
/// `label` names the file in the error (usually its manifest path).
pub async fn verify_file(path: PathBuf, expected: &str, label: &str) -> DownloadResult<()> {
    let actual = file_checksum(path).await?;
    if !checksums_match(expected, &actual) {
        return Err(DownloadError::ChecksumMismatch {
            path: label.to_string(),
            expected: expected.to_lowercase(),
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const HELLO_WORLD_SHA256: &str =
        "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    #[test]
    fn test_calculate_file_checksum() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");

        let mut file = File::create(&file_path).unwrap();
        file.write_all(b"hello world").unwrap();

        let checksum = calculate_file_checksum(&file_path).unwrap();
        assert_eq!(checksum, HELLO_WORLD_SHA256);
    }

    #[test]
    fn test_calculate_empty_file() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("empty.txt");

        File::create(&file_path).unwrap();

        let checksum = calculate_file_checksum(&file_path).unwrap();

        // SHA-256 of empty string
        assert_eq!(
            checksum,
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_calculate_nonexistent_file() {
        let result = calculate_file_checksum(Path::new("/nonexistent/file.txt"));
        assert!(matches!(result, Err(DownloadError::ReadFailed { .. })));
    }

    #[test]
    fn test_checksums_match_ignores_case() {
        assert!(checksums_match(
            &HELLO_WORLD_SHA256.to_uppercase(),
            HELLO_WORLD_SHA256
        ));
        assert!(checksums_match(" abc ", "ABC"));
        assert!(!checksums_match("abc", "abd"));
    }

    #[tokio::test]
    async fn test_verify_file_mismatch_names_label() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("test.txt");
        std::fs::write(&file_path, b"hello world").unwrap();

        let result = verify_file(file_path, "wrong_checksum", "pak/test.txt").await;

        match result {
            Err(DownloadError::ChecksumMismatch { path, actual, .. }) => {
                assert_eq!(path, "pak/test.txt");
                assert_eq!(actual, HELLO_WORLD_SHA256);
            }
            other => panic!("Expected ChecksumMismatch error, got {:?}", other),
        }
    }

    #[test]
    fn test_large_file_checksum() {
        let temp = TempDir::new().unwrap();
        let file_path = temp.path().join("large.bin");

        // Larger than the read buffer
        let data = vec![0xABu8; 100_000];
        std::fs::write(&file_path, &data).unwrap();

        let checksum = calculate_file_checksum(&file_path).unwrap();
        let expected = format!("{:x}", Sha256::digest(&data));
        assert_eq!(checksum, expected);
    }
}
