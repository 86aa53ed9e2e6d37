//! Manifest types and sources.
//!
//! The origin publishes `{base}/checksums.json`:
//!
//! ```json
//! {
//!   "game_version": "1.4.2",
//!   "files": [
//!     { "path": "bin/game.exe", "checksum": "9f86…", "size": 5 },
//!     { "path": "data/big.pak", "checksum": "…", "size": 1048576,
//!       "parts": [ { "path": "data/big.pak.000", "checksum": "…", "size": 524288 },
//!                  { "path": "data/big.pak.001", "checksum": "…", "size": 524288 } ] }
//!   ]
//! }
//! ```

use std::future::Future;
use std::pin::Pin;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::download::error::{DownloadError, DownloadResult};
use crate::download::http::join_url;

/// Manifest file name under the base URL.
pub const MANIFEST_FILE: &str = "checksums.json";

/// The list of files that make up one game version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default, alias = "gameVersion")]
    pub game_version: String,
    #[serde(default)]
    pub files: Vec<FileEntry>,
}

/// One installable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Relative path, forward or back slashes.
    pub path: String,
    /// SHA-256 of the complete file, hex.
    pub checksum: String,
    /// Size in bytes; 0 means unknown.
    #[serde(default)]
    pub size: u64,
    /// Only downloaded when optional content is requested.
    #[serde(default)]
    pub optional: bool,
    /// Remote parts that concatenate to this file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<PartEntry>>,
}

/// One remote piece of a multi-part file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartEntry {
    /// Remote path of the part.
    pub path: String,
    /// SHA-256 of the part, hex.
    pub checksum: String,
    #[serde(default)]
    pub size: u64,
}

impl FileEntry {
    /// Whether this file is assembled from parts.
    pub fn is_multi_part(&self) -> bool {
        self.parts.as_ref().is_some_and(|parts| !parts.is_empty())
    }

    /// Parts of the file, empty for a single file.
    pub fn parts(&self) -> &[PartEntry] {
        self.parts.as_deref().unwrap_or(&[])
    }

    /// Bytes this file contributes to the plan total.
    ///
    /// The declared size, or the sum of part sizes when it is unknown.
    pub fn planned_size(&self) -> u64 {
        if self.size > 0 {
            self.size
        } else {
            self.parts().iter().map(|p| p.size).sum()
        }
    }
}

impl Manifest {
    /// Parse a manifest body. `url` is used for error context.
    pub fn from_json(body: &[u8], url: &str) -> DownloadResult<Self> {
        serde_json::from_slice(body).map_err(|e| DownloadError::ManifestParse {
            url: url.to_string(),
            reason: e.to_string(),
        })
    }
}

/// URL of the manifest under a base URL.
pub fn manifest_url(base_url: &str) -> String {
    join_url(base_url, MANIFEST_FILE)
}

/// Boxed future returned by [`ManifestClient::fetch`].
pub type ManifestFuture<'a> = Pin<Box<dyn Future<Output = DownloadResult<Manifest>> + Send + 'a>>;

/// Source of manifests.
pub trait ManifestClient: Send + Sync {
    /// Fetch the manifest published under `base_url`.
    fn fetch<'a>(&'a self, base_url: &'a str) -> ManifestFuture<'a>;
}

/// Fetches `{base}/checksums.json` over HTTP. No retry.
#[derive(Debug, Clone)]
pub struct HttpManifestClient {
    client: Client,
}

impl HttpManifestClient {
    /// Use an existing client (normally the transfer's shared one).
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl ManifestClient for HttpManifestClient {
    fn fetch<'a>(&'a self, base_url: &'a str) -> ManifestFuture<'a> {
        Box::pin(async move {
            let url = manifest_url(base_url);
            debug!(url = %url, "Fetching manifest");

            let fetch_error = |reason: String| DownloadError::ManifestFetch {
                url: url.clone(),
                reason,
            };

            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| fetch_error(e.to_string()))?;

            if response.status() != StatusCode::OK {
                return Err(fetch_error(format!("HTTP {}", response.status().as_u16())));
            }

            let body = response
                .bytes()
                .await
                .map_err(|e| fetch_error(e.to_string()))?;
            let manifest = Manifest::from_json(&body, &url)?;

            info!(
                url = %url,
                version = %manifest.game_version,
                files = manifest.files.len(),
                "Manifest fetched"
            );
            Ok(manifest)
        })
    }
}

/// Serves a fixed manifest, for embedders that already hold one.
#[derive(Debug, Clone)]
pub struct StaticManifestClient {
    manifest: Manifest,
}

impl StaticManifestClient {
    pub fn new(manifest: Manifest) -> Self {
        Self { manifest }
    }
}

impl ManifestClient for StaticManifestClient {
    fn fetch<'a>(&'a self, _base_url: &'a str) -> ManifestFuture<'a> {
        let manifest = self.manifest.clone();
        Box::pin(async move { Ok(manifest) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let json = br#"{
            "game_version": "1.4.2",
            "files": [
                { "path": "a.bin", "checksum": "abc", "size": 5 },
                { "path": "opt\\extra.pak", "checksum": "def", "optional": true },
                { "path": "big.pak", "checksum": "123", "size": 10,
                  "parts": [ { "path": "big.pak.0", "checksum": "p0", "size": 4 },
                             { "path": "big.pak.1", "checksum": "p1", "size": 6 } ] }
            ]
        }"#;

        let manifest = Manifest::from_json(json, "http://origin/checksums.json").unwrap();
        assert_eq!(manifest.game_version, "1.4.2");
        assert_eq!(manifest.files.len(), 3);

        let optional = &manifest.files[1];
        assert!(optional.optional);
        assert_eq!(optional.size, 0);
        assert!(!optional.is_multi_part());

        let big = &manifest.files[2];
        assert!(big.is_multi_part());
        assert_eq!(big.parts().len(), 2);
        assert_eq!(big.planned_size(), 10);
    }

    #[test]
    fn test_camel_case_version_alias() {
        let manifest =
            Manifest::from_json(br#"{"gameVersion":"2.0","files":[]}"#, "u").unwrap();
        assert_eq!(manifest.game_version, "2.0");
    }

    #[test]
    fn test_planned_size_falls_back_to_parts() {
        let entry = FileEntry {
            path: "big.pak".to_string(),
            checksum: "x".to_string(),
            size: 0,
            optional: false,
            parts: Some(vec![
                PartEntry {
                    path: "big.pak.0".to_string(),
                    checksum: "a".to_string(),
                    size: 3,
                },
                PartEntry {
                    path: "big.pak.1".to_string(),
                    checksum: "b".to_string(),
                    size: 4,
                },
            ]),
        };
        assert_eq!(entry.planned_size(), 7);
    }

    #[test]
    fn test_empty_parts_is_single_file() {
        let entry = FileEntry {
            path: "a.bin".to_string(),
            checksum: "x".to_string(),
            size: 1,
            optional: false,
            parts: Some(Vec::new()),
        };
        assert!(!entry.is_multi_part());
    }

    #[test]
    fn test_malformed_manifest() {
        let result = Manifest::from_json(b"{not json", "http://origin/checksums.json");
        match result {
            Err(DownloadError::ManifestParse { url, .. }) => {
                assert_eq!(url, "http://origin/checksums.json")
            }
            other => panic!("Expected ManifestParse, got {:?}", other),
        }
    }

    #[test]
    fn test_manifest_url() {
        assert_eq!(
            manifest_url("http://origin/game/"),
            "http://origin/game/checksums.json"
        );
    }

    #[tokio::test]
    async fn test_static_client() {
        let manifest = Manifest {
            game_version: "1".to_string(),
            files: Vec::new(),
        };
        let client = StaticManifestClient::new(manifest.clone());
        assert_eq!(client.fetch("ignored").await.unwrap(), manifest);
    }
}
