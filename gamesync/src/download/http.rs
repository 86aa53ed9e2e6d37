//! Resumable single-request transfer to a file.
//!
//! [`HttpTransfer::download`] fetches one URL into one file:
//! - Resumes with `Range: bytes=N-` from the bytes already on disk
//! - Restarts from zero when the server ignores or rejects the range
//! - Drops requests that stop delivering data (stall watchdog)
//! - Retries transient failures with backoff, up to `max_attempts`
//!
//! It never hashes; checksum verification belongs to the caller.

use std::error::Error as StdError;
use std::io;
use std::path::Path;
use std::time::Instant;

use futures::StreamExt;
use reqwest::header::RANGE;
use reqwest::{Client, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::time::MissedTickBehavior;
use tracing::{debug, trace, warn};

use super::cancel::{CancelToken, LiveRequest};
use super::checksum::BUFFER_SIZE;
use super::error::{DownloadError, DownloadResult};
use crate::config::TransferConfig;

/// Callback receiving `(received_total, total)` after each chunk.
///
/// `received_total` includes the resume offset; `total` is 0 when unknown.
pub type TransferProgress<'a> = dyn Fn(u64, u64) + Send + Sync + 'a;

/// One transfer call.
#[derive(Debug, Clone, Copy)]
pub struct TransferRequest<'a> {
    /// Absolute URL to fetch.
    pub url: &'a str,
    /// File to write.
    pub dest: &'a Path,
    /// Bytes already in `dest` that the caller wants to keep.
    pub resume_from: u64,
    /// Expected final size, 0 if unknown.
    pub expected_total: u64,
}

/// Resumable HTTP transfer primitive.
///
/// Cheap to clone; clones share the connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransfer {
    client: Client,
    config: TransferConfig,
}

impl HttpTransfer {
    /// Build the shared client.
    pub fn new(config: TransferConfig) -> DownloadResult<Self> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(DownloadError::Client)?;

        Ok(Self { client, config })
    }

    /// The shared client (used for the manifest request too).
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Transfer settings.
    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Fetch `request.url` into `request.dest`.
    ///
    /// Returns the number of bytes in `dest` afterwards.
    ///
    /// # Errors
    ///
    /// `Cancelled` as soon as the token fires, the last retryable error once
    /// attempts run out, or the first fatal error.
    pub async fn download(
        &self,
        request: &TransferRequest<'_>,
        on_progress: &TransferProgress<'_>,
        token: &CancelToken,
    ) -> DownloadResult<u64> {
        let max_attempts = self.config.max_attempts.max(1);
        let on_disk = file_len(request.dest).await;
        let mut resume_from = request.resume_from.min(on_disk);
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            token.check()?;

            if attempt > 1 {
                resume_from = file_len(request.dest).await;
            }

            let expected = request.expected_total;
            if expected > 0 && resume_from > expected {
                debug!(
                    url = request.url,
                    resume_from, expected, "Partial file larger than expected, restarting"
                );
                remove_partial(request.dest).await?;
                resume_from = 0;
            }
            if expected > 0 && resume_from == expected {
                on_progress(expected, expected);
                return Ok(expected);
            }

            match self
                .attempt(request, resume_from, attempt, on_progress, token)
                .await
            {
                Ok(size) => return Ok(size),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.requires_restart() && attempt < max_attempts => {
                    warn!(url = request.url, attempt, error = %e, "Restarting transfer from zero");
                    remove_partial(request.dest).await?;
                    last_error = Some(e);
                }
                Err(e) if e.is_retryable() && attempt < max_attempts => {
                    warn!(
                        url = request.url,
                        attempt,
                        max_attempts,
                        error = %e,
                        "Transfer failed, retrying"
                    );
                    self.config.retry.wait(attempt, token).await?;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or(DownloadError::Cancelled))
    }

    async fn attempt(
        &self,
        request: &TransferRequest<'_>,
        resume_from: u64,
        attempt: u32,
        on_progress: &TransferProgress<'_>,
        token: &CancelToken,
    ) -> DownloadResult<u64> {
        let url = request.url;
        let live = token.register();
        if live.is_aborted() {
            return Err(DownloadError::Cancelled);
        }

        let mut builder = self.client.get(url);
        if resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", resume_from));
        }
        trace!(url, resume_from, attempt, "Sending request");

        let response = tokio::select! {
            biased;
            _ = live.aborted() => return Err(DownloadError::Cancelled),
            result = builder.send() => result.map_err(|e| classify(url, e))?,
        };

        match response.status() {
            StatusCode::PARTIAL_CONTENT => {}
            StatusCode::OK if resume_from > 0 => {
                return Err(DownloadError::RangeIgnored {
                    url: url.to_string(),
                    offset: resume_from,
                })
            }
            StatusCode::OK => {}
            StatusCode::RANGE_NOT_SATISFIABLE => {
                return Err(DownloadError::RangeNotSatisfiable {
                    url: url.to_string(),
                    offset: resume_from,
                })
            }
            status => {
                return Err(DownloadError::HttpStatus {
                    url: url.to_string(),
                    status: status.as_u16(),
                })
            }
        }

        let advertised = response.content_length().map(|len| len + resume_from);
        let total = if request.expected_total > 0 {
            request.expected_total
        } else {
            advertised.unwrap_or(0)
        };

        let file = open_destination(request.dest, resume_from).await?;
        let mut writer = BufWriter::with_capacity(BUFFER_SIZE, file);
        let received = self
            .stream_body(
                response,
                &mut writer,
                &live,
                request,
                resume_from,
                total,
                attempt,
                on_progress,
            )
            .await;

        // Keep whatever arrived so the next attempt can resume from it.
        let flushed = writer.flush().await.map_err(|e| DownloadError::WriteFailed {
            path: request.dest.to_path_buf(),
            source: e,
        });
        let received = received?;
        flushed?;

        if let Some(expected) = advertised {
            if received < expected {
                return Err(DownloadError::Truncated {
                    url: url.to_string(),
                    received,
                    expected,
                });
            }
        }

        debug!(url, bytes = received, attempt, "Transfer complete");
        Ok(received)
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        response: reqwest::Response,
        writer: &mut BufWriter<tokio::fs::File>,
        live: &LiveRequest,
        request: &TransferRequest<'_>,
        resume_from: u64,
        total: u64,
        attempt: u32,
        on_progress: &TransferProgress<'_>,
    ) -> DownloadResult<u64> {
        let url = request.url;
        let stall_limit = self.config.stall_timeout_for(attempt);
        let mut ticker = tokio::time::interval(self.config.stall_check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        let mut stream = response.bytes_stream();
        let mut received = resume_from;
        let mut last_data = Instant::now();

        loop {
            tokio::select! {
                biased;
                _ = live.aborted() => return Err(DownloadError::Cancelled),
                _ = ticker.tick() => {
                    let idle = last_data.elapsed();
                    if idle > stall_limit {
                        return Err(DownloadError::Stalled { url: url.to_string(), idle });
                    }
                }
                chunk = stream.next() => match chunk {
                    Some(Ok(bytes)) => {
                        writer.write_all(&bytes).await.map_err(|e| DownloadError::WriteFailed {
                            path: request.dest.to_path_buf(),
                            source: e,
                        })?;
                        received += bytes.len() as u64;
                        last_data = Instant::now();
                        let reported = if total > 0 { received.min(total) } else { received };
                        on_progress(reported, total);
                    }
                    Some(Err(e)) => return Err(classify(url, e)),
                    None => return Ok(received),
                }
            }
        }
    }
}

/// Join a base URL and a manifest path.
///
/// Backslashes become `/` and a trailing `/` on the base is tolerated.
pub fn join_url(base: &str, path: &str) -> String {
    let path = path.replace('\\', "/");
    format!(
        "{}/{}",
        base.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Map a reqwest error to a transport error, deciding if it is transient.
fn classify(url: &str, error: reqwest::Error) -> DownloadError {
    let retryable = error.is_timeout()
        || error.is_connect()
        || error.is_body()
        || error.is_decode()
        || error.is_request()
        || has_retryable_io(&error);
    DownloadError::Transport {
        url: url.to_string(),
        retryable,
        source: error,
    }
}

/// Whether any error in the source chain is a transient I/O failure.
fn has_retryable_io(error: &(dyn StdError + 'static)) -> bool {
    let mut current = Some(error);
    while let Some(err) = current {
        if let Some(io_err) = err.downcast_ref::<io::Error>() {
            if is_retryable_io_kind(io_err.kind()) {
                return true;
            }
        }
        current = err.source();
    }
    false
}

fn is_retryable_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::NotConnected
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::TimedOut
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::Interrupted
    )
}

async fn file_len(path: &Path) -> u64 {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Delete a scratch file; a missing file is fine.
pub(crate) async fn remove_partial(path: &Path) -> DownloadResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::WriteFailed {
            path: path.to_path_buf(),
            source: e,
        }),
    }
}

/// Open `dest` for append when resuming, otherwise truncate it.
async fn open_destination(dest: &Path, resume_from: u64) -> DownloadResult<tokio::fs::File> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| DownloadError::CreateDirFailed {
                path: parent.to_path_buf(),
                source: e,
            })?;
    }

    let mut options = OpenOptions::new();
    if resume_from > 0 {
        options.append(true);
    } else {
        options.write(true).create(true).truncate(true);
    }

    options
        .open(dest)
        .await
        .map_err(|e| DownloadError::WriteFailed {
            path: dest.to_path_buf(),
            source: e,
        })
}
