//! Streaming HTTP downloader.
//!
//! Writes the response body to a temp file chunk by chunk, reporting
//! throttled progress and honoring cooperative cancellation at chunk
//! boundaries. A stalled connection trips an idle timeout rather than a
//! wall-clock limit, so arbitrarily large files are fine as long as
//! bytes keep arriving. Retry policy lives in the task manager, not
//! here; every error tears down the temp file and returns.

use std::path::Path;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::Client;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::DownloadConfig;

use super::error::DownloadError;

/// Connect timeout for the initial request.
const CONNECT_TIMEOUT_SECS: u64 = 30;

/// Streaming downloader for a single file.
#[derive(Debug, Clone)]
pub struct Downloader {
    client: Client,
    idle_timeout: Duration,
    progress_byte_interval: u64,
    progress_time_interval: Duration,
}

impl Downloader {
    pub fn new(config: &DownloadConfig) -> Result<Self, DownloadError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .build()
            .map_err(|e| DownloadError::Network {
                url: String::new(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;

        Ok(Self {
            client,
            idle_timeout: config.idle_timeout,
            progress_byte_interval: config.progress_byte_interval,
            progress_time_interval: config.progress_time_interval,
        })
    }

    /// Fetch `url` into `temp_path`.
    ///
    /// `on_progress` is called with `(bytes_downloaded, total_bytes)` at
    /// most once per progress interval, plus a final call when the body
    /// is fully written. `total_bytes` is 0 when the server sends no
    /// content length. Returns the number of bytes written.
    ///
    /// On any error, including cancellation, the temp file is removed
    /// before returning.
    pub async fn fetch(
        &self,
        url: &str,
        temp_path: &Path,
        api_key: Option<&str>,
        cancel: &CancellationToken,
        mut on_progress: impl FnMut(u64, u64),
    ) -> Result<u64, DownloadError> {
        if let Some(parent) = temp_path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::Disk {
                    path: parent.to_path_buf(),
                    source: e,
                })?;
        }

        let mut request = self.client.get(url);
        if let Some(key) = api_key {
            request = request.bearer_auth(key);
        }

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled),
            response = request.send() => response.map_err(|e| DownloadError::Network {
                url: url.to_string(),
                reason: e.to_string(),
            })?,
        };

        let status = response.status();
        if !status.is_success() {
            return Err(DownloadError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let total_bytes = response.content_length().unwrap_or(0);
        debug!(url, total_bytes, temp = %temp_path.display(), "download started");

        let mut file = fs::File::create(temp_path)
            .await
            .map_err(|e| DownloadError::Disk {
                path: temp_path.to_path_buf(),
                source: e,
            })?;

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_reported: u64 = 0;
        let mut last_report_at = Instant::now();

        loop {
            // Cancellation is only observed between chunks; a chunk that
            // has started writing is written in full.
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    drop(file);
                    self.discard(temp_path).await;
                    return Err(DownloadError::Cancelled);
                }
                next = timeout(self.idle_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    drop(file);
                    self.discard(temp_path).await;
                    return Err(DownloadError::IdleTimeout {
                        url: url.to_string(),
                        timeout_secs: self.idle_timeout.as_secs(),
                    });
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    drop(file);
                    self.discard(temp_path).await;
                    return Err(DownloadError::Network {
                        url: url.to_string(),
                        reason: e.to_string(),
                    });
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                self.discard(temp_path).await;
                return Err(DownloadError::Disk {
                    path: temp_path.to_path_buf(),
                    source: e,
                });
            }
            downloaded += chunk.len() as u64;

            if downloaded - last_reported >= self.progress_byte_interval
                || last_report_at.elapsed() >= self.progress_time_interval
            {
                on_progress(downloaded, total_bytes);
                last_reported = downloaded;
                last_report_at = Instant::now();
            }
        }

        if let Err(e) = file.flush().await {
            drop(file);
            self.discard(temp_path).await;
            return Err(DownloadError::Disk {
                path: temp_path.to_path_buf(),
                source: e,
            });
        }

        on_progress(downloaded, total_bytes);
        debug!(url, downloaded, "download body complete");
        Ok(downloaded)
    }

    async fn discard(&self, temp_path: &Path) {
        if let Err(e) = fs::remove_file(temp_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %temp_path.display(), error = %e, "failed to remove temp file");
            }
        }
    }
}
