//! Single-file transfer with byte-range resumption.
//!
//! A transfer writes into `<file_name>.part` next to the destination and
//! renames it into place once the body is complete. A partial temp file
//! left by an earlier attempt is resumed with a `Range` request as long as
//! the server's `ETag` has not changed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::StatusCode;
use reqwest::header::CONTENT_LENGTH;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};
use url::Url;

use super::client::HttpClient;
use super::constants::PROGRESS_INTERVAL;
use super::error::DownloadError;
use crate::record::temp_file_name;

const RANGE_HEADER: &str = "Range";

/// Callbacks a transfer reports through.
#[async_trait]
pub trait TransferListener: Send + Sync {
    /// The server's `ETag` differs from the one the caller knew; any
    /// partial temp file has been discarded.
    async fn on_etag_changed(&self, e_tag: &str);

    /// First bytes of a transfer starting from zero are about to be written.
    async fn on_start(&self, total_bytes: u64);

    /// Periodic progress; `speed_per_ms` covers the last reporting window.
    async fn on_progress(&self, downloaded_bytes: u64, total_bytes: u64, speed_per_ms: f64);
}

/// What to fetch and where it lands.
#[derive(Debug, Clone, Copy)]
pub struct TransferTarget<'a> {
    pub url: &'a str,
    /// Destination directory, created when missing.
    pub dir: &'a Path,
    pub file_name: &'a str,
    /// `ETag` persisted by the previous attempt, empty when unknown.
    pub known_etag: &'a str,
}

impl TransferTarget<'_> {
    fn temp_path(&self) -> PathBuf {
        self.dir.join(temp_file_name(self.file_name))
    }

    fn final_path(&self) -> PathBuf {
        self.dir.join(self.file_name)
    }
}

/// Drives one HTTP transfer to completion.
#[derive(Debug, Clone)]
pub struct TransferEngine {
    client: HttpClient,
    progress_interval: Duration,
}

impl TransferEngine {
    /// Creates an engine reporting progress every 1.5 s.
    #[must_use]
    pub fn new(client: HttpClient) -> Self {
        Self::with_progress_interval(client, PROGRESS_INTERVAL)
    }

    #[must_use]
    pub fn with_progress_interval(client: HttpClient, progress_interval: Duration) -> Self {
        Self {
            client,
            progress_interval,
        }
    }

    /// Downloads `target`, resuming any partial temp file, and returns the
    /// total length of the finished file.
    ///
    /// `headers` is updated in place: a `Range` entry is added when resuming
    /// and removed when the transfer restarts from zero.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Cancelled`] once `cancel` fires, and
    /// otherwise the first transport, HTTP, IO or rename failure.
    #[instrument(skip_all, fields(url = %target.url, file = %target.file_name))]
    pub async fn download(
        &self,
        target: &TransferTarget<'_>,
        headers: &mut HashMap<String, String>,
        cancel: &CancellationToken,
        listener: &dyn TransferListener,
    ) -> Result<u64, DownloadError> {
        let url = target.url;
        let parsed_url = Url::parse(url).map_err(|_| DownloadError::invalid_url(url))?;
        let temp_path = target.temp_path();
        let final_path = target.final_path();

        tokio::fs::create_dir_all(target.dir)
            .await
            .map_err(|e| DownloadError::io(target.dir, e))?;

        let e_tag = until_cancelled(cancel, self.client.head_etag(url, headers)).await?;
        if e_tag != target.known_etag {
            debug!(old = %target.known_etag, new = %e_tag, "ETag changed, discarding partial file");
            remove_if_exists(&temp_path).await?;
            listener.on_etag_changed(&e_tag).await;
        }

        let mut offset = existing_len(&temp_path).await?;
        if offset > 0 {
            strip_range(headers);
            headers.insert(RANGE_HEADER.to_string(), format!("bytes={offset}-"));
        } else {
            strip_range(headers);
        }

        let mut response = until_cancelled(cancel, self.client.get(url, headers)).await?;
        if offset > 0
            && (response.status() == StatusCode::RANGE_NOT_SATISFIABLE
                || response.url() != &parsed_url)
        {
            debug!(
                status = %response.status(),
                final_url = %response.url(),
                "Range rejected, restarting from zero"
            );
            remove_if_exists(&temp_path).await?;
            strip_range(headers);
            offset = 0;
            response = until_cancelled(cancel, self.client.get(url, headers)).await?;
        }

        if !response.status().is_success() {
            return Err(DownloadError::http_status(url, response.status()));
        }

        if offset > 0 && response.status() != StatusCode::PARTIAL_CONTENT {
            // Full body for a ranged request; appending it would corrupt the file.
            debug!("Server ignored range, restarting from zero");
            remove_if_exists(&temp_path).await?;
            strip_range(headers);
            offset = 0;
        }

        let content_length = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| DownloadError::missing_content_length(url))?;
        let total = content_length.saturating_add(offset);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&temp_path)
            .await
            .map_err(|e| DownloadError::io(&temp_path, e))?;
        let mut writer = BufWriter::new(file);

        let streamed = self
            .stream_body(
                response,
                &mut writer,
                BodyProgress {
                    url,
                    temp_path: &temp_path,
                    offset,
                    total,
                },
                cancel,
                listener,
            )
            .await;
        let flushed = writer
            .flush()
            .await
            .map_err(|e| DownloadError::io(&temp_path, e));
        streamed?;
        flushed?;

        listener.on_progress(total, total, 0.0).await;

        tokio::fs::rename(&temp_path, &final_path)
            .await
            .map_err(|e| DownloadError::rename(&temp_path, &final_path, e))?;

        info!(path = %final_path.display(), bytes = total, resumed = offset > 0, "download complete");
        Ok(total)
    }

    async fn stream_body(
        &self,
        response: reqwest::Response,
        writer: &mut BufWriter<File>,
        progress: BodyProgress<'_>,
        cancel: &CancellationToken,
        listener: &dyn TransferListener,
    ) -> Result<u64, DownloadError> {
        let mut stream = response.bytes_stream();
        let mut window = ProgressWindow::new(self.progress_interval);
        let mut downloaded = progress.offset;
        let mut started = progress.offset > 0;

        loop {
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = stream.next() => next,
            };
            let Some(chunk) = next else {
                break;
            };
            let chunk = chunk.map_err(|e| DownloadError::network(progress.url, e))?;

            if !started {
                listener.on_start(progress.total).await;
                started = true;
            }

            writer
                .write_all(&chunk)
                .await
                .map_err(|e| DownloadError::io(progress.temp_path, e))?;

            let len = chunk.len() as u64;
            downloaded = downloaded.saturating_add(len);
            // Completion is reported once, after the body ends.
            if let Some(speed) = window.record(len)
                && downloaded < progress.total
            {
                listener
                    .on_progress(downloaded, progress.total, speed)
                    .await;
            }
        }

        Ok(downloaded)
    }
}

struct BodyProgress<'a> {
    url: &'a str,
    temp_path: &'a Path,
    offset: u64,
    total: u64,
}

/// Rolling window over which transfer speed is measured.
#[derive(Debug)]
struct ProgressWindow {
    interval: Duration,
    started: Instant,
    bytes: u64,
}

impl ProgressWindow {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            started: Instant::now(),
            bytes: 0,
        }
    }

    /// Adds `bytes` to the window; returns bytes/ms and resets once the
    /// window has elapsed.
    #[allow(clippy::cast_precision_loss)]
    fn record(&mut self, bytes: u64) -> Option<f64> {
        self.bytes = self.bytes.saturating_add(bytes);
        let elapsed = self.started.elapsed();
        if elapsed < self.interval {
            return None;
        }

        let elapsed_ms = (elapsed.as_secs_f64() * 1000.0).max(1.0);
        let speed = self.bytes as f64 / elapsed_ms;
        self.bytes = 0;
        self.started = Instant::now();
        Some(speed)
    }
}

async fn until_cancelled<T, F>(cancel: &CancellationToken, operation: F) -> Result<T, DownloadError>
where
    F: Future<Output = Result<T, DownloadError>>,
{
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(DownloadError::Cancelled),
        result = operation => result,
    }
}

fn strip_range(headers: &mut HashMap<String, String>) {
    headers.retain(|name, _| !name.eq_ignore_ascii_case(RANGE_HEADER));
}

/// Length of the temp file; missing and empty files both count as zero.
async fn existing_len(path: &Path) -> Result<u64, DownloadError> {
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}

async fn remove_if_exists(path: &Path) -> Result<(), DownloadError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(DownloadError::io(path, e)),
    }
}
