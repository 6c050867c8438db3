//! The job that drives one download record through a transfer.
//!
//! ```text
//! Queued --(job starts)--> Started --(first bytes)--> InProgress
//! InProgress --(complete, renamed)--> Success
//! InProgress --(cancelled, action == Pause)--> Paused     temp kept
//! InProgress --(cancelled, other action)--> Cancelled     temp and final removed
//! InProgress --(other error)--> Failed                    temp kept, resumable
//! ```
//!
//! The worker is where every transfer error is classified; nothing escapes
//! it. It never deletes the record.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::config::NotificationConfig;
use crate::download::{DownloadError, TransferEngine, TransferListener, TransferTarget};
use crate::jobs::{CancelReason, Job, JobContext, JobOutcome};
use crate::notification::DownloadNotification;
use crate::record::{
    DownloadRecord, DownloadStatus, RecordStore, StoreError, UserAction, percent,
};

/// Attempts at a terminal record write while the database reports busy.
const FINAL_WRITE_ATTEMPTS: u32 = 5;

const FINAL_WRITE_BACKOFF: Duration = Duration::from_millis(200);

fn to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

/// Runs the transfer for one record id.
#[derive(Debug, Clone)]
pub struct TransferWorker {
    id: i64,
    store: RecordStore,
    engine: TransferEngine,
    notifications: NotificationConfig,
}

impl TransferWorker {
    #[must_use]
    pub fn new(
        id: i64,
        store: RecordStore,
        engine: TransferEngine,
        notifications: NotificationConfig,
    ) -> Self {
        Self {
            id,
            store,
            engine,
            notifications,
        }
    }

    /// Best-effort record update for progress ticks; failures are logged,
    /// not propagated.
    async fn persist<F>(&self, apply: F) -> Option<DownloadRecord>
    where
        F: FnOnce(&mut DownloadRecord) + Send,
    {
        match self.store.modify(self.id, apply).await {
            Ok(Some(record)) => Some(record),
            Ok(None) => {
                warn!(id = self.id, "record disappeared during transfer");
                None
            }
            Err(error) if error.is_busy_or_locked() => {
                debug!(id = self.id, error = %error, "database busy, skipping state update");
                None
            }
            Err(error) => {
                warn!(id = self.id, error = %error, "failed to persist download state");
                None
            }
        }
    }

    /// Terminal record update. Busy databases are retried; any other
    /// failure is returned so the job ends as failed.
    async fn persist_final<F>(&self, apply: F) -> Result<Option<DownloadRecord>, StoreError>
    where
        F: Fn(&mut DownloadRecord) + Send + Sync,
    {
        let mut attempt = 1;
        loop {
            match self.store.modify(self.id, |record| apply(record)).await {
                Err(error) if error.is_busy_or_locked() && attempt < FINAL_WRITE_ATTEMPTS => {
                    debug!(id = self.id, attempt, error = %error, "database busy, retrying final state");
                    tokio::time::sleep(FINAL_WRITE_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Ok(None) => {
                    warn!(id = self.id, "record disappeared during transfer");
                    return Ok(None);
                }
                result => return result,
            }
        }
    }

    fn show(&self, ctx: &JobContext, record: &DownloadRecord) {
        if self.notifications.enabled {
            ctx.set_foreground(&DownloadNotification::from_record(
                record,
                self.notifications.show_speed,
            ));
        }
    }

    fn dismiss(&self, ctx: &JobContext) {
        if self.notifications.enabled {
            ctx.clear_foreground(self.id);
        }
    }

    async fn finish_success(&self, ctx: &JobContext, total: u64) -> JobOutcome {
        let total = to_i64(total);
        let stored = self
            .persist_final(|record| {
                record.status = DownloadStatus::Success;
                record.total_bytes = total;
                record.downloaded_bytes = total;
                record.part1_bytes = total;
                record.speed_per_ms = 0.0;
                record.failure_reason.clear();
            })
            .await;
        match stored {
            Ok(Some(record)) => {
                info!(id = self.id, bytes = total, "download succeeded");
                self.show(ctx, &record);
                ctx.report_progress(100);
                JobOutcome::Succeeded
            }
            Ok(None) => JobOutcome::Failed,
            Err(error) => {
                warn!(id = self.id, error = %error, "failed to record completed download");
                JobOutcome::Failed
            }
        }
    }

    async fn finish_failed(
        &self,
        ctx: &JobContext,
        error: &DownloadError,
        temp_path: &Path,
    ) -> JobOutcome {
        warn!(id = self.id, error = %error, "download failed");
        let reason = error.to_string();
        let on_disk = partial_len(temp_path).await;
        match self
            .persist_final(|record| {
                record.status = DownloadStatus::Failed;
                record.speed_per_ms = 0.0;
                record.failure_reason.clone_from(&reason);
                sync_downloaded(record, on_disk);
            })
            .await
        {
            Ok(Some(record)) => self.show(ctx, &record),
            Ok(None) => {}
            Err(error) => {
                warn!(id = self.id, error = %error, "failed to record download failure");
            }
        }
        JobOutcome::Failed
    }

    async fn finish_cancelled(&self, ctx: &JobContext, temp_path: &Path) -> JobOutcome {
        match ctx.cancel_reason() {
            Some(CancelReason::Superseded) => {
                debug!(id = self.id, "superseded by a newer job, leaving record as is");
                return JobOutcome::Cancelled;
            }
            Some(CancelReason::Shutdown) => {
                debug!(id = self.id, "stopped by shutdown, leaving record for recovery");
                return JobOutcome::Cancelled;
            }
            Some(CancelReason::Requested) | None => {}
        }

        let on_disk = partial_len(temp_path).await;
        let record = match self
            .persist_final(|record| {
                if record.action == UserAction::Pause {
                    record.status = DownloadStatus::Paused;
                    sync_downloaded(record, on_disk);
                } else {
                    record.status = DownloadStatus::Cancelled;
                }
                record.speed_per_ms = 0.0;
            })
            .await
        {
            Ok(Some(record)) => record,
            Ok(None) => return JobOutcome::Cancelled,
            Err(error) => {
                warn!(id = self.id, error = %error, "failed to record stopped download");
                return JobOutcome::Failed;
            }
        };

        if record.status == DownloadStatus::Paused {
            info!(id = self.id, bytes = record.downloaded_bytes, "download paused");
            self.show(ctx, &record);
        } else {
            info!(id = self.id, "download cancelled");
            remove_files(&[record.temp_path(), record.final_path()]).await;
            self.dismiss(ctx);
        }
        JobOutcome::Cancelled
    }
}

/// Length of the partial file, if one exists.
async fn partial_len(path: &Path) -> Option<i64> {
    let meta = tokio::fs::metadata(path).await.ok()?;
    Some(to_i64(meta.len()))
}

/// Progress callbacks are throttled, so the bytes on disk can be ahead of
/// the record when a transfer stops. A missing partial file means the next
/// attempt starts from zero.
fn sync_downloaded(record: &mut DownloadRecord, on_disk: Option<i64>) {
    let len = match on_disk {
        None => 0,
        Some(len) if record.total_bytes > 0 => len.min(record.total_bytes),
        Some(_) => return,
    };
    record.downloaded_bytes = len;
    record.part1_bytes = len;
}

/// Deletes `paths`, ignoring missing files and logging other failures.
async fn remove_files(paths: &[PathBuf]) {
    for path in paths {
        if let Err(error) = tokio::fs::remove_file(path).await
            && error.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %path.display(), error = %error, "failed to remove download file");
        }
    }
}

#[async_trait]
impl Job for TransferWorker {
    #[instrument(skip_all, fields(id = self.id, job_id = %ctx.job_id()))]
    async fn run(&self, ctx: JobContext) -> JobOutcome {
        let record = match self.store.get(self.id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                warn!(id = self.id, "no record for scheduled download");
                return JobOutcome::Failed;
            }
            Err(error) => {
                warn!(id = self.id, error = %error, "failed to load download record");
                return JobOutcome::Failed;
            }
        };

        let temp_path = record.temp_path();
        if ctx.is_cancelled() {
            return self.finish_cancelled(&ctx, &temp_path).await;
        }

        let record = self
            .persist(|record| {
                record.status = DownloadStatus::Started;
                record.speed_per_ms = 0.0;
            })
            .await
            .unwrap_or(record);
        self.show(&ctx, &record);

        let mut headers = record.headers.clone();
        let target = TransferTarget {
            url: &record.url,
            dir: Path::new(&record.file_path),
            file_name: &record.file_name,
            known_etag: &record.e_tag,
        };
        let listener = RecordProgress {
            worker: self,
            ctx: &ctx,
            last_percent: Mutex::new(None),
        };

        match self
            .engine
            .download(&target, &mut headers, ctx.cancellation_token(), &listener)
            .await
        {
            Ok(total) => self.finish_success(&ctx, total).await,
            Err(error) if error.is_cancelled() => self.finish_cancelled(&ctx, &temp_path).await,
            Err(error) => self.finish_failed(&ctx, &error, &temp_path).await,
        }
    }
}

/// Persists transfer callbacks onto the record.
struct RecordProgress<'a> {
    worker: &'a TransferWorker,
    ctx: &'a JobContext,
    last_percent: Mutex<Option<u8>>,
}

impl RecordProgress<'_> {
    /// Stores `value` and returns whether it differs from the previous one.
    fn percent_changed(&self, value: u8) -> bool {
        let mut last = self
            .last_percent
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last == Some(value) {
            false
        } else {
            *last = Some(value);
            true
        }
    }
}

#[async_trait]
impl TransferListener for RecordProgress<'_> {
    async fn on_etag_changed(&self, e_tag: &str) {
        let e_tag = e_tag.to_string();
        self.worker
            .persist(move |record| {
                record.e_tag = e_tag;
                record.total_bytes = 0;
                record.downloaded_bytes = 0;
                record.part1_bytes = 0;
            })
            .await;
    }

    async fn on_start(&self, total_bytes: u64) {
        let total = to_i64(total_bytes);
        if let Some(record) = self
            .worker
            .persist(|record| {
                record.status = DownloadStatus::Started;
                record.total_bytes = total;
                record.downloaded_bytes = 0;
                record.part1_bytes = 0;
            })
            .await
        {
            self.ctx.report_progress(0);
            self.worker.show(self.ctx, &record);
        }
    }

    async fn on_progress(&self, downloaded_bytes: u64, total_bytes: u64, speed_per_ms: f64) {
        let downloaded = to_i64(downloaded_bytes);
        let total = to_i64(total_bytes);
        let progress = percent(downloaded, total);
        if !self.percent_changed(progress) {
            return;
        }

        if let Some(record) = self
            .worker
            .persist(|record| {
                record.status = DownloadStatus::InProgress;
                record.total_bytes = total;
                record.downloaded_bytes = downloaded;
                record.part1_bytes = downloaded;
                record.speed_per_ms = speed_per_ms;
            })
            .await
        {
            self.ctx.report_progress(progress);
            self.worker.show(self.ctx, &record);
        }
    }
}
