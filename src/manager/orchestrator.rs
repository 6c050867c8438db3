//! Sequential processing of user intents.
//!
//! One task owns the orchestrator and handles commands in arrival order, so
//! orchestrator writes for a given id never interleave.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::DownloadConfig;
use crate::download::TransferEngine;
use crate::jobs::{ExistingWorkPolicy, JobConstraints, JobExecutor, ScheduleOutcome};
use crate::notification::NotificationSink;
use crate::record::{
    DownloadRecord, DownloadStatus, RecordStore, StoreError, UserAction, unix_millis_now,
};
use crate::request::DownloadRequest;
use crate::worker::TransferWorker;

/// Intent applied to existing records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Intent {
    Pause,
    Resume,
    Cancel,
    Retry,
}

/// Which records an intent applies to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) enum Target {
    Id(i64),
    Tag(String),
    All,
    /// Records queued strictly before this time (ms since epoch).
    OlderThan(i64),
}

pub(super) enum Command {
    Enqueue {
        request: DownloadRequest,
    },
    Apply {
        intent: Intent,
        target: Target,
    },
    Clear {
        target: Target,
        delete_file: bool,
    },
    Flush {
        reply: oneshot::Sender<()>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub(super) struct Orchestrator {
    pub(super) store: RecordStore,
    pub(super) executor: JobExecutor,
    pub(super) engine: TransferEngine,
    pub(super) config: DownloadConfig,
    pub(super) notifier: Arc<dyn NotificationSink>,
}

fn job_key(id: i64) -> String {
    id.to_string()
}

impl Orchestrator {
    pub(super) async fn run(self, mut commands: mpsc::UnboundedReceiver<Command>) {
        self.recover().await;

        let mut shutdown_reply = None;
        while let Some(command) = commands.recv().await {
            match command {
                Command::Enqueue { request } => {
                    if let Err(error) = self.enqueue(&request, UserAction::Start).await {
                        warn!(url = %request.url(), error = %error, "failed to enqueue download");
                    }
                }
                Command::Apply { intent, target } => self.apply(intent, &target).await,
                Command::Clear {
                    target,
                    delete_file,
                } => self.clear(&target, delete_file).await,
                Command::Flush { reply } => {
                    let _ = reply.send(());
                }
                Command::Shutdown { reply } => {
                    shutdown_reply = Some(reply);
                    break;
                }
            }
        }

        drop(commands);
        self.executor.shutdown().await;
        info!("download manager stopped");
        if let Some(reply) = shutdown_reply {
            let _ = reply.send(());
        }
    }

    fn worker(&self, id: i64) -> Arc<TransferWorker> {
        Arc::new(TransferWorker::new(
            id,
            self.store.clone(),
            self.engine.clone(),
            self.config.notification(),
        ))
    }

    fn dismiss(&self, id: i64) {
        if self.config.notification().enabled {
            self.notifier.dismiss(id);
        }
    }

    /// Creates or re-queues the record for `request` and schedules its job.
    #[instrument(skip(self, request), fields(id = request.id(), action = %action))]
    async fn enqueue(&self, request: &DownloadRequest, action: UserAction) -> Result<(), StoreError> {
        let id = request.id();
        let job_id = Uuid::new_v4();

        match self.store.get(id).await? {
            Some(record) if record.status == DownloadStatus::InProgress => {
                debug!("record in progress, keeping its state");
            }
            Some(_) => {
                self.store
                    .modify(id, |record| {
                        record.job_uuid = job_id.to_string();
                        record.status = DownloadStatus::Queued;
                        record.action = action;
                        record.failure_reason.clear();
                    })
                    .await?;
            }
            None => {
                let record = request.to_record(unix_millis_now(), job_id.to_string());
                remove_files(&[record.temp_path(), record.final_path()]).await;
                self.store.insert(&record).await?;
                info!(url = %record.url, file = %record.file_name, "download queued");
            }
        }

        let outcome = self.executor.schedule_unique(
            &job_key(id),
            job_id,
            ExistingWorkPolicy::Keep,
            JobConstraints::network(),
            self.worker(id),
        );
        if let ScheduleOutcome::Kept(kept) = outcome {
            debug!(kept = %kept, "job already scheduled");
            self.store
                .modify(id, |record| {
                    if record.status != DownloadStatus::InProgress {
                        record.job_uuid = kept.to_string();
                    }
                })
                .await?;
        }
        Ok(())
    }

    async fn resolve(&self, target: &Target) -> Result<Vec<DownloadRecord>, StoreError> {
        match target {
            Target::Id(id) => Ok(self.store.get(*id).await?.into_iter().collect()),
            Target::Tag(tag) => self.store.list_by_tag(tag).await,
            Target::All => self.store.list_all().await,
            Target::OlderThan(cutoff) => Ok(self
                .store
                .list_all()
                .await?
                .into_iter()
                .filter(|record| record.queue_time < *cutoff)
                .collect()),
        }
    }

    #[instrument(skip(self))]
    async fn apply(&self, intent: Intent, target: &Target) {
        let records = match self.resolve(target).await {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "failed to resolve download records");
                return;
            }
        };
        if records.is_empty() {
            debug!("no matching downloads");
        }

        for record in records {
            let result = match intent {
                Intent::Pause => self.pause(record.id).await,
                Intent::Cancel => self.cancel(record.id).await,
                Intent::Resume => self.resume(record.id).await,
                Intent::Retry => self.retry(record.id).await,
            };
            if let Err(error) = result {
                warn!(id = record.id, error = %error, "failed to apply {intent:?}");
            }
        }
    }

    async fn pause(&self, id: i64) -> Result<(), StoreError> {
        if self
            .store
            .modify(id, |record| record.action = UserAction::Pause)
            .await?
            .is_none()
        {
            return Ok(());
        }
        if !self.executor.cancel(&job_key(id)) {
            debug!(id, "no active job, pause only recorded");
        }
        Ok(())
    }

    async fn cancel(&self, id: i64) -> Result<(), StoreError> {
        let Some(record) = self
            .store
            .modify(id, |record| record.action = UserAction::Cancel)
            .await?
        else {
            return Ok(());
        };
        if self.executor.cancel(&job_key(id)) || record.status == DownloadStatus::Success {
            return Ok(());
        }

        debug!(id, "no active job, finalizing cancel");
        remove_files(&[record.temp_path(), record.final_path()]).await;
        self.store
            .modify(id, |record| {
                record.status = DownloadStatus::Cancelled;
                record.speed_per_ms = 0.0;
            })
            .await?;
        self.dismiss(id);
        Ok(())
    }

    async fn resume(&self, id: i64) -> Result<(), StoreError> {
        let Some(record) = self.store.get(id).await? else {
            return Ok(());
        };
        if record.status == DownloadStatus::Success {
            debug!(id, "already complete, nothing to resume");
            return Ok(());
        }
        self.store
            .modify(id, |record| record.action = UserAction::Resume)
            .await?;
        self.enqueue(&DownloadRequest::from_record(&record), UserAction::Resume)
            .await
    }

    async fn retry(&self, id: i64) -> Result<(), StoreError> {
        let Some(record) = self
            .store
            .modify(id, |record| record.action = UserAction::Retry)
            .await?
        else {
            return Ok(());
        };
        self.enqueue(&DownloadRequest::from_record(&record), UserAction::Retry)
            .await
    }

    #[instrument(skip(self))]
    async fn clear(&self, target: &Target, delete_file: bool) {
        let records = match self.resolve(target).await {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "failed to resolve download records");
                return;
            }
        };
        for record in records {
            if let Err(error) = self.clear_one(record.id, delete_file).await {
                warn!(id = record.id, error = %error, "failed to clear download");
            }
        }
    }

    async fn clear_one(&self, id: i64, delete_file: bool) -> Result<(), ClearError> {
        let key = job_key(id);
        self.executor.cancel(&key);
        self.executor.wait_idle(&key).await;

        let Some(record) = self.store.get(id).await? else {
            return Ok(());
        };
        if delete_file {
            for path in [record.temp_path(), record.final_path()] {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                    Err(source) => return Err(ClearError::Io { path, source }),
                }
            }
        }

        self.dismiss(id);
        match self.store.delete(id).await {
            Ok(()) | Err(StoreError::RecordNotFound(_)) => {}
            Err(error) => return Err(error.into()),
        }
        info!(id, delete_file, "download cleared");
        Ok(())
    }

    /// Re-schedules downloads a previous process left unfinished.
    ///
    /// Records whose last intent was pause or cancel are finalized instead.
    #[instrument(skip(self))]
    async fn recover(&self) {
        let records = match self.store.list_all().await {
            Ok(records) => records,
            Err(error) => {
                warn!(error = %error, "failed to load downloads for recovery");
                return;
            }
        };

        let mut resumed = 0_usize;
        for record in records.into_iter().filter(|r| r.status.is_active()) {
            let result = match record.action {
                UserAction::Pause => self
                    .store
                    .modify(record.id, |r| {
                        r.status = DownloadStatus::Paused;
                        r.speed_per_ms = 0.0;
                    })
                    .await
                    .map(|_| ()),
                UserAction::Cancel => {
                    remove_files(&[record.temp_path(), record.final_path()]).await;
                    self.store
                        .modify(record.id, |r| {
                            r.status = DownloadStatus::Cancelled;
                            r.speed_per_ms = 0.0;
                        })
                        .await
                        .map(|_| ())
                }
                action => {
                    resumed += 1;
                    self.enqueue(&DownloadRequest::from_record(&record), action)
                        .await
                }
            };
            if let Err(error) = result {
                warn!(id = record.id, error = %error, "failed to recover download");
            }
        }
        if resumed > 0 {
            info!(resumed, "recovered unfinished downloads");
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ClearError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to delete {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
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
