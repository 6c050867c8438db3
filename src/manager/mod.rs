//! Public handle to the download engine.
//!
//! [`DownloadManager`] turns user intents (download, pause, resume, cancel,
//! retry, clear) into commands for a single orchestrator task, and exposes
//! the persisted records for reading and observation. Intents return as soon
//! as they are queued; their effect becomes visible through the record
//! streams.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use resumable_dl::{
//!     Database, DownloadConfig, DownloadManager, DownloadRequest, NetworkMonitor,
//!     TracingNotifier,
//! };
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::new(std::path::Path::new("downloads.db")).await?;
//! let manager = DownloadManager::start(
//!     db,
//!     DownloadConfig::default(),
//!     NetworkMonitor::default(),
//!     Arc::new(TracingNotifier),
//! )?;
//!
//! let request = DownloadRequest::new("https://example.com/file.zip", "/tmp/downloads")?;
//! let id = manager.download(request)?;
//! manager.pause(id)?;
//! manager.resume(id)?;
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

mod error;
mod orchestrator;

pub use error::ManagerError;

use std::sync::Arc;

use futures_util::stream::BoxStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, info};

use crate::config::DownloadConfig;
use crate::db::Database;
use crate::download::{HttpClient, TransferEngine};
use crate::jobs::{JobEvent, JobExecutor};
use crate::network::NetworkMonitor;
use crate::notification::{NotificationAction, NotificationSink};
use crate::record::{DownloadRecord, RecordStore};
use crate::request::DownloadRequest;
use orchestrator::{Command, Intent, Orchestrator, Target};

type Result<T> = std::result::Result<T, ManagerError>;

/// Cloneable handle to a running download engine.
#[derive(Debug, Clone)]
pub struct DownloadManager {
    commands: mpsc::UnboundedSender<Command>,
    store: RecordStore,
    executor: JobExecutor,
    network: NetworkMonitor,
}

impl DownloadManager {
    /// Starts the engine on `db`.
    ///
    /// Downloads left queued or running by a previous process are resumed
    /// before any new intent is processed. Must be called inside a Tokio
    /// runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::HttpClient`] if the HTTP client cannot be built.
    pub fn start(
        db: Database,
        config: DownloadConfig,
        network: NetworkMonitor,
        notifier: Arc<dyn NotificationSink>,
    ) -> Result<Self> {
        let client = HttpClient::new_with_timeouts(config.connect_timeout(), config.read_timeout())
            .map_err(ManagerError::HttpClient)?;
        let engine = TransferEngine::with_progress_interval(client, config.progress_interval());
        let executor = JobExecutor::new(
            config.max_concurrent_downloads(),
            network.clone(),
            Arc::clone(&notifier),
        );
        let store = RecordStore::new(db);
        let max_concurrent = config.max_concurrent_downloads();

        let (commands, receiver) = mpsc::unbounded_channel();
        let orchestrator = Orchestrator {
            store: store.clone(),
            executor: executor.clone(),
            engine,
            config,
            notifier,
        };
        tokio::spawn(orchestrator.run(receiver));
        tokio::spawn(log_job_events(executor.subscribe()));

        info!(max_concurrent, "download manager started");
        Ok(Self {
            commands,
            store,
            executor,
            network,
        })
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| ManagerError::Closed)
    }

    fn apply(&self, intent: Intent, target: Target) -> Result<()> {
        self.send(Command::Apply { intent, target })
    }

    fn clear(&self, target: Target, delete_file: bool) -> Result<()> {
        self.send(Command::Clear {
            target,
            delete_file,
        })
    }

    /// Queues `request` and returns the id of its record.
    ///
    /// Requesting the same `(url, path, file_name)` again re-queues the
    /// existing record instead of creating a second one.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn download(&self, request: DownloadRequest) -> Result<i64> {
        let id = request.id();
        self.send(Command::Enqueue { request })?;
        Ok(id)
    }

    /// Stops the transfer for `id`, keeping the partial file.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn pause(&self, id: i64) -> Result<()> {
        self.apply(Intent::Pause, Target::Id(id))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn pause_by_tag(&self, tag: &str) -> Result<()> {
        self.apply(Intent::Pause, Target::Tag(tag.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn pause_all(&self) -> Result<()> {
        self.apply(Intent::Pause, Target::All)
    }

    /// Continues `id` from its partial file. Completed downloads are left alone.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn resume(&self, id: i64) -> Result<()> {
        self.apply(Intent::Resume, Target::Id(id))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn resume_by_tag(&self, tag: &str) -> Result<()> {
        self.apply(Intent::Resume, Target::Tag(tag.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn resume_all(&self) -> Result<()> {
        self.apply(Intent::Resume, Target::All)
    }

    /// Stops `id` and deletes its partial and final files. The record stays,
    /// marked cancelled.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn cancel(&self, id: i64) -> Result<()> {
        self.apply(Intent::Cancel, Target::Id(id))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn cancel_by_tag(&self, tag: &str) -> Result<()> {
        self.apply(Intent::Cancel, Target::Tag(tag.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn cancel_all(&self) -> Result<()> {
        self.apply(Intent::Cancel, Target::All)
    }

    /// Re-queues `id` regardless of its current status.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn retry(&self, id: i64) -> Result<()> {
        self.apply(Intent::Retry, Target::Id(id))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn retry_by_tag(&self, tag: &str) -> Result<()> {
        self.apply(Intent::Retry, Target::Tag(tag.to_string()))
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn retry_all(&self) -> Result<()> {
        self.apply(Intent::Retry, Target::All)
    }

    /// Stops `id` and deletes its record, and its files when `delete_file`.
    ///
    /// If a file cannot be deleted the record is kept.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn clear_db(&self, id: i64, delete_file: bool) -> Result<()> {
        self.clear(Target::Id(id), delete_file)
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn clear_db_by_tag(&self, tag: &str, delete_file: bool) -> Result<()> {
        self.clear(Target::Tag(tag.to_string()), delete_file)
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn clear_all_db(&self, delete_file: bool) -> Result<()> {
        self.clear(Target::All, delete_file)
    }

    /// Clears records queued before `time_ms` (milliseconds since the epoch).
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn clear_db_older_than(&self, time_ms: i64, delete_file: bool) -> Result<()> {
        self.clear(Target::OlderThan(time_ms), delete_file)
    }

    /// Routes a notification button press to the matching intent.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub fn handle_notification_action(&self, id: i64, action: NotificationAction) -> Result<()> {
        match action {
            NotificationAction::Pause => self.pause(id),
            NotificationAction::Resume => self.resume(id),
            NotificationAction::Cancel => self.cancel(id),
            NotificationAction::Retry => self.retry(id),
        }
    }

    /// Resolves once every intent sent before this call has been processed.
    ///
    /// Transfers scheduled by those intents may still be running.
    ///
    /// # Errors
    ///
    /// Returns [`ManagerError::Closed`] after [`shutdown`](Self::shutdown).
    pub async fn flush(&self) -> Result<()> {
        let (reply, done) = oneshot::channel();
        self.send(Command::Flush { reply })?;
        done.await.map_err(|_| ManagerError::Closed)
    }

    /// Stops accepting intents and cancels running transfers.
    ///
    /// Interrupted records keep their active status so the next
    /// [`start`](Self::start) resumes them.
    pub async fn shutdown(&self) {
        let (reply, done) = oneshot::channel();
        if self.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if the read fails.
    pub async fn get_download(&self, id: i64) -> Result<Option<DownloadRecord>> {
        Ok(self.store.get(id).await?)
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if the read fails.
    pub async fn get_downloads(&self) -> Result<Vec<DownloadRecord>> {
        Ok(self.store.list_all().await?)
    }

    /// # Errors
    ///
    /// Returns [`ManagerError::Store`] if the read fails.
    pub async fn get_downloads_by_tag(&self, tag: &str) -> Result<Vec<DownloadRecord>> {
        Ok(self.store.list_by_tag(tag).await?)
    }

    /// Emits all records now and again after every change.
    #[must_use]
    pub fn observe_downloads(&self) -> BoxStream<'static, Vec<DownloadRecord>> {
        self.store.observe_all()
    }

    #[must_use]
    pub fn observe_downloads_by_tag(&self, tag: &str) -> BoxStream<'static, Vec<DownloadRecord>> {
        self.store.observe_tag(tag)
    }

    /// Emits `None` while no record exists for `id`.
    #[must_use]
    pub fn observe_download(&self, id: i64) -> BoxStream<'static, Option<DownloadRecord>> {
        self.store.observe_id(id)
    }

    /// Connectivity switch for network-constrained jobs.
    #[must_use]
    pub fn network(&self) -> &NetworkMonitor {
        &self.network
    }

    /// Lifecycle events of the underlying jobs.
    #[must_use]
    pub fn subscribe_jobs(&self) -> broadcast::Receiver<JobEvent> {
        self.executor.subscribe()
    }
}

async fn log_job_events(mut events: broadcast::Receiver<JobEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => debug!(
                key = %event.key,
                job_id = %event.job_id,
                state = %event.state,
                progress = ?event.progress,
                "job event"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "job event log lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
