//! Job trait, scheduling options and lifecycle events.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Inner;
use crate::notification::DownloadNotification;

/// What `schedule_unique` does when a job already exists for the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistingWorkPolicy {
    /// Leave a pending or running job alone. A job that has already been
    /// cancelled is replaced; the new one starts after it has finished.
    Keep,
}

/// Preconditions a job waits for before it runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobConstraints {
    pub network_required: bool,
}

impl JobConstraints {
    #[must_use]
    pub fn network() -> Self {
        Self {
            network_required: true,
        }
    }
}

/// Lifecycle state reported on the executor's event channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Enqueued,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobState {
    #[must_use]
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Enqueued => "enqueued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(label)
    }
}

/// How a job run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl From<JobOutcome> for JobState {
    fn from(outcome: JobOutcome) -> Self {
        match outcome {
            JobOutcome::Succeeded => Self::Succeeded,
            JobOutcome::Failed => Self::Failed,
            JobOutcome::Cancelled => Self::Cancelled,
        }
    }
}

/// One state change of one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobEvent {
    pub key: String,
    pub job_id: Uuid,
    pub state: JobState,
    /// Whole percent, when the job reported one.
    pub progress: Option<u8>,
}

/// Result of [`JobExecutor::schedule_unique`](super::JobExecutor::schedule_unique).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleOutcome {
    /// The new job was scheduled under the supplied id.
    Enqueued(Uuid),
    /// An existing job was kept; carries its id.
    Kept(Uuid),
}

impl ScheduleOutcome {
    /// Id of the job that will run for the key.
    #[must_use]
    pub fn job_id(&self) -> Uuid {
        match self {
            Self::Enqueued(id) | Self::Kept(id) => *id,
        }
    }
}

/// Why a job's cancellation token fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// `cancel(key)` was called for this job.
    Requested,
    /// A newer job was scheduled for the same key and will run next.
    Superseded,
    /// The executor is shutting down.
    Shutdown,
}

/// A unit of work the executor runs.
#[async_trait]
pub trait Job: Send + Sync {
    async fn run(&self, ctx: JobContext) -> JobOutcome;
}

/// Handle a running job uses to observe cancellation and report back.
#[derive(Clone)]
pub struct JobContext {
    pub(super) key: String,
    pub(super) job_id: Uuid,
    pub(super) cancel: CancellationToken,
    pub(super) inner: Arc<Inner>,
}

impl fmt::Debug for JobContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobContext")
            .field("key", &self.key)
            .field("job_id", &self.job_id)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    #[must_use]
    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Token that fires when the job should stop.
    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Why the token fired, or `None` while it has not.
    #[must_use]
    pub fn cancel_reason(&self) -> Option<CancelReason> {
        if !self.cancel.is_cancelled() {
            return None;
        }
        if self.inner.is_shutting_down() {
            return Some(CancelReason::Shutdown);
        }
        if self.inner.current_job_id(&self.key) == Some(self.job_id) {
            Some(CancelReason::Requested)
        } else {
            Some(CancelReason::Superseded)
        }
    }

    /// Publishes a `Running` event carrying `progress`.
    pub fn report_progress(&self, progress: u8) {
        self.inner.emit(JobEvent {
            key: self.key.clone(),
            job_id: self.job_id,
            state: JobState::Running,
            progress: Some(progress),
        });
    }

    /// Posts or refreshes the foreground notification for this job.
    pub fn set_foreground(&self, notification: &DownloadNotification) {
        self.inner.notifier.show(notification);
    }

    /// Removes the foreground notification for `id`.
    pub fn clear_foreground(&self, id: i64) {
        self.inner.notifier.dismiss(id);
    }
}
