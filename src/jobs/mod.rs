//! In-process background job executor.
//!
//! Jobs are keyed by string. At most one job per key is pending or running:
//! scheduling with [`ExistingWorkPolicy::Keep`] is a no-op while a live job
//! exists, and a per-key run lock makes a replacement wait until its
//! predecessor has fully finished. Jobs for different keys run in parallel
//! up to the configured concurrency.
//!
//! # Concurrency Model
//!
//! - Each job runs in its own Tokio task
//! - The per-key run lock is taken first, then network connectivity (when
//!   required) and a semaphore permit
//! - Cancellation is cooperative through a `CancellationToken`; a job
//!   cancelled while still waiting is run anyway with a fired token so it
//!   can record the outcome

mod types;

pub use types::{
    CancelReason, ExistingWorkPolicy, Job, JobConstraints, JobContext, JobEvent, JobOutcome,
    JobState, ScheduleOutcome,
};

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use dashmap::DashMap;
use futures_util::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, broadcast, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::network::NetworkMonitor;
use crate::notification::NotificationSink;

/// Capacity of the job event channel; slow subscribers miss older events.
const EVENT_CHANNEL_CAPACITY: usize = 256;

struct Entry {
    job_id: Uuid,
    cancel: CancellationToken,
}

pub(crate) struct Inner {
    entries: Mutex<HashMap<String, Entry>>,
    run_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    permits: Arc<Semaphore>,
    network: NetworkMonitor,
    events: broadcast::Sender<JobEvent>,
    settled: watch::Sender<u64>,
    shutting_down: AtomicBool,
    pub(crate) notifier: Arc<dyn NotificationSink>,
}

impl Inner {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn current_job_id(&self, key: &str) -> Option<Uuid> {
        self.entries().get(key).map(|entry| entry.job_id)
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    pub(crate) fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Drops the entry for `key` if it still belongs to `job_id`.
    fn finish(&self, key: &str, job_id: Uuid) {
        {
            let mut entries = self.entries();
            if entries.get(key).is_some_and(|entry| entry.job_id == job_id) {
                entries.remove(key);
            }
        }
        self.settled
            .send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    /// Waits for connectivity (when required) and a concurrency permit.
    async fn acquire(&self, constraints: JobConstraints) -> Option<OwnedSemaphorePermit> {
        loop {
            if constraints.network_required {
                self.network.wait_until_connected().await;
            }
            let permit = Arc::clone(&self.permits).acquire_owned().await.ok()?;
            if !constraints.network_required || self.network.is_connected() {
                return Some(permit);
            }
        }
    }
}

/// Runs uniquely-keyed background jobs.
///
/// Cloning is cheap; clones share the same jobs.
#[derive(Clone)]
pub struct JobExecutor {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for JobExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("active", &self.inner.entries().len())
            .field("available_permits", &self.inner.permits.available_permits())
            .finish_non_exhaustive()
    }
}

impl JobExecutor {
    /// Creates an executor running at most `max_concurrent` jobs at once.
    #[must_use]
    pub fn new(
        max_concurrent: usize,
        network: NetworkMonitor,
        notifier: Arc<dyn NotificationSink>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (settled, _) = watch::channel(0);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                run_locks: DashMap::new(),
                permits: Arc::new(Semaphore::new(max_concurrent.max(1))),
                network,
                events,
                settled,
                shutting_down: AtomicBool::new(false),
                notifier,
            }),
        }
    }

    /// Schedules `job` under `key` unless `policy` keeps an existing job.
    #[instrument(skip(self, job), fields(job_id = %job_id))]
    pub fn schedule_unique(
        &self,
        key: &str,
        job_id: Uuid,
        policy: ExistingWorkPolicy,
        constraints: JobConstraints,
        job: Arc<dyn Job>,
    ) -> ScheduleOutcome {
        let cancel = CancellationToken::new();
        {
            let mut entries = self.inner.entries();
            if let Some(existing) = entries.get(key) {
                match policy {
                    ExistingWorkPolicy::Keep if !existing.cancel.is_cancelled() => {
                        debug!(existing = %existing.job_id, "keeping existing job");
                        return ScheduleOutcome::Kept(existing.job_id);
                    }
                    ExistingWorkPolicy::Keep => {
                        debug!(existing = %existing.job_id, "replacing cancelled job");
                    }
                }
            }
            if self.inner.is_shutting_down() {
                cancel.cancel();
            }
            entries.insert(
                key.to_string(),
                Entry {
                    job_id,
                    cancel: cancel.clone(),
                },
            );
        }

        self.inner.emit(JobEvent {
            key: key.to_string(),
            job_id,
            state: JobState::Enqueued,
            progress: None,
        });

        tokio::spawn(run_job(
            Arc::clone(&self.inner),
            key.to_string(),
            job_id,
            constraints,
            job,
            cancel,
        ));
        ScheduleOutcome::Enqueued(job_id)
    }

    /// Context for running a job by hand, outside the scheduler.
    #[cfg(test)]
    pub(crate) fn detached_context(&self, key: &str) -> JobContext {
        JobContext {
            key: key.to_string(),
            job_id: Uuid::new_v4(),
            cancel: CancellationToken::new(),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Cancels the job for `key`.
    ///
    /// Returns whether a job was pending or running for the key.
    #[instrument(skip(self))]
    pub fn cancel(&self, key: &str) -> bool {
        match self.inner.entries().get(key) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// True while a job for `key` is pending or running.
    #[must_use]
    pub fn is_active(&self, key: &str) -> bool {
        self.inner.entries().contains_key(key)
    }

    /// Resolves once no job for `key` is pending or running.
    pub async fn wait_idle(&self, key: &str) {
        let mut settled = self.inner.settled.subscribe();
        while self.is_active(key) {
            if settled.changed().await.is_err() {
                return;
            }
        }
    }

    /// Subscribes to job state events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Cancels every job and waits for all of them to finish.
    ///
    /// Jobs see [`CancelReason::Shutdown`] and leave their state for the
    /// next start to recover.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        let mut settled = self.inner.settled.subscribe();
        {
            let entries = self.inner.entries();
            info!(active = entries.len(), "shutting down job executor");
            for entry in entries.values() {
                entry.cancel.cancel();
            }
        }
        while !self.inner.entries().is_empty() {
            if settled.changed().await.is_err() {
                return;
            }
        }
    }
}

async fn run_job(
    inner: Arc<Inner>,
    key: String,
    job_id: Uuid,
    constraints: JobConstraints,
    job: Arc<dyn Job>,
    cancel: CancellationToken,
) {
    let run_lock = inner.run_locks.entry(key.clone()).or_default().clone();
    let run_guard = run_lock.lock().await;

    let permit = if cancel.is_cancelled() {
        None
    } else {
        tokio::select! {
            biased;
            () = cancel.cancelled() => None,
            permit = inner.acquire(constraints) => permit,
        }
    };

    debug!(key = %key, job_id = %job_id, "job running");
    inner.emit(JobEvent {
        key: key.clone(),
        job_id,
        state: JobState::Running,
        progress: None,
    });

    let ctx = JobContext {
        key: key.clone(),
        job_id,
        cancel,
        inner: Arc::clone(&inner),
    };
    let outcome = match AssertUnwindSafe(job.run(ctx)).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(_) => {
            error!(key = %key, job_id = %job_id, "job panicked");
            JobOutcome::Failed
        }
    };
    drop(permit);

    inner.emit(JobEvent {
        key: key.clone(),
        job_id,
        state: outcome.into(),
        progress: None,
    });
    inner.finish(&key, job_id);
    drop(run_guard);
}
