//! Resumable Download Library
//!
//! This library downloads files over HTTP(S) into a local directory and
//! keeps each download's lifecycle in `SQLite`, so transfers can be paused,
//! resumed, retried, cancelled and picked up again after a restart.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`manager`] - Host-facing handle; serializes user intents
//! - [`jobs`] - Keyed background job executor with concurrency limits
//! - [`worker`] - Job that drives one record through a transfer
//! - [`download`] - HTTP transfer engine with range resume and `ETag` checks
//! - [`record`] - Persisted download records and change observation
//! - [`db`] - Database connection and schema management
//! - [`config`], [`network`], [`notification`] - Host-supplied settings and hooks

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod db;
pub mod download;
pub mod jobs;
pub mod manager;
pub mod network;
pub mod notification;
pub mod record;
pub mod request;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use config::{ConfigError, DownloadConfig, DownloadSettings, NotificationConfig};
pub use db::{Database, DbError};
pub use download::{DownloadError, HttpClient, TransferEngine, TransferListener, TransferTarget};
pub use jobs::{
    CancelReason, ExistingWorkPolicy, Job, JobConstraints, JobContext, JobEvent, JobExecutor,
    JobOutcome, JobState, ScheduleOutcome,
};
pub use manager::{DownloadManager, ManagerError};
pub use network::NetworkMonitor;
pub use notification::{
    DownloadNotification, NotificationAction, NotificationSink, TracingNotifier,
};
pub use record::{DownloadRecord, DownloadStatus, RecordStore, StoreError, UserAction};
pub use request::{DownloadRequest, RequestError, download_id};
pub use worker::TransferWorker;
