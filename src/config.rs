//! Runtime configuration for the download service.
//!
//! Hosts fill in a [`DownloadSettings`] (every field has a default) and
//! validate it once with [`DownloadConfig::from_settings`]. The resulting
//! config is immutable for the lifetime of the service.

use std::time::Duration;

use thiserror::Error;

use crate::download::constants::{CONNECT_TIMEOUT_SECS, PROGRESS_INTERVAL, READ_TIMEOUT_SECS};

/// Default number of transfers allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT_DOWNLOADS: usize = 10;

const TIMEOUT_SECS_RANGE: std::ops::RangeInclusive<u64> = 1..=3600;
const PROGRESS_INTERVAL_MS_RANGE: std::ops::RangeInclusive<u64> = 100..=60_000;
const MAX_CONCURRENT_RANGE: std::ops::RangeInclusive<usize> = 1..=100;

/// A setting was outside its accepted range.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid value for `{field}`: {value}. Expected range: {expected}")]
pub struct ConfigError {
    pub field: &'static str,
    pub value: String,
    pub expected: String,
}

impl ConfigError {
    fn out_of_range<T: std::fmt::Display>(
        field: &'static str,
        value: T,
        range: &std::ops::RangeInclusive<T>,
    ) -> Self {
        Self {
            field,
            value: value.to_string(),
            expected: format!("{}..={}", range.start(), range.end()),
        }
    }
}

/// Whether and how the worker posts notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotificationConfig {
    pub enabled: bool,
    /// Include transfer speed while a download is in progress.
    pub show_speed: bool,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            show_speed: true,
        }
    }
}

/// Unvalidated settings as supplied by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSettings {
    pub connect_timeout_secs: u64,
    pub read_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub max_concurrent_downloads: usize,
    pub notification: NotificationConfig,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: CONNECT_TIMEOUT_SECS,
            read_timeout_secs: READ_TIMEOUT_SECS,
            progress_interval_ms: u64::try_from(PROGRESS_INTERVAL.as_millis()).unwrap_or(1500),
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            notification: NotificationConfig::default(),
        }
    }
}

/// Validated, immutable service configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    connect_timeout: Duration,
    read_timeout: Duration,
    progress_interval: Duration,
    max_concurrent_downloads: usize,
    notification: NotificationConfig,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            progress_interval: PROGRESS_INTERVAL,
            max_concurrent_downloads: DEFAULT_MAX_CONCURRENT_DOWNLOADS,
            notification: NotificationConfig::default(),
        }
    }
}

impl DownloadConfig {
    /// Validates `settings` into a config.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] naming the first field outside its range.
    pub fn from_settings(settings: &DownloadSettings) -> Result<Self, ConfigError> {
        check_range(
            "connect_timeout_secs",
            settings.connect_timeout_secs,
            &TIMEOUT_SECS_RANGE,
        )?;
        check_range(
            "read_timeout_secs",
            settings.read_timeout_secs,
            &TIMEOUT_SECS_RANGE,
        )?;
        check_range(
            "progress_interval_ms",
            settings.progress_interval_ms,
            &PROGRESS_INTERVAL_MS_RANGE,
        )?;
        check_range(
            "max_concurrent_downloads",
            settings.max_concurrent_downloads,
            &MAX_CONCURRENT_RANGE,
        )?;

        Ok(Self {
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
            read_timeout: Duration::from_secs(settings.read_timeout_secs),
            progress_interval: Duration::from_millis(settings.progress_interval_ms),
            max_concurrent_downloads: settings.max_concurrent_downloads,
            notification: settings.notification,
        })
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }

    /// Length of the window transfer speed is measured over.
    #[must_use]
    pub fn progress_interval(&self) -> Duration {
        self.progress_interval
    }

    #[must_use]
    pub fn max_concurrent_downloads(&self) -> usize {
        self.max_concurrent_downloads
    }

    #[must_use]
    pub fn notification(&self) -> NotificationConfig {
        self.notification
    }
}

fn check_range<T>(
    field: &'static str,
    value: T,
    range: &std::ops::RangeInclusive<T>,
) -> Result<(), ConfigError>
where
    T: PartialOrd + Copy + std::fmt::Display,
{
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::out_of_range(field, value, range))
    }
}
