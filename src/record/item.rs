//! Download record types and lifecycle enums.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use thiserror::Error;

/// Suffix of the sibling file a transfer writes into before the final rename.
pub const TEMP_FILE_SUFFIX: &str = ".part";

/// A persisted column held a value no enum variant maps to.
#[derive(Debug, Clone, Error)]
#[error("invalid {kind} value: {value}")]
pub struct ParseEnumError {
    kind: &'static str,
    value: String,
}

/// Last observed transfer outcome of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DownloadStatus {
    /// Never scheduled.
    Default,
    /// A job is scheduled and waiting to run.
    Queued,
    /// The job is running; no bytes have arrived yet.
    Started,
    /// Bytes are streaming to the temp file.
    InProgress,
    /// Stopped by a pause intent; the temp file is kept.
    Paused,
    /// Stopped by a cancel intent; the temp file is gone.
    Cancelled,
    /// Stopped by an error; resumable, the temp file is kept.
    Failed,
    /// The final file is in place.
    Success,
}

impl DownloadStatus {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Queued => "queued",
            Self::Started => "started",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Cancelled => "cancelled",
            Self::Failed => "failed",
            Self::Success => "success",
        }
    }

    /// True while a job owns the record (scheduled or transferring).
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Queued | Self::Started | Self::InProgress)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for DownloadStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "queued" => Ok(Self::Queued),
            "started" => Ok(Self::Started),
            "in_progress" => Ok(Self::InProgress),
            "paused" => Ok(Self::Paused),
            "cancelled" => Ok(Self::Cancelled),
            "failed" => Ok(Self::Failed),
            "success" => Ok(Self::Success),
            _ => Err(ParseEnumError {
                kind: "status",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for DownloadStatus {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Last user intent applied to a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserAction {
    Default,
    Start,
    Pause,
    Resume,
    Cancel,
    Retry,
}

impl UserAction {
    /// Returns the database string representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Default => "default",
            Self::Start => "start",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Cancel => "cancel",
            Self::Retry => "retry",
        }
    }
}

impl fmt::Display for UserAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for UserAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "default" => Ok(Self::Default),
            "start" => Ok(Self::Start),
            "pause" => Ok(Self::Pause),
            "resume" => Ok(Self::Resume),
            "cancel" => Ok(Self::Cancel),
            "retry" => Ok(Self::Retry),
            _ => Err(ParseEnumError {
                kind: "action",
                value: s.to_string(),
            }),
        }
    }
}

impl TryFrom<String> for UserAction {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// The single persisted entity: one row per download request.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct DownloadRecord {
    /// Stable identifier derived from url, path and file name.
    pub id: i64,
    pub url: String,
    /// Destination directory.
    pub file_path: String,
    pub file_name: String,
    /// Free-text grouping key.
    pub tag: String,
    /// Request headers sent with every attempt.
    #[sqlx(json)]
    pub headers: HashMap<String, String>,
    #[sqlx(try_from = "String")]
    pub status: DownloadStatus,
    #[sqlx(rename = "user_action", try_from = "String")]
    pub action: UserAction,
    pub total_bytes: i64,
    pub downloaded_bytes: i64,
    pub part1_bytes: i64,
    // Reserved for segmented transfers; never written.
    pub part2_bytes: i64,
    pub part3_bytes: i64,
    pub part4_bytes: i64,
    pub part5_bytes: i64,
    /// Bytes per millisecond over the last reporting window.
    pub speed_per_ms: f64,
    /// Last server ETag seen for this URL.
    pub e_tag: String,
    /// Creation time, ms since the Unix epoch.
    pub queue_time: i64,
    /// Last mutation time, ms since the Unix epoch.
    pub modified_time: i64,
    pub failure_reason: String,
    /// Opaque host payload.
    pub metadata: String,
    /// Correlates the record with its scheduled job.
    pub job_uuid: String,
}

impl DownloadRecord {
    /// Whole-percent progress, 0 while the total is unknown.
    #[must_use]
    pub fn progress(&self) -> u8 {
        percent(self.downloaded_bytes, self.total_bytes)
    }

    /// Path of the finished file.
    #[must_use]
    pub fn final_path(&self) -> PathBuf {
        PathBuf::from(&self.file_path).join(&self.file_name)
    }

    /// Path of the in-flight sibling file.
    #[must_use]
    pub fn temp_path(&self) -> PathBuf {
        PathBuf::from(&self.file_path).join(temp_file_name(&self.file_name))
    }
}

impl fmt::Display for DownloadRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "DownloadRecord {{ id: {}, file: {}, status: {}, progress: {}% }}",
            self.id,
            self.file_name,
            self.status,
            self.progress()
        )
    }
}

/// Name of the temp file a transfer of `file_name` writes into.
#[must_use]
pub fn temp_file_name(file_name: &str) -> String {
    format!("{file_name}{TEMP_FILE_SUFFIX}")
}

/// Whole percent of `done` over `total`, clamped to 0..=100.
#[must_use]
pub fn percent(done: i64, total: i64) -> u8 {
    if total <= 0 || done <= 0 {
        return 0;
    }
    let value = (i128::from(done) * 100 / i128::from(total)).clamp(0, 100);
    u8::try_from(value).unwrap_or(100)
}

/// Current wall-clock time in ms since the Unix epoch.
#[must_use]
pub fn unix_millis_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_record(id: i64) -> DownloadRecord {
        DownloadRecord {
            id,
            url: "https://example.com/file.bin".to_string(),
            file_path: "/tmp/downloads".to_string(),
            file_name: "file.bin".to_string(),
            tag: String::new(),
            headers: HashMap::new(),
            status: DownloadStatus::Queued,
            action: UserAction::Start,
            total_bytes: 0,
            downloaded_bytes: 0,
            part1_bytes: 0,
            part2_bytes: 0,
            part3_bytes: 0,
            part4_bytes: 0,
            part5_bytes: 0,
            speed_per_ms: 0.0,
            e_tag: String::new(),
            queue_time: 1_000,
            modified_time: 1_000,
            failure_reason: String::new(),
            metadata: String::new(),
            job_uuid: String::new(),
        }
    }

    #[test]
    fn test_status_string_forms_parse_back() {
        for status in [
            DownloadStatus::Default,
            DownloadStatus::Queued,
            DownloadStatus::Started,
            DownloadStatus::InProgress,
            DownloadStatus::Paused,
            DownloadStatus::Cancelled,
            DownloadStatus::Failed,
            DownloadStatus::Success,
        ] {
            assert_eq!(status.as_str().parse::<DownloadStatus>().unwrap(), status);
        }
    }

    #[test]
    fn test_status_from_str_invalid() {
        let err = "exploded".parse::<DownloadStatus>().unwrap_err();
        assert!(err.to_string().contains("invalid status"));
        assert!(err.to_string().contains("exploded"));
    }

    #[test]
    fn test_action_from_str_invalid() {
        let err = UserAction::try_from("jump".to_string()).unwrap_err();
        assert!(err.to_string().contains("invalid action"));
    }

    #[test]
    fn test_status_is_active() {
        assert!(DownloadStatus::Queued.is_active());
        assert!(DownloadStatus::InProgress.is_active());
        assert!(!DownloadStatus::Paused.is_active());
        assert!(!DownloadStatus::Success.is_active());
    }

    #[test]
    fn test_percent_handles_unknown_total() {
        assert_eq!(percent(500, 0), 0);
        assert_eq!(percent(0, 100), 0);
        assert_eq!(percent(4_000, 10_000), 40);
        assert_eq!(percent(10_000, 10_000), 100);
        assert_eq!(percent(20_000, 10_000), 100);
    }

    #[test]
    fn test_record_paths_are_siblings() {
        let record = sample_record(1);
        assert_eq!(record.final_path(), PathBuf::from("/tmp/downloads/file.bin"));
        assert_eq!(
            record.temp_path(),
            PathBuf::from("/tmp/downloads/file.bin.part")
        );
    }

    #[test]
    fn test_record_display() {
        let mut record = sample_record(42);
        record.total_bytes = 200;
        record.downloaded_bytes = 50;
        let display = record.to_string();
        assert!(display.contains("42"));
        assert!(display.contains("queued"));
        assert!(display.contains("25%"));
    }
}
