//! Download requests and their stable ids.

use std::collections::HashMap;
use std::path::Path;

use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::download::{file_name_from_url, sanitize_filename};
use crate::record::{DownloadRecord, DownloadStatus, UserAction};

/// A download request could not be built.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    #[error("unsupported URL scheme '{scheme}' in {url}\n  Suggestion: Only http and https URLs can be downloaded")]
    UnsupportedScheme { url: String, scheme: String },

    #[error("destination directory must not be empty")]
    EmptyPath,
}

/// Stable id for the `(url, path, file_name)` triple.
///
/// The first eight bytes of the SHA-256 of the NUL-separated fields,
/// big-endian, with the sign bit cleared so ids are never negative.
#[must_use]
pub fn download_id(url: &str, path: &str, file_name: &str) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(url.as_bytes());
    hasher.update([0]);
    hasher.update(path.as_bytes());
    hasher.update([0]);
    hasher.update(file_name.as_bytes());
    let digest = hasher.finalize();

    let mut bytes = [0_u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(bytes) & i64::MAX
}

/// What to download and where to put it.
///
/// # Example
///
/// ```
/// use resumable_dl::DownloadRequest;
///
/// let request = DownloadRequest::new("https://example.com/album/01%20Intro.mp3", "/music")
///     .unwrap()
///     .tag("album-42")
///     .header("Authorization", "Bearer token");
/// assert_eq!(request.file_name(), "01 Intro.mp3");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    url: String,
    path: String,
    file_name: String,
    tag: String,
    headers: HashMap<String, String>,
    metadata: String,
}

impl DownloadRequest {
    /// Creates a request for `url` saved under directory `path`.
    ///
    /// The file name defaults to the URL's last path segment.
    ///
    /// # Errors
    ///
    /// Returns [`RequestError`] for unparsable or non-HTTP URLs and for an
    /// empty destination.
    pub fn new(url: &str, path: impl AsRef<Path>) -> Result<Self, RequestError> {
        let parsed = Url::parse(url).map_err(|_| RequestError::InvalidUrl {
            url: url.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(RequestError::UnsupportedScheme {
                url: url.to_string(),
                scheme: parsed.scheme().to_string(),
            });
        }

        let path = path.as_ref().to_string_lossy().into_owned();
        if path.is_empty() {
            return Err(RequestError::EmptyPath);
        }

        Ok(Self {
            url: url.to_string(),
            path,
            file_name: file_name_from_url(&parsed),
            tag: String::new(),
            headers: HashMap::new(),
            metadata: String::new(),
        })
    }

    /// Overrides the derived file name; blank names keep the derived one.
    #[must_use]
    pub fn with_file_name(mut self, file_name: &str) -> Self {
        if !file_name.trim().is_empty() {
            self.file_name = sanitize_filename(file_name.trim());
        }
        self
    }

    #[must_use]
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = tag.into();
        self
    }

    /// Adds a request header sent with every attempt.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers.extend(headers);
        self
    }

    /// Opaque payload stored alongside the record.
    #[must_use]
    pub fn metadata(mut self, metadata: impl Into<String>) -> Self {
        self.metadata = metadata.into();
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[must_use]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[must_use]
    pub fn tag_name(&self) -> &str {
        &self.tag
    }

    /// Id the record for this request is stored under.
    #[must_use]
    pub fn id(&self) -> i64 {
        download_id(&self.url, &self.path, &self.file_name)
    }

    /// Rebuilds the request a stored record was created from.
    #[must_use]
    pub fn from_record(record: &DownloadRecord) -> Self {
        Self {
            url: record.url.clone(),
            path: record.file_path.clone(),
            file_name: record.file_name.clone(),
            tag: record.tag.clone(),
            headers: record.headers.clone(),
            metadata: record.metadata.clone(),
        }
    }

    /// Fresh record for this request, queued for its first start.
    pub(crate) fn to_record(&self, now_ms: i64, job_uuid: String) -> DownloadRecord {
        DownloadRecord {
            id: self.id(),
            url: self.url.clone(),
            file_path: self.path.clone(),
            file_name: self.file_name.clone(),
            tag: self.tag.clone(),
            headers: self.headers.clone(),
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
            queue_time: now_ms,
            modified_time: now_ms,
            failure_reason: String::new(),
            metadata: self.metadata.clone(),
            job_uuid,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_download_id_is_stable_and_non_negative() {
        let a = download_id("https://example.com/a.bin", "/data", "a.bin");
        let b = download_id("https://example.com/a.bin", "/data", "a.bin");
        assert_eq!(a, b);
        assert!(a >= 0);
    }

    #[test]
    fn test_download_id_separates_fields() {
        // Without a separator these two triples would hash the same bytes.
        let a = download_id("https://example.com/ab", "/c", "d");
        let b = download_id("https://example.com/a", "b/c", "d");
        assert_ne!(a, b);
        assert_ne!(
            download_id("https://example.com/a.bin", "/data", "a.bin"),
            download_id("https://example.com/a.bin", "/data", "b.bin")
        );
    }

    #[test]
    fn test_identical_requests_share_id() {
        let first = DownloadRequest::new("https://example.com/a.bin", "/data").unwrap();
        let second = DownloadRequest::new("https://example.com/a.bin", "/data")
            .unwrap()
            .tag("other-tag")
            .header("X-Token", "1");
        assert_eq!(first.id(), second.id());
    }

    #[test]
    fn test_requests_without_file_segment_share_id() {
        let a = DownloadRequest::new("https://example.com/", "/data").unwrap();
        std::thread::sleep(std::time::Duration::from_millis(1_100));
        let b = DownloadRequest::new("https://example.com/", "/data").unwrap();
        assert_eq!(a.file_name(), b.file_name());
        assert_eq!(a.id(), b.id());
    }

    #[test]
    fn test_request_rejects_bad_urls() {
        assert!(matches!(
            DownloadRequest::new("not a url", "/data"),
            Err(RequestError::InvalidUrl { .. })
        ));
        assert!(matches!(
            DownloadRequest::new("ftp://example.com/a.bin", "/data"),
            Err(RequestError::UnsupportedScheme { .. })
        ));
        assert_eq!(
            DownloadRequest::new("https://example.com/a.bin", ""),
            Err(RequestError::EmptyPath)
        );
    }

    #[test]
    fn test_with_file_name_sanitizes_and_ignores_blank() {
        let request = DownloadRequest::new("https://example.com/a.bin", "/data")
            .unwrap()
            .with_file_name("../evil.bin");
        assert_eq!(request.file_name(), ".._evil.bin");

        let request = DownloadRequest::new("https://example.com/a.bin", "/data")
            .unwrap()
            .with_file_name("  ");
        assert_eq!(request.file_name(), "a.bin");
    }

    #[test]
    fn test_to_record_starts_queued() {
        let request = DownloadRequest::new("https://example.com/a.bin", "/data")
            .unwrap()
            .tag("t")
            .metadata("{}");
        let record = request.to_record(5_000, "job".to_string());
        assert_eq!(record.id, request.id());
        assert_eq!(record.status, DownloadStatus::Queued);
        assert_eq!(record.action, UserAction::Start);
        assert_eq!(record.queue_time, 5_000);
        assert_eq!(record.tag, "t");
        assert_eq!(DownloadRequest::from_record(&record), request);
    }
}
