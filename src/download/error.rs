//! Error types for the download module.
//!
//! Every variant carries the URL or path it concerns so the worker can
//! persist a self-explanatory failure reason.

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur during a transfer.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Network-level error (DNS resolution, connection refused, TLS, reset mid-body).
    #[error("network error downloading {url}: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// Request timed out before completion.
    #[error("timeout downloading {url}")]
    Timeout { url: String },

    /// Non-success HTTP response.
    #[error("HTTP {status} {reason} downloading {url}")]
    HttpStatus {
        url: String,
        status: u16,
        /// Canonical reason phrase, empty when the code has none.
        reason: String,
    },

    /// File system error while preparing or writing the temp file.
    #[error("IO error writing to {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The provided URL is malformed or invalid.
    #[error("invalid URL: {url}")]
    InvalidUrl { url: String },

    /// The response did not declare a body length.
    #[error("server did not report a content length for {url}")]
    MissingContentLength { url: String },

    /// The finished temp file could not be moved into place.
    #[error("failed to rename {from} to {to}: {source}")]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The transfer observed its cancellation token.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Creates a network error from a reqwest error, promoting timeouts.
    pub fn network(url: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            return Self::timeout(url);
        }
        Self::Network {
            url: url.into(),
            source,
        }
    }

    /// Creates an HTTP status error with the status's reason phrase.
    pub fn http_status(url: impl Into<String>, status: reqwest::StatusCode) -> Self {
        Self::HttpStatus {
            url: url.into(),
            status: status.as_u16(),
            reason: status.canonical_reason().unwrap_or_default().to_string(),
        }
    }

    /// Creates a timeout error.
    pub fn timeout(url: impl Into<String>) -> Self {
        Self::Timeout { url: url.into() }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates an invalid URL error.
    pub fn invalid_url(url: impl Into<String>) -> Self {
        Self::InvalidUrl { url: url.into() }
    }

    /// Creates a missing content length error.
    pub fn missing_content_length(url: impl Into<String>) -> Self {
        Self::MissingContentLength { url: url.into() }
    }

    /// Creates a rename error.
    pub fn rename(from: impl Into<PathBuf>, to: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Rename {
            from: from.into(),
            to: to.into(),
            source,
        }
    }

    /// True when the transfer stopped because it was cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_download_error_timeout_display() {
        let error = DownloadError::timeout("https://example.com/file.zip");
        assert!(error.to_string().contains("timeout"));
        assert!(error.to_string().contains("https://example.com/file.zip"));
    }

    #[test]
    fn test_download_error_http_status_display() {
        let error = DownloadError::http_status(
            "https://example.com/file.zip",
            reqwest::StatusCode::NOT_FOUND,
        );
        let msg = error.to_string();
        assert!(msg.contains("404"), "Expected '404' in: {msg}");
        assert!(msg.contains("Not Found"), "Expected reason in: {msg}");
        assert!(msg.contains("https://example.com/file.zip"));
    }

    #[test]
    fn test_download_error_io_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "access denied");
        let error = DownloadError::io(PathBuf::from("/tmp/test.part"), io_error);
        assert!(error.to_string().contains("/tmp/test.part"));
    }

    #[test]
    fn test_download_error_rename_display() {
        let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let error = DownloadError::rename("/tmp/a.part", "/tmp/a", io_error);
        let msg = error.to_string();
        assert!(msg.contains("/tmp/a.part"));
        assert!(msg.contains("gone"));
    }

    #[test]
    fn test_download_error_missing_content_length_display() {
        let error = DownloadError::missing_content_length("https://example.com/stream");
        assert!(error.to_string().contains("content length"));
    }

    #[test]
    fn test_only_cancelled_is_cancelled() {
        assert!(DownloadError::Cancelled.is_cancelled());
        assert!(!DownloadError::invalid_url("x").is_cancelled());
    }
}
