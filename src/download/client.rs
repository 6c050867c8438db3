//! HTTP client wrapper for transfers.
//!
//! This module provides the `HttpClient` struct: a shared `reqwest` client
//! with connect/read timeouts and helpers that turn the record's header map
//! into request headers.

use std::collections::HashMap;
use std::time::Duration;

use reqwest::Client;
use reqwest::header::{ETAG, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, instrument, warn};

use super::constants::{CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS, USER_AGENT};
use super::error::DownloadError;

/// HTTP client for transfers with streaming support.
///
/// This client is designed to be created once and reused for every
/// transfer, taking advantage of connection pooling.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
}

impl HttpClient {
    /// Creates a client with the default timeouts (30 s connect, 5 min read).
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    pub fn new() -> Result<Self, reqwest::Error> {
        Self::new_with_timeouts(
            Duration::from_secs(CONNECT_TIMEOUT_SECS),
            Duration::from_secs(READ_TIMEOUT_SECS),
        )
    }

    /// Creates a client with explicit timeout values.
    ///
    /// The read timeout bounds each socket read, not the whole transfer,
    /// so large files are not cut off.
    ///
    /// # Errors
    ///
    /// Returns the builder error if the TLS backend cannot be initialized.
    #[instrument(level = "debug")]
    pub fn new_with_timeouts(
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// Probes `url` with a HEAD request and returns its `ETag`.
    ///
    /// A non-success status or a missing header yields an empty tag.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] or [`DownloadError::Timeout`] on
    /// transport failure.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn head_etag(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<String, DownloadError> {
        let response = self
            .client
            .head(url)
            .headers(to_header_map(headers))
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))?;

        if !response.status().is_success() {
            debug!(status = %response.status(), "HEAD probe unsuccessful, treating ETag as empty");
            return Ok(String::new());
        }

        Ok(response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .unwrap_or_default())
    }

    /// Sends a GET for `url` with `headers`.
    ///
    /// The response is returned whatever its status; redirects are
    /// followed and the final URL is available on the response.
    ///
    /// # Errors
    ///
    /// Returns [`DownloadError::Network`] or [`DownloadError::Timeout`] on
    /// transport failure.
    #[instrument(skip(self, headers), fields(url = %url))]
    pub async fn get(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<reqwest::Response, DownloadError> {
        self.client
            .get(url)
            .headers(to_header_map(headers))
            .send()
            .await
            .map_err(|e| DownloadError::network(url, e))
    }
}

/// Converts the stored header map, skipping entries that are not valid HTTP.
fn to_header_map(headers: &HashMap<String, String>) -> HeaderMap {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "Skipping invalid request header"),
        }
    }
    map
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    use crate::test_support::socket_guard::start_mock_server_or_skip;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, ResponseTemplate};

    #[test]
    fn test_to_header_map_skips_invalid_entries() {
        let mut headers = HashMap::new();
        headers.insert("X-Token".to_string(), "abc".to_string());
        headers.insert("bad header".to_string(), "x".to_string());
        headers.insert("X-Line".to_string(), "a\nb".to_string());

        let map = to_header_map(&headers);
        assert_eq!(map.len(), 1);
        assert_eq!(map.get("x-token").unwrap(), "abc");
    }

    #[tokio::test]
    async fn test_head_etag_returns_header_value() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .and(path("/file.bin"))
            .respond_with(ResponseTemplate::new(200).insert_header("ETag", "\"v1\""))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let url = format!("{}/file.bin", mock_server.uri());
        let etag = client.head_etag(&url, &HashMap::new()).await.unwrap();
        assert_eq!(etag, "\"v1\"");
    }

    #[tokio::test]
    async fn test_head_etag_non_success_is_empty() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(405).insert_header("ETag", "\"v1\""))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let url = format!("{}/file.bin", mock_server.uri());
        assert_eq!(client.head_etag(&url, &HashMap::new()).await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_get_sends_stored_headers() {
        let Some(mock_server) = start_mock_server_or_skip().await else {
            return;
        };
        Mock::given(method("GET"))
            .and(header("X-Token", "secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"ok".to_vec()))
            .mount(&mock_server)
            .await;

        let client = HttpClient::new().unwrap();
        let mut headers = HashMap::new();
        headers.insert("X-Token".to_string(), "secret".to_string());
        let url = format!("{}/file.bin", mock_server.uri());

        let response = client.get(&url, &headers).await.unwrap();
        assert_eq!(response.status().as_u16(), 200);
    }

    #[tokio::test]
    async fn test_get_connection_refused_is_network_error() {
        let client = HttpClient::new().unwrap();
        let err = client
            .get("http://127.0.0.1:9/file.bin", &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            DownloadError::Network { .. } | DownloadError::Timeout { .. }
        ));
    }
}
