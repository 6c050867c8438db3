//! Filename derivation and sanitization for download destinations.

use std::fmt::Write as _;
use std::path::{Component, Path};

use sha2::{Digest, Sha256};
use tracing::debug;
use url::Url;

/// Sanitizes a filename for filesystem safety.
///
/// Replaces characters that are invalid on common filesystems
/// (`/ \ : * ? " < > |` and control characters). Dot-only names are
/// rewritten so the result can never walk out of the destination directory.
#[must_use]
pub fn sanitize_filename(name: &str) -> String {
    let sanitized: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();

    if sanitized.is_empty() {
        return "_".to_string();
    }

    if is_safe_filename_segment(&sanitized) {
        sanitized
    } else {
        sanitized
            .chars()
            .map(|c| if c == '.' { '_' } else { c })
            .collect()
    }
}

fn is_safe_filename_segment(name: &str) -> bool {
    !Path::new(name).components().any(|component| {
        matches!(
            component,
            Component::CurDir | Component::ParentDir | Component::RootDir | Component::Prefix(_)
        )
    })
}

/// Filename for a download request that did not name one.
///
/// Uses the URL's last path segment, percent-decoded and sanitized, or
/// `download_<hash>.bin` when the path has no usable segment. The fallback
/// depends only on the URL, so repeated requests map to the same record.
#[must_use]
pub fn file_name_from_url(url: &Url) -> String {
    if let Some(mut segments) = url.path_segments()
        && let Some(last) = segments.next_back()
        && !last.is_empty()
    {
        let decoded = urlencoding::decode(last).unwrap_or_else(|e| {
            debug!(segment = %last, error = %e, "URL decoding failed, using raw segment");
            last.into()
        });
        return sanitize_filename(&decoded);
    }

    let digest = Sha256::digest(url.as_str().as_bytes());
    let mut name = String::from("download_");
    for byte in &digest[..6] {
        let _ = write!(name, "{byte:02x}");
    }
    name.push_str(".bin");
    name
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_filename_removes_invalid_chars() {
        assert_eq!(sanitize_filename("file/name.mp3"), "file_name.mp3");
        assert_eq!(sanitize_filename("file\\name.mp3"), "file_name.mp3");
        assert_eq!(sanitize_filename("file:name.mp3"), "file_name.mp3");
        assert_eq!(sanitize_filename("file<name>.mp3"), "file_name_.mp3");
        assert_eq!(sanitize_filename("file|name.mp3"), "file_name.mp3");
    }

    #[test]
    fn test_sanitize_filename_rewrites_dot_segments() {
        assert_eq!(sanitize_filename("."), "_");
        assert_eq!(sanitize_filename(".."), "__");
        assert_eq!(sanitize_filename(""), "_");
    }

    #[test]
    fn test_sanitize_filename_preserves_valid_chars() {
        assert_eq!(sanitize_filename("track (1).flac"), "track (1).flac");
        assert_eq!(sanitize_filename("日本語.zip"), "日本語.zip");
    }

    #[test]
    fn test_file_name_from_url_decodes_last_segment() {
        let url = Url::parse("https://cdn.example.com/media/My%20Song.mp3?sig=abc").unwrap();
        assert_eq!(file_name_from_url(&url), "My Song.mp3");
    }

    #[test]
    fn test_file_name_from_url_sanitizes_encoded_separators() {
        let url = Url::parse("https://example.com/a%2Fb.bin").unwrap();
        assert_eq!(file_name_from_url(&url), "a_b.bin");
    }

    #[test]
    fn test_file_name_from_url_fallback_is_deterministic() {
        let url = Url::parse("https://example.com/").unwrap();
        let name = file_name_from_url(&url);
        assert!(name.starts_with("download_"));
        assert!(name.ends_with(".bin"));
        assert_eq!(name.len(), "download_".len() + 12 + ".bin".len());
        assert_eq!(file_name_from_url(&url), name);

        let dir = Url::parse("https://example.com/dir/").unwrap();
        assert_ne!(file_name_from_url(&dir), name);
    }
}
