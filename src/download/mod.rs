//! HTTP transfer engine for streaming files to disk.
//!
//! This module downloads one file from an HTTP/HTTPS URL into a temp file
//! beside its destination, resuming partial files with byte ranges.
//!
//! # Features
//!
//! - Streaming transfers (memory-efficient for large files)
//! - `ETag` probing so a changed resource restarts from zero
//! - Range resumption with restart on 416 or redirect
//! - Cooperative cancellation checked on every chunk
//! - Structured error types with full context
//!
//! # Example
//!
//! ```no_run
//! use std::collections::HashMap;
//! use std::path::Path;
//!
//! use resumable_dl::download::{HttpClient, TransferEngine, TransferListener, TransferTarget};
//! use tokio_util::sync::CancellationToken;
//!
//! struct Quiet;
//!
//! #[async_trait::async_trait]
//! impl TransferListener for Quiet {
//!     async fn on_etag_changed(&self, _e_tag: &str) {}
//!     async fn on_start(&self, _total_bytes: u64) {}
//!     async fn on_progress(&self, _downloaded: u64, _total: u64, _speed: f64) {}
//! }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = TransferEngine::new(HttpClient::new()?);
//! let target = TransferTarget {
//!     url: "https://example.com/archive.zip",
//!     dir: Path::new("./downloads"),
//!     file_name: "archive.zip",
//!     known_etag: "",
//! };
//! let total = engine
//!     .download(&target, &mut HashMap::new(), &CancellationToken::new(), &Quiet)
//!     .await?;
//! println!("Downloaded {total} bytes");
//! # Ok(())
//! # }
//! ```

mod client;
pub mod constants;
mod error;
mod filename;
mod transfer;

pub use client::HttpClient;
pub use error::DownloadError;
pub use filename::{file_name_from_url, sanitize_filename};
pub use transfer::{TransferEngine, TransferListener, TransferTarget};
