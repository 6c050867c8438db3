//! Error types for the download manager.

use thiserror::Error;

use crate::db::DbError;
use crate::record::StoreError;
use crate::request::RequestError;

/// Errors surfaced by [`DownloadManager`](super::DownloadManager).
///
/// Transfer failures never appear here; they are recorded on the download
/// record by the worker.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// The request could not be built.
    #[error(transparent)]
    Request(#[from] RequestError),

    /// A record read failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// The database could not be opened.
    #[error(transparent)]
    Database(#[from] DbError),

    /// The HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[source] reqwest::Error),

    /// The manager has shut down and accepts no more intents.
    #[error("download manager has shut down")]
    Closed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_message() {
        assert!(ManagerError::Closed.to_string().contains("shut down"));
    }

    #[test]
    fn test_store_error_is_transparent() {
        let err = ManagerError::from(StoreError::RecordNotFound(3));
        assert!(err.to_string().contains("not found"));
        assert!(err.to_string().contains('3'));
    }
}
