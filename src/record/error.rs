//! Error types for record store operations.

use std::fmt;

use thiserror::Error;

/// How a database failure should be treated by callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreDbErrorKind {
    /// `SQLite` stayed busy or locked past the busy timeout; retrying may help.
    BusyOrLocked,
    /// A primary key, check or not-null constraint rejected the write.
    ConstraintViolation,
    /// Anything else.
    Other,
}

impl StoreDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        let sqlx::Error::Database(database_error) = error else {
            return Self::Other;
        };

        let code = database_error.code();
        let code = code.as_deref().unwrap_or_default();
        // Primary result codes 5 and 6, possibly extended.
        if code.starts_with("SQLITE_BUSY")
            || code.starts_with("SQLITE_LOCKED")
            || matches!(code, "5" | "6")
        {
            return Self::BusyOrLocked;
        }
        if database_error.is_unique_violation()
            || database_error.is_check_violation()
            || code.starts_with("SQLITE_CONSTRAINT")
        {
            return Self::ConstraintViolation;
        }
        Self::Other
    }
}

impl fmt::Display for StoreDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::Other => "other",
        })
    }
}

/// Errors that can occur during record store operations.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error ({kind}): {message}")]
    Database {
        kind: StoreDbErrorKind,
        message: String,
    },

    #[error(
        "download record not found: id {0}\n  Suggestion: The record may have been cleared or the ID is incorrect"
    )]
    RecordNotFound(i64),

    #[error("download record already exists: id {0}")]
    AlreadyExists(i64),

    /// Request headers could not be serialized for storage.
    #[error("failed to encode headers for record {id}: {message}")]
    Headers { id: i64, message: String },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: StoreDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl StoreError {
    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        matches!(
            self,
            Self::Database {
                kind: StoreDbErrorKind::BusyOrLocked,
                ..
            }
        )
    }

    /// Maps a constraint failure on insert of `id` to [`Self::AlreadyExists`].
    pub(crate) fn on_insert(self, id: i64) -> Self {
        match self {
            Self::Database {
                kind: StoreDbErrorKind::ConstraintViolation,
                ..
            } => Self::AlreadyExists(id),
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_busy_flag() {
        let err = StoreError::Database {
            kind: StoreDbErrorKind::BusyOrLocked,
            message: "database is locked".to_string(),
        };
        assert!(err.is_busy_or_locked());
        assert!(err.to_string().contains("busy_or_locked"));
        assert!(!StoreError::RecordNotFound(1).is_busy_or_locked());
    }

    #[test]
    fn test_constraint_violation_on_insert_is_already_exists() {
        let err = StoreError::Database {
            kind: StoreDbErrorKind::ConstraintViolation,
            message: "UNIQUE constraint failed".to_string(),
        };
        assert!(matches!(err.on_insert(3), StoreError::AlreadyExists(3)));

        let other = StoreError::Database {
            kind: StoreDbErrorKind::Other,
            message: "disk I/O error".to_string(),
        };
        assert!(matches!(other.on_insert(3), StoreError::Database { .. }));
    }

    #[test]
    fn test_store_error_not_found_message() {
        let msg = StoreError::RecordNotFound(42).to_string();
        assert!(msg.contains("42"));
        assert!(msg.contains("Suggestion"));
    }

    #[test]
    fn test_non_database_errors_classify_as_other() {
        assert_eq!(
            StoreDbErrorKind::from_sqlx(&sqlx::Error::PoolClosed),
            StoreDbErrorKind::Other
        );
    }
}
