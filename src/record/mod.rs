//! Persisted download records.
//!
//! One `SQLite` row per download request, keyed by the stable id derived
//! from `(url, path, file name)`. The store is the only place records are
//! read or written:
//! - [`RecordStore`] - CRUD, per-id single-writer `modify`, live observation
//! - [`DownloadRecord`] - the persisted entity
//! - [`DownloadStatus`] / [`UserAction`] - lifecycle state and last intent
//! - [`StoreError`] - operation error types
//!
//! # Example
//!
//! ```ignore
//! use resumable_dl::{Database, RecordStore};
//!
//! let store = RecordStore::new(Database::new_in_memory().await?);
//! let mut updates = store.observe_all();
//! store.modify(id, |record| record.tag = "music".to_string()).await?;
//! let snapshot = updates.next().await;
//! ```

mod error;
mod item;

pub use error::{StoreDbErrorKind, StoreError};
pub use item::{
    DownloadRecord, DownloadStatus, ParseEnumError, TEMP_FILE_SUFFIX, UserAction, percent,
    temp_file_name, unix_millis_now,
};

#[cfg(test)]
pub(crate) use item::tests::sample_record;

use std::sync::Arc;

use dashmap::DashMap;
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;
use tokio::sync::{Mutex, watch};
use tracing::{debug, instrument, warn};

use crate::db::Database;

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Returns `Ok(())` if at least one row was affected; otherwise [`StoreError::RecordNotFound`].
fn check_affected(id: i64, rows_affected: u64) -> Result<()> {
    if rows_affected == 0 {
        Err(StoreError::RecordNotFound(id))
    } else {
        Ok(())
    }
}

const INSERT_SQL: &str = r"INSERT INTO downloads (
        url, file_path, file_name, tag, headers, status, user_action,
        total_bytes, downloaded_bytes,
        part1_bytes, part2_bytes, part3_bytes, part4_bytes, part5_bytes,
        speed_per_ms, e_tag, queue_time, modified_time,
        failure_reason, metadata, job_uuid, id
      )
      VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)";

const UPDATE_SQL: &str = r"UPDATE downloads SET
        url = ?, file_path = ?, file_name = ?, tag = ?, headers = ?,
        status = ?, user_action = ?,
        total_bytes = ?, downloaded_bytes = ?,
        part1_bytes = ?, part2_bytes = ?, part3_bytes = ?, part4_bytes = ?, part5_bytes = ?,
        speed_per_ms = ?, e_tag = ?, queue_time = ?, modified_time = ?,
        failure_reason = ?, metadata = ?, job_uuid = ?
      WHERE id = ?";

/// Binds every column except `id` in declaration order, then `id` last.
fn bind_record<'q>(
    query: Query<'q, Sqlite, SqliteArguments<'q>>,
    record: &'q DownloadRecord,
    headers_json: String,
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
    query
        .bind(&record.url)
        .bind(&record.file_path)
        .bind(&record.file_name)
        .bind(&record.tag)
        .bind(headers_json)
        .bind(record.status.as_str())
        .bind(record.action.as_str())
        .bind(record.total_bytes)
        .bind(record.downloaded_bytes)
        .bind(record.part1_bytes)
        .bind(record.part2_bytes)
        .bind(record.part3_bytes)
        .bind(record.part4_bytes)
        .bind(record.part5_bytes)
        .bind(record.speed_per_ms)
        .bind(&record.e_tag)
        .bind(record.queue_time)
        .bind(record.modified_time)
        .bind(&record.failure_reason)
        .bind(&record.metadata)
        .bind(&record.job_uuid)
        .bind(record.id)
}

fn encode_headers(record: &DownloadRecord) -> Result<String> {
    serde_json::to_string(&record.headers).map_err(|e| StoreError::Headers {
        id: record.id,
        message: e.to_string(),
    })
}

/// Which records an observation stream follows.
#[derive(Debug, Clone)]
enum Scope {
    All,
    Tag(String),
    Id(i64),
}

/// SQLite-backed store of download records.
///
/// Cloning is cheap; clones share the pool, the per-id write locks and the
/// change signal, so a mutation through any clone wakes every observer.
#[derive(Debug, Clone)]
pub struct RecordStore {
    db: Database,
    write_locks: Arc<DashMap<i64, Arc<Mutex<()>>>>,
    changes: Arc<watch::Sender<u64>>,
}

impl RecordStore {
    /// Creates a record store over the given database.
    #[must_use]
    pub fn new(db: Database) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            db,
            write_locks: Arc::new(DashMap::new()),
            changes: Arc::new(changes),
        }
    }

    fn notify_changed(&self) {
        self.changes.send_modify(|version| *version = version.wrapping_add(1));
    }

    fn write_lock(&self, id: i64) -> Arc<Mutex<()>> {
        self.write_locks.entry(id).or_default().clone()
    }

    /// Fetches one record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query or row decoding fails.
    #[instrument(skip(self))]
    pub async fn get(&self, id: i64) -> Result<Option<DownloadRecord>> {
        let record = sqlx::query_as::<_, DownloadRecord>("SELECT * FROM downloads WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(record)
    }

    /// Inserts a new record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::AlreadyExists`] if the id is taken, and
    /// [`StoreError::Database`] for other failures.
    #[instrument(skip(self, record), fields(id = record.id, url = %record.url))]
    pub async fn insert(&self, record: &DownloadRecord) -> Result<()> {
        let lock = self.write_lock(record.id);
        let _guard = lock.lock().await;

        let headers = encode_headers(record)?;
        bind_record(sqlx::query(INSERT_SQL), record, headers)
            .execute(self.db.pool())
            .await
            .map_err(|e| StoreError::from(e).on_insert(record.id))?;

        debug!("record inserted");
        self.notify_changed();
        Ok(())
    }

    /// Replaces every column of an existing record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    #[instrument(skip(self, record), fields(id = record.id, status = %record.status))]
    pub async fn update(&self, record: &DownloadRecord) -> Result<()> {
        let lock = self.write_lock(record.id);
        let _guard = lock.lock().await;
        self.write_update(record).await?;
        self.notify_changed();
        Ok(())
    }

    async fn write_update(&self, record: &DownloadRecord) -> Result<()> {
        let headers = encode_headers(record)?;
        let result = bind_record(sqlx::query(UPDATE_SQL), record, headers)
            .execute(self.db.pool())
            .await?;
        check_affected(record.id, result.rows_affected())
    }

    /// Read-modify-write of one record under its write lock.
    ///
    /// `modified_time` is stamped after `apply` runs. Returns the stored
    /// record, or `None` when no record has this id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the read or write fails.
    #[instrument(skip(self, apply))]
    pub async fn modify<F>(&self, id: i64, apply: F) -> Result<Option<DownloadRecord>>
    where
        F: FnOnce(&mut DownloadRecord) + Send,
    {
        let lock = self.write_lock(id);
        let _guard = lock.lock().await;

        let Some(mut record) = self.get(id).await? else {
            return Ok(None);
        };
        apply(&mut record);
        record.modified_time = unix_millis_now();

        match self.write_update(&record).await {
            Ok(()) => {}
            // Deleted between read and write.
            Err(StoreError::RecordNotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        }
        self.notify_changed();
        Ok(Some(record))
    }

    /// Deletes one record.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::RecordNotFound`] if no record has this id.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: i64) -> Result<()> {
        let lock = self.write_lock(id);
        {
            let _guard = lock.lock().await;
            let result = sqlx::query("DELETE FROM downloads WHERE id = ?")
                .bind(id)
                .execute(self.db.pool())
                .await?;
            check_affected(id, result.rows_affected())?;
        }
        self.write_locks.remove(&id);
        self.notify_changed();
        Ok(())
    }

    /// Deletes every record, returning how many were removed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the delete fails.
    #[instrument(skip(self))]
    pub async fn delete_all(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM downloads")
            .execute(self.db.pool())
            .await?;
        self.write_locks.clear();
        self.notify_changed();
        Ok(result.rows_affected())
    }

    /// Lists every record ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_all(&self) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            "SELECT * FROM downloads ORDER BY queue_time ASC, id ASC",
        )
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }

    /// Lists records sharing `tag`, ordered by creation time.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] if the query fails.
    #[instrument(skip(self))]
    pub async fn list_by_tag(&self, tag: &str) -> Result<Vec<DownloadRecord>> {
        let records = sqlx::query_as::<_, DownloadRecord>(
            "SELECT * FROM downloads WHERE tag = ? ORDER BY queue_time ASC, id ASC",
        )
        .bind(tag)
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }

    async fn query_scope(&self, scope: &Scope) -> Result<Vec<DownloadRecord>> {
        match scope {
            Scope::All => self.list_all().await,
            Scope::Tag(tag) => self.list_by_tag(tag).await,
            Scope::Id(id) => Ok(self.get(*id).await?.into_iter().collect()),
        }
    }

    /// Live snapshots of every record.
    ///
    /// Yields the current snapshot immediately, then a new one after each
    /// mutation that changed the result. Slow consumers see the latest
    /// snapshot, not every intermediate one.
    #[must_use]
    pub fn observe_all(&self) -> BoxStream<'static, Vec<DownloadRecord>> {
        self.observe(Scope::All)
    }

    /// Live snapshots of the records sharing `tag`.
    #[must_use]
    pub fn observe_tag(&self, tag: &str) -> BoxStream<'static, Vec<DownloadRecord>> {
        self.observe(Scope::Tag(tag.to_string()))
    }

    /// Live snapshots of one record; `None` while it does not exist.
    #[must_use]
    pub fn observe_id(&self, id: i64) -> BoxStream<'static, Option<DownloadRecord>> {
        self.observe(Scope::Id(id))
            .map(|records| records.into_iter().next())
            .boxed()
    }

    fn observe(&self, scope: Scope) -> BoxStream<'static, Vec<DownloadRecord>> {
        let state = Observer {
            store: self.clone(),
            changes: self.changes.subscribe(),
            scope,
            last: None,
        };

        stream::unfold(state, |mut state| async move {
            loop {
                if state.last.is_some() && state.changes.changed().await.is_err() {
                    return None;
                }

                match state.store.query_scope(&state.scope).await {
                    Ok(records) if state.last.as_ref() != Some(&records) => {
                        state.last = Some(records.clone());
                        return Some((records, state));
                    }
                    Ok(_) => {}
                    Err(error) => {
                        warn!(scope = ?state.scope, error = %error, "Failed to refresh observed records");
                        if state.last.is_none() {
                            state.last = Some(Vec::new());
                            return Some((Vec::new(), state));
                        }
                    }
                }
            }
        })
        .boxed()
    }
}

struct Observer {
    store: RecordStore,
    changes: watch::Receiver<u64>,
    scope: Scope,
    last: Option<Vec<DownloadRecord>>,
}
