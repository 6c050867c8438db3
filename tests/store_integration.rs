//! Integration tests for the record store.
//!
//! These tests verify `RecordStore` operations against a real `SQLite` file.

use std::collections::HashMap;
use std::time::Duration;

use futures_util::StreamExt;
use resumable_dl::{
    Database, DownloadRecord, DownloadRequest, DownloadStatus, RecordStore, StoreError, UserAction,
};
use tempfile::TempDir;

/// Helper to create a test database with migrations applied.
async fn setup_test_db() -> (Database, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("test.db");

    let db = Database::new(&db_path)
        .await
        .expect("Failed to create database");

    (db, temp_dir)
}

fn record(url: &str, tag: &str, queue_time: i64) -> DownloadRecord {
    let request = DownloadRequest::new(url, "/downloads").expect("valid request");
    DownloadRecord {
        id: request.id(),
        url: url.to_string(),
        file_path: request.path().to_string(),
        file_name: request.file_name().to_string(),
        tag: tag.to_string(),
        headers: HashMap::from([("User-Agent".to_string(), "test".to_string())]),
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
        queue_time,
        modified_time: queue_time,
        failure_reason: String::new(),
        metadata: String::new(),
        job_uuid: "job".to_string(),
    }
}

// ==================== Persistence ====================

#[tokio::test]
async fn test_records_survive_reopen() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db_path = temp_dir.path().join("persist.db");
    let original = record("https://example.com/a.bin", "t", 1_000);

    {
        let db = Database::new(&db_path).await.expect("open");
        RecordStore::new(db.clone())
            .insert(&original)
            .await
            .expect("insert");
        db.close().await;
    }

    let db = Database::new(&db_path).await.expect("reopen");
    let loaded = RecordStore::new(db)
        .get(original.id)
        .await
        .expect("get")
        .expect("record persisted");
    assert_eq!(loaded, original);
}

#[tokio::test]
async fn test_file_database_uses_wal() {
    let (db, _temp_dir) = setup_test_db().await;
    assert!(db.is_wal_enabled().await.expect("pragma"));
}

// ==================== Listing ====================

#[tokio::test]
async fn test_list_orders_by_creation_and_filters_by_tag() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = RecordStore::new(db);
    let late = record("https://example.com/late.bin", "album", 3_000);
    let early = record("https://example.com/early.bin", "album", 1_000);
    let other = record("https://example.com/other.bin", "podcast", 2_000);
    for r in [&late, &early, &other] {
        store.insert(r).await.expect("insert");
    }

    let all: Vec<i64> = store
        .list_all()
        .await
        .expect("list")
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(all, vec![early.id, other.id, late.id]);

    let album: Vec<i64> = store
        .list_by_tag("album")
        .await
        .expect("list")
        .iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(album, vec![early.id, late.id]);
    assert!(store.list_by_tag("none").await.expect("list").is_empty());
}

#[tokio::test]
async fn test_delete_and_delete_all() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = RecordStore::new(db);
    let a = record("https://example.com/a.bin", "", 1);
    let b = record("https://example.com/b.bin", "", 2);
    store.insert(&a).await.expect("insert");
    store.insert(&b).await.expect("insert");

    store.delete(a.id).await.expect("delete");
    assert!(matches!(
        store.delete(a.id).await,
        Err(StoreError::RecordNotFound(id)) if id == a.id
    ));

    assert_eq!(store.delete_all().await.expect("delete all"), 1);
    assert!(store.list_all().await.expect("list").is_empty());
}

// ==================== Concurrency ====================

#[tokio::test]
async fn test_concurrent_modify_from_clones_loses_no_update() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = RecordStore::new(db);
    let r = record("https://example.com/a.bin", "", 1);
    store.insert(&r).await.expect("insert");

    let mut handles = Vec::new();
    for _ in 0..25 {
        let store = store.clone();
        let id = r.id;
        handles.push(tokio::spawn(async move {
            store
                .modify(id, |record| record.downloaded_bytes += 1)
                .await
                .expect("modify");
        }));
    }
    for handle in handles {
        handle.await.expect("join");
    }

    let loaded = store.get(r.id).await.expect("get").expect("exists");
    assert_eq!(loaded.downloaded_bytes, 25);
}

// ==================== Observation ====================

#[tokio::test]
async fn test_observe_tag_tracks_inserts_updates_and_deletes() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = RecordStore::new(db);
    let mut updates = store.observe_tag("album");

    let first = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("initial snapshot")
        .expect("stream open");
    assert!(first.is_empty());

    let r = record("https://example.com/a.bin", "album", 1);
    store.insert(&r).await.expect("insert");
    let after_insert = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("insert snapshot")
        .expect("stream open");
    assert_eq!(after_insert.len(), 1);

    store
        .modify(r.id, |record| record.status = DownloadStatus::InProgress)
        .await
        .expect("modify");
    let after_modify = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("modify snapshot")
        .expect("stream open");
    assert_eq!(after_modify[0].status, DownloadStatus::InProgress);

    store.delete(r.id).await.expect("delete");
    let after_delete = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("delete snapshot")
        .expect("stream open");
    assert!(after_delete.is_empty());
}

#[tokio::test]
async fn test_observe_id_yields_none_then_record() {
    let (db, _temp_dir) = setup_test_db().await;
    let store = RecordStore::new(db);
    let r = record("https://example.com/a.bin", "", 1);
    let mut updates = store.observe_id(r.id);

    assert_eq!(updates.next().await, Some(None));

    store.insert(&r).await.expect("insert");
    let next = tokio::time::timeout(Duration::from_secs(5), updates.next())
        .await
        .expect("snapshot")
        .expect("stream open");
    assert_eq!(next.map(|record| record.id), Some(r.id));
}
