//! Shared fixtures for unit tests.

use crate::db_migration::run_migrations;
use crate::domains::core::file_storage_service::{
    detect_file_meta, FileStorageError, FileStorageResult, FileStorageService, StoredFile, UploadFile,
};
use crate::domains::core::retry::Clock;
use crate::engine::open_pool;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

/// In-memory database with every migration applied. One connection, so
/// every query sees the same database.
pub async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .unwrap()
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .unwrap();
    run_migrations(&pool).await.unwrap();
    pool
}

/// File-backed database under `dir`, opened the way the engine opens it
/// (several connections, busy timeout).
pub async fn file_pool(dir: &tempfile::TempDir) -> SqlitePool {
    let url = format!("sqlite://{}", dir.path().join("documents.sqlite").display());
    open_pool(&url).await.unwrap()
}

/// Host table used by tests: `cover` holds one document id, `attachments` a JSON array.
pub async fn create_notes_table(pool: &SqlitePool) {
    sqlx::query(
        "CREATE TABLE notes (
            id TEXT PRIMARY KEY NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            cover TEXT,
            attachments TEXT NOT NULL DEFAULT '[]'
        )",
    )
    .execute(pool)
    .await
    .unwrap();
}

pub async fn insert_note(pool: &SqlitePool, id: Uuid, cover: Option<Uuid>, attachments: &[Uuid]) {
    let attachments: Vec<String> = attachments.iter().map(|a| a.to_string()).collect();
    sqlx::query("INSERT INTO notes (id, cover, attachments) VALUES (?, ?, ?)")
        .bind(id.to_string())
        .bind(cover.map(|c| c.to_string()))
        .bind(serde_json::to_string(&attachments).unwrap())
        .execute(pool)
        .await
        .unwrap();
}

/// `(cover, attachments)` of a note row.
pub async fn read_note(pool: &SqlitePool, id: Uuid) -> (Option<Uuid>, Vec<Uuid>) {
    let (cover, attachments): (Option<String>, String) =
        sqlx::query_as("SELECT cover, attachments FROM notes WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(pool)
            .await
            .unwrap();
    let attachments: Vec<String> = serde_json::from_str(&attachments).unwrap();
    (
        cover.map(|c| Uuid::parse_str(&c).unwrap()),
        attachments.iter().map(|a| Uuid::parse_str(a).unwrap()).collect(),
    )
}

/// Clock whose sleeps return immediately and move `now` forward.
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
    sleeps: Mutex<Vec<Duration>>,
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::at(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap())
    }
}

impl ManualClock {
    pub fn at(now: DateTime<Utc>) -> Self {
        Self { now: Mutex::new(now), sleeps: Mutex::new(Vec::new()) }
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap();
        *now = *now + by;
    }

    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().unwrap().clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps.lock().unwrap().push(duration);
        self.advance(chrono::Duration::from_std(duration).unwrap());
    }
}

/// Blob store kept in a map. The next `n` deletes can be made to fail.
#[derive(Default)]
pub struct MemoryStorage {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
    failing_deletes: AtomicU32,
    delete_calls: AtomicU32,
    permanent_failure: Mutex<Option<String>>,
}

impl MemoryStorage {
    pub fn fail_next_deletes(&self, count: u32) {
        self.failing_deletes.store(count, Ordering::SeqCst);
    }

    /// Every delete of `relative_path` fails with a non-retryable error.
    pub fn deny_deletes_of(&self, relative_path: &str) {
        *self.permanent_failure.lock().unwrap() = Some(relative_path.to_string());
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.blobs.lock().unwrap().contains_key(relative_path)
    }

    pub fn len(&self) -> usize {
        self.blobs.lock().unwrap().len()
    }

    pub fn delete_calls(&self) -> u32 {
        self.delete_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FileStorageService for MemoryStorage {
    async fn upload(&self, file: &UploadFile) -> FileStorageResult<StoredFile> {
        let meta = detect_file_meta(file);
        let relative_path = match &meta.extension {
            Some(ext) => format!("original/test/{}.{}", Uuid::new_v4(), ext),
            None => format!("original/test/{}", Uuid::new_v4()),
        };
        self.blobs.lock().unwrap().insert(relative_path.clone(), file.data.clone());
        Ok(StoredFile {
            url: format!("memory://{}", relative_path),
            relative_path,
            meta,
        })
    }

    async fn delete(&self, relative_path: &str) -> FileStorageResult<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        if self.permanent_failure.lock().unwrap().as_deref() == Some(relative_path) {
            return Err(FileStorageError::PermissionDenied(relative_path.to_string()));
        }
        let remaining = self.failing_deletes.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failing_deletes.store(remaining - 1, Ordering::SeqCst);
            return Err(FileStorageError::Remote("storage temporarily unavailable".to_string()));
        }
        self.blobs.lock().unwrap().remove(relative_path);
        Ok(())
    }

    async fn get_file_data(&self, relative_path: &str) -> FileStorageResult<Vec<u8>> {
        self.blobs
            .lock()
            .unwrap()
            .get(relative_path)
            .cloned()
            .ok_or_else(|| FileStorageError::NotFound(relative_path.to_string()))
    }
}
