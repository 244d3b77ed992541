use crate::domains::core::retry::{Clock, SystemClock};
use crate::domains::document::types::db_timestamp;
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

/// Blobs are retried in batches of this size, fewest attempts first.
pub const QUEUE_BATCH_SIZE: i64 = 100;

/// A blob waiting for deletion after the inline retries ran out
#[derive(Debug, Clone)]
pub struct PendingFileDeletion {
    pub id: Uuid,
    pub document_id: Uuid,
    pub relative_path: String,
    pub requested_at: DateTime<Utc>,
    pub attempts: i64,
}

#[derive(Debug, FromRow)]
struct PendingFileDeletionRow {
    id: String,
    document_id: String,
    relative_path: String,
    requested_at: String,
    attempts: i64,
}

impl PendingFileDeletionRow {
    fn into_entity(self) -> DomainResult<PendingFileDeletion> {
        Ok(PendingFileDeletion {
            id: Uuid::parse_str(&self.id).map_err(|_| DomainError::InvalidUuid(self.id.clone()))?,
            document_id: Uuid::parse_str(&self.document_id)
                .map_err(|_| DomainError::InvalidUuid(self.document_id.clone()))?,
            relative_path: self.relative_path,
            requested_at: DateTime::parse_from_rfc3339(&self.requested_at)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|_| DomainError::Internal(format!("Invalid requested_at format: {}", self.requested_at)))?,
            attempts: self.attempts,
        })
    }
}

#[async_trait]
pub trait FileDeletionQueue: Send + Sync {
    /// `attempts` already spent inline, and the last error seen.
    async fn enqueue(
        &self,
        document_id: Uuid,
        relative_path: &str,
        attempts: u32,
        error_message: &str,
    ) -> DomainResult<Uuid>;

    async fn pending(&self, limit: i64) -> DomainResult<Vec<PendingFileDeletion>>;

    async fn mark_completed(&self, id: Uuid) -> DomainResult<()>;

    async fn record_failure(&self, id: Uuid, error_message: &str) -> DomainResult<()>;
}

pub struct SqliteFileDeletionQueue {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteFileDeletionQueue {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, clock: Arc::new(SystemClock) }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl FileDeletionQueue for SqliteFileDeletionQueue {
    async fn enqueue(
        &self,
        document_id: Uuid,
        relative_path: &str,
        attempts: u32,
        error_message: &str,
    ) -> DomainResult<Uuid> {
        let id = Uuid::new_v4();
        let now = db_timestamp(self.clock.now());
        sqlx::query(
            r#"INSERT INTO file_deletion_queue (
                id, document_id, relative_path, requested_at, attempts, last_attempt_at, error_message
            ) VALUES (?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(id.to_string())
        .bind(document_id.to_string())
        .bind(relative_path)
        .bind(&now)
        .bind(attempts as i64)
        .bind(&now)
        .bind(error_message)
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(id)
    }

    async fn pending(&self, limit: i64) -> DomainResult<Vec<PendingFileDeletion>> {
        sqlx::query_as::<_, PendingFileDeletionRow>(
            r#"SELECT id, document_id, relative_path, requested_at, attempts
            FROM file_deletion_queue
            WHERE completed_at IS NULL
            ORDER BY
                attempts ASC, -- Least-tried first
                requested_at ASC
            LIMIT ?"#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?
        .into_iter()
        .map(PendingFileDeletionRow::into_entity)
        .collect()
    }

    async fn mark_completed(&self, id: Uuid) -> DomainResult<()> {
        let now = db_timestamp(self.clock.now());
        sqlx::query(
            r#"UPDATE file_deletion_queue
            SET completed_at = ?, last_attempt_at = ?, attempts = attempts + 1, error_message = NULL
            WHERE id = ?"#,
        )
        .bind(&now)
        .bind(&now)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }

    async fn record_failure(&self, id: Uuid, error_message: &str) -> DomainResult<()> {
        sqlx::query(
            r#"UPDATE file_deletion_queue
            SET last_attempt_at = ?, attempts = attempts + 1, error_message = ?
            WHERE id = ?"#,
        )
        .bind(db_timestamp(self.clock.now()))
        .bind(error_message)
        .bind(id.to_string())
        .execute(&self.pool)
        .await
        .map_err(DbError::from)?;
        Ok(())
    }
}
