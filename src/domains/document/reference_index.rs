use crate::domains::core::repository::begin_write;
use crate::domains::core::retry::{Clock, SystemClock};
use crate::domains::document::types::{db_timestamp, DocumentReferenceRow, UsedByItem};
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use log::debug;
use sqlx::{Executor, QueryBuilder, Sqlite, SqlitePool, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Documents per statement. The widest statement binds five values per
/// document, which keeps every batch under SQLite's bound-parameter limit.
const IDS_PER_STATEMENT: usize = 500;

/// Maintains each document's `usedBy` reverse index and the status derived from it.
///
/// Every call touches all of its documents in one transaction: a batch either
/// lands completely or not at all.
#[async_trait]
pub trait ReferenceIndexStore: Send + Sync {
    /// Record `entity/entity_id.field` as a user of each document and mark them permanent.
    /// Fails with `EntityNotFound` (writing nothing) if any document does not exist.
    async fn add_references(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
    ) -> DomainResult<()>;

    async fn add_references_with_tx(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    /// Drop exactly the `entity/entity_id.field` entry from each document and
    /// recompute status. Documents that no longer exist are ignored.
    async fn remove_references(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
    ) -> DomainResult<()>;

    async fn remove_references_with_tx(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()>;

    async fn find_used_by(&self, document_id: Uuid) -> DomainResult<Vec<UsedByItem>>;
}

/// Load a document's reverse index in insertion order.
pub async fn used_by_for<'e, E>(executor: E, document_id: Uuid) -> DomainResult<Vec<UsedByItem>>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query_as::<_, DocumentReferenceRow>(
        "SELECT document_id, entity, entity_id, field FROM document_references WHERE document_id = ? ORDER BY rowid",
    )
    .bind(document_id.to_string())
    .fetch_all(executor)
    .await
    .map_err(DbError::from)?
    .into_iter()
    .map(DocumentReferenceRow::into_item)
    .collect()
}

/// Distinct ids as text, in a stable order.
fn distinct_ids(document_ids: &[Uuid]) -> Vec<String> {
    document_ids
        .iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(|id| id.to_string())
        .collect()
}

fn push_id_list(builder: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    builder.push("(");
    let mut separated = builder.separated(", ");
    for id in ids {
        separated.push_bind(id.clone());
    }
    separated.push_unseparated(")");
}

pub struct SqliteReferenceIndexStore {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl SqliteReferenceIndexStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool, clock: Arc::new(SystemClock) }
    }

    /// Stamp `updated_at` and `created_at` from `clock` instead of the system time.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    async fn ensure_documents_exist(
        ids: &[String],
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let mut existing: BTreeSet<String> = BTreeSet::new();
        for chunk in ids.chunks(IDS_PER_STATEMENT) {
            let mut builder = QueryBuilder::<Sqlite>::new("SELECT id FROM documents WHERE id IN ");
            push_id_list(&mut builder, chunk);
            existing.extend(
                builder
                    .build_query_scalar::<String>()
                    .fetch_all(&mut **tx)
                    .await
                    .map_err(DbError::from)?,
            );
        }

        match ids.iter().find(|id| !existing.contains(*id)) {
            None => Ok(()),
            Some(missing) => {
                let missing = Uuid::parse_str(missing).map_err(|_| DomainError::InvalidUuid(missing.clone()))?;
                Err(DomainError::EntityNotFound("Document".to_string(), missing))
            }
        }
    }
}

#[async_trait]
impl ReferenceIndexStore for SqliteReferenceIndexStore {
    async fn add_references(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
    ) -> DomainResult<()> {
        let mut tx = begin_write(&self.pool).await?;
        match self.add_references_with_tx(document_ids, entity, entity_id, field, &mut tx).await {
            Ok(()) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn add_references_with_tx(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let ids = distinct_ids(document_ids);
        if ids.is_empty() {
            return Ok(());
        }
        Self::ensure_documents_exist(&ids, tx).await?;

        let now = db_timestamp(self.clock.now());
        let entity_id_str = entity_id.to_string();
        let mut inserted = 0;

        for chunk in ids.chunks(IDS_PER_STATEMENT) {
            // Primary key on (document_id, entity, entity_id, field) makes re-adds no-ops
            let mut insert = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO document_references (document_id, entity, entity_id, field, created_at) ",
            );
            insert.push_values(chunk.iter(), |mut row, id| {
                row.push_bind(id.clone())
                    .push_bind(entity.to_string())
                    .push_bind(entity_id_str.clone())
                    .push_bind(field.to_string())
                    .push_bind(now.clone());
            });
            inserted += insert.build().execute(&mut **tx).await.map_err(DbError::from)?.rows_affected();

            let mut promote = QueryBuilder::<Sqlite>::new("UPDATE documents SET status = 'permanent', updated_at = ");
            promote.push_bind(now.clone());
            promote.push(" WHERE id IN ");
            push_id_list(&mut promote, chunk);
            promote.build().execute(&mut **tx).await.map_err(DbError::from)?;
        }

        debug!(
            "Indexed {}/{}.{} on {} document(s), {} new entr{}",
            entity,
            entity_id,
            field,
            ids.len(),
            inserted,
            if inserted == 1 { "y" } else { "ies" }
        );
        Ok(())
    }

    async fn remove_references(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
    ) -> DomainResult<()> {
        let mut tx = begin_write(&self.pool).await?;
        match self.remove_references_with_tx(document_ids, entity, entity_id, field, &mut tx).await {
            Ok(()) => {
                tx.commit().await.map_err(DbError::from)?;
                Ok(())
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn remove_references_with_tx(
        &self,
        document_ids: &[Uuid],
        entity: &str,
        entity_id: Uuid,
        field: &str,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let ids = distinct_ids(document_ids);
        if ids.is_empty() {
            return Ok(());
        }

        let now = db_timestamp(self.clock.now());
        let mut removed = 0;

        for chunk in ids.chunks(IDS_PER_STATEMENT) {
            let mut delete = QueryBuilder::<Sqlite>::new("DELETE FROM document_references WHERE entity = ");
            delete.push_bind(entity.to_string());
            delete.push(" AND entity_id = ");
            delete.push_bind(entity_id.to_string());
            delete.push(" AND field = ");
            delete.push_bind(field.to_string());
            delete.push(" AND document_id IN ");
            push_id_list(&mut delete, chunk);
            removed += delete.build().execute(&mut **tx).await.map_err(DbError::from)?.rows_affected();

            let mut recompute = QueryBuilder::<Sqlite>::new(
                "UPDATE documents SET status = CASE WHEN EXISTS (
                    SELECT 1 FROM document_references r WHERE r.document_id = documents.id
                ) THEN 'permanent' ELSE 'temporary' END, updated_at = ",
            );
            recompute.push_bind(now.clone());
            recompute.push(" WHERE id IN ");
            push_id_list(&mut recompute, chunk);
            recompute.build().execute(&mut **tx).await.map_err(DbError::from)?;
        }

        debug!(
            "Removed {} index entr{} for {}/{}.{}",
            removed,
            if removed == 1 { "y" } else { "ies" },
            entity,
            entity_id,
            field
        );
        Ok(())
    }

    async fn find_used_by(&self, document_id: Uuid) -> DomainResult<Vec<UsedByItem>> {
        used_by_for(&self.pool, document_id).await
    }
}
