use crate::domains::core::repository::{begin_write, FindById, HardDeletable};
use crate::domains::document::reference_index::used_by_for;
use crate::domains::document::types::{
    db_timestamp, AvailableFor, Document, DocumentRow, DocumentStatus, NewDocument,
};
use crate::errors::{DbError, DomainError, DomainResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, Pool, Sqlite, Transaction};
use uuid::Uuid;

#[async_trait]
pub trait DocumentRepository: FindById<Document> + HardDeletable + Send + Sync {
    async fn create(&self, new_doc: &NewDocument) -> DomainResult<Document>;

    async fn find_by_id_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Document>;

    async fn find_optional_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Document>>;

    /// Temporary documents created strictly before `cutoff`, oldest first.
    async fn list_temporary_before(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<Document>>;

    async fn update_available_for_with_tx<'t>(
        &self,
        id: Uuid,
        available_for: &AvailableFor,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()>;
}

pub struct SqliteDocumentRepository {
    pool: Pool<Sqlite>,
}

impl SqliteDocumentRepository {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    fn entity_name() -> &'static str {
        "Document"
    }
}

#[async_trait]
impl FindById<Document> for SqliteDocumentRepository {
    async fn find_by_id(&self, id: Uuid) -> DomainResult<Document> {
        let row = query_as::<_, DocumentRow>("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(DbError::from)?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_name().to_string(), id))?;

        let used_by = used_by_for(&self.pool, id).await?;
        row.into_entity(used_by)
    }
}

#[async_trait]
impl HardDeletable for SqliteDocumentRepository {
    fn entity_name(&self) -> &'static str {
        Self::entity_name()
    }

    async fn hard_delete(&self, id: Uuid) -> DomainResult<()> {
        let mut tx = begin_write(&self.pool).await?;
        match self.hard_delete_with_tx(id, &mut tx).await {
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

    async fn hard_delete_with_tx(
        &self,
        id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        // document_references rows go with it (ON DELETE CASCADE)
        let result = query("DELETE FROM documents WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            Err(DomainError::EntityNotFound(Self::entity_name().to_string(), id))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl DocumentRepository for SqliteDocumentRepository {
    async fn create(&self, new_doc: &NewDocument) -> DomainResult<Document> {
        let created_at = db_timestamp(new_doc.created_at);
        let available_for = serde_json::to_string(&new_doc.available_for)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize available_for: {}", e)))?;
        let metadata = new_doc
            .metadata
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| DomainError::Internal(format!("Failed to serialize metadata: {}", e)))?;
        let uploader = new_doc.uploader_id.to_string();

        query(
            r#"INSERT INTO documents (
                id, file_url, relative_path, original_filename,
                mime_type, size_bytes, extension,
                owner, uploaded_by, status, available_for, metadata,
                created_at, updated_at
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(new_doc.id.to_string())
        .bind(&new_doc.file.url)
        .bind(&new_doc.file.relative_path)
        .bind(&new_doc.original_filename)
        .bind(&new_doc.file.meta.mime_type)
        .bind(new_doc.file.meta.size as i64)
        .bind(new_doc.file.meta.extension.as_deref())
        .bind(&uploader) // owner
        .bind(&uploader) // uploaded_by
        .bind(DocumentStatus::Temporary.as_str())
        .bind(available_for)
        .bind(metadata)
        .bind(&created_at)
        .bind(&created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return DomainError::Database(DbError::Query(format!(
                        "Document with ID {} already exists",
                        new_doc.id
                    )));
                }
            }
            DomainError::Database(DbError::from(e))
        })?;

        self.find_by_id(new_doc.id).await
    }

    async fn find_by_id_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Document> {
        self.find_optional_with_tx(id, tx)
            .await?
            .ok_or_else(|| DomainError::EntityNotFound(Self::entity_name().to_string(), id))
    }

    async fn find_optional_with_tx<'t>(
        &self,
        id: Uuid,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<Option<Document>> {
        let row = query_as::<_, DocumentRow>("SELECT * FROM documents WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&mut **tx)
            .await
            .map_err(DbError::from)?;

        match row {
            None => Ok(None),
            Some(row) => {
                let used_by = used_by_for(&mut **tx, id).await?;
                row.into_entity(used_by).map(Some)
            }
        }
    }

    async fn list_temporary_before(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<Document>> {
        let rows = query_as::<_, DocumentRow>(
            "SELECT * FROM documents WHERE status = ? AND created_at < ? ORDER BY created_at ASC",
        )
        .bind(DocumentStatus::Temporary.as_str())
        .bind(db_timestamp(cutoff))
        .fetch_all(&self.pool)
        .await
        .map_err(DbError::from)?;

        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            // Temporary documents normally have no entries; load anyway so the
            // coordinator sees any entry written since the status was computed.
            let id = Uuid::parse_str(&row.id).map_err(|_| DomainError::InvalidUuid(row.id.clone()))?;
            let used_by = used_by_for(&self.pool, id).await?;
            documents.push(row.into_entity(used_by)?);
        }
        Ok(documents)
    }

    async fn update_available_for_with_tx<'t>(
        &self,
        id: Uuid,
        available_for: &AvailableFor,
        tx: &mut Transaction<'t, Sqlite>,
    ) -> DomainResult<()> {
        let json = serde_json::to_string(available_for)
            .map_err(|e| DomainError::Internal(format!("Failed to serialize available_for: {}", e)))?;

        let result = query("UPDATE documents SET available_for = ?, updated_at = ? WHERE id = ?")
            .bind(json)
            .bind(db_timestamp(Utc::now()))
            .bind(id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;

        if result.rows_affected() == 0 {
            return Err(DomainError::EntityNotFound(Self::entity_name().to_string(), id));
        }
        Ok(())
    }
}
