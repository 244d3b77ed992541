use crate::domains::core::file_storage_service::{FileStorageService, UploadFile};
use crate::domains::core::repository::{begin_write, FindById};
use crate::domains::core::retry::Clock;
use crate::domains::document::deletion_coordinator::DeletionCoordinator;
use crate::domains::document::reference_index::ReferenceIndexStore;
use crate::domains::document::repository::DocumentRepository;
use crate::domains::document::types::{
    AvailableFor, Document, DocumentStatus, NewDocument, SweepReport, UploadMetadata, UsedByInput,
};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

const MAX_FILENAME_LENGTH: usize = 255;

/// Upload, explicit promotion and the temporary-file sweep.
pub struct DocumentLifecycleManager {
    pool: SqlitePool,
    repo: Arc<dyn DocumentRepository>,
    index: Arc<dyn ReferenceIndexStore>,
    storage: Arc<dyn FileStorageService>,
    coordinator: Arc<DeletionCoordinator>,
    clock: Arc<dyn Clock>,
    max_upload_bytes: u64,
}

impl DocumentLifecycleManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        repo: Arc<dyn DocumentRepository>,
        index: Arc<dyn ReferenceIndexStore>,
        storage: Arc<dyn FileStorageService>,
        coordinator: Arc<DeletionCoordinator>,
        clock: Arc<dyn Clock>,
        max_upload_bytes: u64,
    ) -> Self {
        Self { pool, repo, index, storage, coordinator, clock, max_upload_bytes }
    }

    fn validate_upload(&self, file: &UploadFile, uploader_id: Uuid) -> DomainResult<()> {
        ValidationBuilder::new("original_filename", Some(file.original_filename.clone()))
            .required()
            .not_blank()
            .max_length(MAX_FILENAME_LENGTH)
            .validate()?;
        ValidationBuilder::new("uploader_id", Some(uploader_id)).required().validate()?;
        if file.data.is_empty() {
            return Err(DomainError::Validation(ValidationError::required("file")));
        }
        ValidationBuilder::new("file_size", Some(file.data.len() as u64))
            .max(self.max_upload_bytes)
            .validate()
    }

    /// Store the blob and create a temporary document owned by the uploader.
    pub async fn upload(&self, file: UploadFile, uploader_id: Uuid, metadata: UploadMetadata) -> DomainResult<Document> {
        self.validate_upload(&file, uploader_id)?;

        let stored = self.storage.upload(&file).await?;
        let new_doc = NewDocument {
            id: Uuid::new_v4(),
            file: stored,
            original_filename: file.original_filename.clone(),
            uploader_id,
            available_for: metadata.available_for,
            metadata: metadata.attributes,
            created_at: self.clock.now(),
        };

        match self.repo.create(&new_doc).await {
            Ok(document) => {
                info!(
                    "Uploaded document {} ({}, {} bytes) for {}",
                    document.id, document.file.meta.mime_type, document.file.meta.size, uploader_id
                );
                Ok(document)
            }
            Err(e) => {
                // Don't leave an unrecorded blob behind
                if let Err(cleanup) = self.storage.delete(&new_doc.file.relative_path).await {
                    error!("Failed to remove blob {} after insert failure: {}", new_doc.file.relative_path, cleanup);
                }
                Err(e)
            }
        }
    }

    /// Record one user of the document and merge visibility scopes.
    ///
    /// The entry is keyed by `(entity, id, field)` exactly like
    /// reference-index adds; `field` defaults to `attachments`. Returns `None`
    /// when the document does not exist.
    pub async fn mark_as_permanent(
        &self,
        document_id: Uuid,
        used_by: UsedByInput,
        available_for: AvailableFor,
    ) -> DomainResult<Option<Document>> {
        used_by.validate()?;
        let item = used_by.into_item();

        let mut tx = begin_write(&self.pool).await?;
        let result = async {
            let Some(current) = self.repo.find_optional_with_tx(document_id, &mut tx).await? else {
                return Ok(None);
            };

            self.index
                .add_references_with_tx(&[document_id], &item.entity, item.id, &item.field, &mut tx)
                .await?;

            let mut merged = current.available_for.clone();
            merged.merge_from(&available_for);
            if merged != current.available_for {
                self.repo.update_available_for_with_tx(document_id, &merged, &mut tx).await?;
            }

            self.repo.find_by_id_with_tx(document_id, &mut tx).await.map(Some)
        }
        .await;

        match result {
            Ok(document) => {
                tx.commit().await.map_err(DbError::from)?;
                match &document {
                    Some(_) => debug!("Marked document {} permanent for {}", document_id, item.label()),
                    None => warn!("mark_as_permanent: document {} not found", document_id),
                }
                Ok(document)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    /// Remove every temporary document created before `older_than`.
    /// A failure on one document is recorded and the sweep moves on.
    pub async fn cleanup_temporary_files(&self, older_than: DateTime<Utc>) -> DomainResult<SweepReport> {
        let candidates = self.repo.list_temporary_before(older_than).await?;
        let mut report = SweepReport { cutoff: Some(older_than), ..Default::default() };

        if candidates.is_empty() {
            debug!("Sweep found no temporary documents older than {}", older_than);
            return Ok(report);
        }
        info!("Sweep found {} temporary document(s) older than {}", candidates.len(), older_than);

        for candidate in candidates {
            // Skip documents that picked up a reference since the listing
            match self.repo.find_by_id(candidate.id).await {
                Ok(current) if current.status == DocumentStatus::Permanent => {
                    debug!("Document {} became permanent, keeping it", candidate.id);
                    continue;
                }
                Ok(_) => {}
                Err(DomainError::EntityNotFound(_, _)) => continue,
                Err(e) => {
                    error!("Sweep could not reload document {}: {}", candidate.id, e);
                    report.failed.push((candidate.id, e.to_string()));
                    continue;
                }
            }

            match self.coordinator.remove_document(candidate.id).await {
                Ok(_) => report.removed.push(candidate.id),
                Err(DomainError::EntityNotFound(_, _)) => {}
                Err(e) => {
                    error!("Sweep failed to remove document {}: {}", candidate.id, e);
                    report.failed.push((candidate.id, e.to_string()));
                }
            }
        }

        info!("Sweep removed {} document(s), {} failure(s)", report.removed.len(), report.failed.len());
        Ok(report)
    }

    pub async fn get_document(&self, id: Uuid) -> DomainResult<Document> {
        self.repo.find_by_id(id).await
    }

    pub async fn list_temporary_before(&self, cutoff: DateTime<Utc>) -> DomainResult<Vec<Document>> {
        self.repo.list_temporary_before(cutoff).await
    }
}
