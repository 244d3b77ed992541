use crate::config::BlobDeletionMode;
use crate::domains::core::document_linking::ReferenceField;
use crate::domains::core::file_storage_service::{FileStorageError, FileStorageService};
use crate::domains::core::repository::{begin_write, FindById};
use crate::domains::core::retry::RetryRunner;
use crate::domains::document::deletion_queue::FileDeletionQueue;
use crate::domains::document::host_registry::{HostRegistry, ReferenceHost};
use crate::domains::document::repository::DocumentRepository;
use crate::domains::document::types::{BlobDeletionOutcome, DeletionReport, Document, ReferenceIssue, UsedByItem};
use crate::errors::{DbError, DomainError, DomainResult};
use futures::future::join_all;
use log::{debug, error, info, warn};
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

/// Deletes blobs with retry, falling back to the deletion queue.
#[derive(Clone)]
struct BlobDeleter {
    storage: Arc<dyn FileStorageService>,
    queue: Arc<dyn FileDeletionQueue>,
    retry: RetryRunner,
}

impl BlobDeleter {
    async fn delete(&self, document_id: Uuid, relative_path: &str) -> BlobDeletionOutcome {
        let result = self
            .retry
            .run("blob deletion", FileStorageError::is_retryable, |attempt| {
                let storage = Arc::clone(&self.storage);
                let path = relative_path.to_string();
                async move {
                    debug!("Deleting blob {} (attempt {})", path, attempt);
                    match storage.delete(&path).await {
                        // Already gone
                        Err(FileStorageError::NotFound(_)) => Ok(()),
                        other => other,
                    }
                }
            })
            .await;

        match result {
            Ok(((), attempts)) => {
                debug!("Deleted blob {} for document {} after {} attempt(s)", relative_path, document_id, attempts);
                BlobDeletionOutcome::Deleted { attempts }
            }
            Err(exhausted) => {
                let message = exhausted.last_error.to_string();
                error!(
                    "Giving up on blob {} for document {} after {} attempt(s): {}",
                    relative_path, document_id, exhausted.attempts, message
                );
                match self.queue.enqueue(document_id, relative_path, exhausted.attempts, &message).await {
                    Ok(queue_id) => info!("Queued blob {} for later deletion ({})", relative_path, queue_id),
                    Err(e) => error!("Failed to queue blob {} for later deletion: {}", relative_path, e),
                }
                BlobDeletionOutcome::Queued { attempts: exhausted.attempts, error: message }
            }
        }
    }
}

/// A `usedBy` entry resolved to the host capability that can clear it.
struct ResolvedReference {
    item: UsedByItem,
    host: Arc<dyn ReferenceHost>,
    field: ReferenceField,
}

/// Removes a document together with everything pointing at it.
///
/// Host cleanup is best effort: unknown hosts and fields are skipped, failed
/// updates are reported, and neither stops the record or blob deletion. With
/// `transactional` set, host cleanup and the record delete share one
/// transaction and any host failure aborts the whole deletion. The blob is
/// always deleted after the database work has committed.
pub struct DeletionCoordinator {
    pool: SqlitePool,
    repo: Arc<dyn DocumentRepository>,
    registry: Arc<HostRegistry>,
    blobs: BlobDeleter,
    blob_mode: BlobDeletionMode,
    transactional: bool,
}

impl DeletionCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        repo: Arc<dyn DocumentRepository>,
        registry: Arc<HostRegistry>,
        storage: Arc<dyn FileStorageService>,
        queue: Arc<dyn FileDeletionQueue>,
        retry: RetryRunner,
        blob_mode: BlobDeletionMode,
        transactional: bool,
    ) -> Self {
        Self {
            pool,
            repo,
            registry,
            blobs: BlobDeleter { storage, queue, retry },
            blob_mode,
            transactional,
        }
    }

    pub async fn remove_document(&self, document_id: Uuid) -> DomainResult<DeletionReport> {
        if self.transactional {
            self.remove_document_transactional(document_id).await
        } else {
            self.remove_document_best_effort(document_id).await
        }
    }

    /// Split `usedBy` into entries a registered host can clear and entries to skip.
    fn resolve_references(&self, document: &Document) -> (Vec<ResolvedReference>, Vec<ReferenceIssue>) {
        let mut resolved = Vec::new();
        let mut skipped = Vec::new();

        for item in &document.used_by {
            let Some(host) = self.registry.resolve(&item.entity) else {
                warn!("Document {} is used by unknown host type '{}', skipping {}", document.id, item.entity, item.label());
                skipped.push(ReferenceIssue {
                    reference: item.clone(),
                    reason: format!("unknown host type '{}'", item.entity),
                });
                continue;
            };
            let Some(field) = host.field(&item.field).cloned() else {
                warn!("Host type '{}' has no reference field '{}', skipping {}", item.entity, item.field, item.label());
                skipped.push(ReferenceIssue {
                    reference: item.clone(),
                    reason: format!("'{}' has no reference field '{}'", item.entity, item.field),
                });
                continue;
            };
            resolved.push(ResolvedReference { item: item.clone(), host, field });
        }

        (resolved, skipped)
    }

    async fn remove_document_best_effort(&self, document_id: Uuid) -> DomainResult<DeletionReport> {
        let document = self.repo.find_by_id(document_id).await?;
        let (resolved, skipped) = self.resolve_references(&document);

        // Host updates are independent of each other
        let outcomes = join_all(resolved.iter().map(|r| async move {
            let result = r.host.clear_reference(r.item.id, &r.field, document_id).await;
            (r, result)
        }))
        .await;

        let mut cleared = Vec::new();
        let mut failed = Vec::new();
        for (resolved, result) in outcomes {
            match result {
                Ok(changed) => {
                    if !changed {
                        debug!("{} no longer held document {}", resolved.item.label(), document_id);
                    }
                    cleared.push(resolved.item.clone());
                }
                Err(e) => {
                    error!("Failed to clear {} from {}: {}", document_id, resolved.item.label(), e);
                    failed.push(ReferenceIssue { reference: resolved.item.clone(), reason: e.to_string() });
                }
            }
        }

        self.repo.hard_delete(document_id).await?;
        let blob = self.delete_blob(&document).await;

        let report = DeletionReport { document_id, cleared, skipped, failed, blob };
        if let Some(partial) = report.partial_failure() {
            warn!("{}", partial);
        }
        info!(
            "Removed document {}: {} reference(s) cleared, {} skipped, {} failed",
            document_id,
            report.cleared.len(),
            report.skipped.len(),
            report.failed.len()
        );
        Ok(report)
    }

    async fn remove_document_transactional(&self, document_id: Uuid) -> DomainResult<DeletionReport> {
        let mut tx = begin_write(&self.pool).await?;

        let result = async {
            let document = self.repo.find_by_id_with_tx(document_id, &mut tx).await?;
            let (resolved, skipped) = self.resolve_references(&document);

            let mut cleared = Vec::with_capacity(resolved.len());
            for r in &resolved {
                r.host.clear_reference_with_tx(r.item.id, &r.field, document_id, &mut tx).await?;
                cleared.push(r.item.clone());
            }

            self.repo.hard_delete_with_tx(document_id, &mut tx).await?;
            Ok::<_, DomainError>((document, cleared, skipped))
        }
        .await;

        let (document, cleared, skipped) = match result {
            Ok(done) => {
                tx.commit().await.map_err(DbError::from)?;
                done
            }
            Err(e) => {
                let _ = tx.rollback().await;
                error!("Transactional removal of document {} rolled back: {}", document_id, e);
                return Err(e);
            }
        };

        let blob = self.delete_blob(&document).await;
        info!("Removed document {} in one transaction, {} reference(s) cleared", document_id, cleared.len());
        Ok(DeletionReport { document_id, cleared, skipped, failed: Vec::new(), blob })
    }

    async fn delete_blob(&self, document: &Document) -> BlobDeletionOutcome {
        let relative_path = document.file.relative_path.clone();
        match self.blob_mode {
            BlobDeletionMode::Inline => self.blobs.delete(document.id, &relative_path).await,
            BlobDeletionMode::Background { timeout } => {
                let blobs = self.blobs.clone();
                let document_id = document.id;
                tokio::spawn(async move {
                    match tokio::time::timeout(timeout, blobs.delete(document_id, &relative_path)).await {
                        Ok(outcome) => debug!("Background blob deletion for {} finished: {:?}", document_id, outcome),
                        Err(_) => {
                            warn!("Background blob deletion for {} timed out after {:?}", document_id, timeout);
                            let message = format!("timed out after {:?}", timeout);
                            if let Err(e) = blobs.queue.enqueue(document_id, &relative_path, 0, &message).await {
                                error!("Failed to queue blob {} for later deletion: {}", relative_path, e);
                            }
                        }
                    }
                });
                BlobDeletionOutcome::Scheduled
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::file_storage_service::UploadFile;
    use crate::domains::core::retry::RetryPolicy;
    use crate::domains::document::deletion_queue::{SqliteFileDeletionQueue, QUEUE_BATCH_SIZE};
    use crate::domains::document::host_registry::SqliteReferenceHost;
    use crate::domains::document::reference_index::{ReferenceIndexStore, SqliteReferenceIndexStore};
    use crate::domains::document::repository::SqliteDocumentRepository;
    use crate::domains::document::types::NewDocument;
    use crate::test_support::{create_notes_table, insert_note, memory_pool, read_note, ManualClock, MemoryStorage};
    use async_trait::async_trait;
    use chrono::Utc;
    use sqlx::{Sqlite, Transaction};
    use std::time::Duration;

    struct BrokenHost {
        fields: Vec<ReferenceField>,
    }

    #[async_trait]
    impl ReferenceHost for BrokenHost {
        fn entity_name(&self) -> &str {
            "Task"
        }
        fn reference_fields(&self) -> &[ReferenceField] {
            &self.fields
        }
        async fn clear_reference(&self, _: Uuid, _: &ReferenceField, _: Uuid) -> DomainResult<bool> {
            Err(DomainError::External("task service unavailable".into()))
        }
        async fn clear_reference_with_tx(
            &self,
            _: Uuid,
            _: &ReferenceField,
            _: Uuid,
            _: &mut Transaction<'_, Sqlite>,
        ) -> DomainResult<bool> {
            Err(DomainError::External("task service unavailable".into()))
        }
    }

    struct Fixture {
        pool: SqlitePool,
        repo: Arc<SqliteDocumentRepository>,
        index: SqliteReferenceIndexStore,
        storage: Arc<MemoryStorage>,
        queue: Arc<SqliteFileDeletionQueue>,
        clock: Arc<ManualClock>,
        registry: Arc<HostRegistry>,
    }

    impl Fixture {
        async fn new() -> Self {
            let pool = memory_pool().await;
            create_notes_table(&pool).await;
            let notes = SqliteReferenceHost::new(
                pool.clone(),
                "Note",
                "notes",
                vec![ReferenceField::single("cover"), ReferenceField::many("attachments")],
            )
            .unwrap();
            let registry = HostRegistry::new()
                .with_host(Arc::new(notes))
                .unwrap()
                .with_host(Arc::new(BrokenHost { fields: vec![ReferenceField::many("files")] }))
                .unwrap();

            Self {
                repo: Arc::new(SqliteDocumentRepository::new(pool.clone())),
                index: SqliteReferenceIndexStore::new(pool.clone()),
                storage: Arc::new(MemoryStorage::default()),
                queue: Arc::new(SqliteFileDeletionQueue::new(pool.clone())),
                clock: Arc::new(ManualClock::default()),
                registry: Arc::new(registry),
                pool,
            }
        }

        fn coordinator(&self, mode: BlobDeletionMode, transactional: bool) -> DeletionCoordinator {
            let policy = RetryPolicy {
                max_attempts: 3,
                initial_backoff: Duration::from_millis(50),
                max_backoff: Duration::from_millis(500),
                multiplier: 2,
            };
            DeletionCoordinator::new(
                self.pool.clone(),
                self.repo.clone(),
                self.registry.clone(),
                self.storage.clone(),
                self.queue.clone(),
                RetryRunner::new(policy, self.clock.clone()),
                mode,
                transactional,
            )
        }

        async fn document(&self) -> Document {
            let stored = self
                .storage
                .upload(&UploadFile::new(b"%PDF-1.4 test".to_vec(), "report.pdf"))
                .await
                .unwrap();
            self.repo
                .create(&NewDocument {
                    id: Uuid::new_v4(),
                    file: stored,
                    original_filename: "report.pdf".into(),
                    uploader_id: Uuid::new_v4(),
                    available_for: Default::default(),
                    metadata: None,
                    created_at: Utc::now(),
                })
                .await
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_cascade_clears_host_fields_record_and_blob() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        let (n1, n2) = (Uuid::new_v4(), Uuid::new_v4());
        let keep = Uuid::new_v4();
        insert_note(&fx.pool, n1, Some(doc.id), &[]).await;
        insert_note(&fx.pool, n2, None, &[keep, doc.id]).await;
        fx.index.add_references(&[doc.id], "Note", n1, "cover").await.unwrap();
        fx.index.add_references(&[doc.id], "Note", n2, "attachments").await.unwrap();

        let report = fx.coordinator(BlobDeletionMode::Inline, false).remove_document(doc.id).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(report.cleared.len(), 2);
        assert_eq!(report.blob, BlobDeletionOutcome::Deleted { attempts: 1 });
        assert_eq!(read_note(&fx.pool, n1).await, (None, Vec::<Uuid>::new()));
        assert_eq!(read_note(&fx.pool, n2).await, (None, vec![keep]));
        assert!(matches!(fx.repo.find_by_id(doc.id).await, Err(DomainError::EntityNotFound(_, _))));
        assert!(!fx.storage.contains(&doc.file.relative_path));
    }

    #[tokio::test]
    async fn test_unknown_hosts_and_fields_are_skipped() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        fx.index.add_references(&[doc.id], "Expense", Uuid::new_v4(), "receipt").await.unwrap();
        fx.index.add_references(&[doc.id], "Note", Uuid::new_v4(), "title").await.unwrap();

        let report = fx.coordinator(BlobDeletionMode::Inline, false).remove_document(doc.id).await.unwrap();

        assert_eq!(report.skipped.len(), 2);
        assert!(report.failed.is_empty());
        assert!(fx.repo.find_by_id(doc.id).await.is_err());
        assert!(!fx.storage.contains(&doc.file.relative_path));
    }

    #[tokio::test]
    async fn test_host_failure_is_partial_and_does_not_stop_deletion() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        let note = Uuid::new_v4();
        insert_note(&fx.pool, note, None, &[doc.id]).await;
        fx.index.add_references(&[doc.id], "Note", note, "attachments").await.unwrap();
        fx.index.add_references(&[doc.id], "Task", Uuid::new_v4(), "files").await.unwrap();

        let report = fx.coordinator(BlobDeletionMode::Inline, false).remove_document(doc.id).await.unwrap();

        assert_eq!(report.cleared.len(), 1);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(report.partial_failure(), Some(DomainError::PartialFailure { .. })));
        assert_eq!(read_note(&fx.pool, note).await.1, Vec::<Uuid>::new());
        assert!(fx.repo.find_by_id(doc.id).await.is_err());
    }

    #[tokio::test]
    async fn test_transactional_mode_rolls_back_on_host_failure() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        let note = Uuid::new_v4();
        insert_note(&fx.pool, note, None, &[doc.id]).await;
        fx.index.add_references(&[doc.id], "Note", note, "attachments").await.unwrap();
        fx.index.add_references(&[doc.id], "Task", Uuid::new_v4(), "files").await.unwrap();

        let result = fx.coordinator(BlobDeletionMode::Inline, true).remove_document(doc.id).await;

        assert!(matches!(result, Err(DomainError::External(_))));
        assert_eq!(read_note(&fx.pool, note).await.1, vec![doc.id]);
        assert_eq!(fx.repo.find_by_id(doc.id).await.unwrap().used_by.len(), 2);
        assert!(fx.storage.contains(&doc.file.relative_path));
        assert_eq!(fx.storage.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_transactional_mode_commits_cleanly() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        let note = Uuid::new_v4();
        insert_note(&fx.pool, note, Some(doc.id), &[]).await;
        fx.index.add_references(&[doc.id], "Note", note, "cover").await.unwrap();

        let report = fx.coordinator(BlobDeletionMode::Inline, true).remove_document(doc.id).await.unwrap();

        assert!(report.is_clean());
        assert_eq!(read_note(&fx.pool, note).await.0, None);
        assert!(fx.repo.find_by_id(doc.id).await.is_err());
    }

    #[tokio::test]
    async fn test_blob_deletion_retries_with_backoff() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        fx.storage.fail_next_deletes(2);

        let report = fx.coordinator(BlobDeletionMode::Inline, false).remove_document(doc.id).await.unwrap();

        assert_eq!(report.blob, BlobDeletionOutcome::Deleted { attempts: 3 });
        assert_eq!(fx.clock.sleeps(), vec![Duration::from_millis(50), Duration::from_millis(100)]);
        assert!(!fx.storage.contains(&doc.file.relative_path));
    }

    #[tokio::test]
    async fn test_exhausted_blob_deletion_is_queued_and_record_stays_deleted() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        fx.storage.fail_next_deletes(10);

        let report = fx.coordinator(BlobDeletionMode::Inline, false).remove_document(doc.id).await.unwrap();

        assert!(matches!(report.blob, BlobDeletionOutcome::Queued { attempts: 3, .. }));
        assert!(fx.repo.find_by_id(doc.id).await.is_err());
        let queued = fx.queue.pending(QUEUE_BATCH_SIZE).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].document_id, doc.id);
        assert_eq!(queued[0].relative_path, doc.file.relative_path);
        assert_eq!(queued[0].attempts, 3);
    }

    #[tokio::test]
    async fn test_non_retryable_blob_error_is_not_retried() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        fx.storage.deny_deletes_of(&doc.file.relative_path);

        let report = fx.coordinator(BlobDeletionMode::Inline, false).remove_document(doc.id).await.unwrap();

        assert!(matches!(report.blob, BlobDeletionOutcome::Queued { attempts: 1, .. }));
        assert!(fx.clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_background_mode_returns_before_blob_is_gone() {
        let fx = Fixture::new().await;
        let doc = fx.document().await;
        let coordinator = fx.coordinator(BlobDeletionMode::Background { timeout: Duration::from_secs(5) }, false);

        let report = coordinator.remove_document(doc.id).await.unwrap();
        assert_eq!(report.blob, BlobDeletionOutcome::Scheduled);

        for _ in 0..100 {
            if !fx.storage.contains(&doc.file.relative_path) {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(!fx.storage.contains(&doc.file.relative_path));
    }

    #[tokio::test]
    async fn test_missing_document_is_not_found() {
        let fx = Fixture::new().await;
        let result = fx.coordinator(BlobDeletionMode::Inline, false).remove_document(Uuid::new_v4()).await;
        assert!(matches!(result, Err(DomainError::EntityNotFound(_, _))));
    }
}
