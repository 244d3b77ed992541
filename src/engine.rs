//! The constructed entry point that wires every component together.
//!
//! One [`DocumentEngine`] is built at process start and passed to whatever
//! needs it. Nothing here is global.

use crate::config::EngineConfig;
use crate::db_migration::run_migrations;
use crate::domains::core::file_storage_service::{build_storage, FileStorageService, UploadFile};
use crate::domains::core::retry::{Clock, RetryRunner, SystemClock};
use crate::domains::document::deletion_coordinator::DeletionCoordinator;
use crate::domains::document::deletion_queue::{FileDeletionQueue, SqliteFileDeletionQueue};
use crate::domains::document::file_deletion_worker::FileDeletionWorker;
use crate::domains::document::host_registry::HostRegistry;
use crate::domains::document::reference_index::{ReferenceIndexStore, SqliteReferenceIndexStore};
use crate::domains::document::reference_tracker::ReferenceTracker;
use crate::domains::document::repository::{DocumentRepository, SqliteDocumentRepository};
use crate::domains::document::service::DocumentLifecycleManager;
use crate::domains::document::types::{
    AvailableFor, DeletionReport, Document, ReferenceUpdate, SweepReport, UploadMetadata, UsedByInput,
};
use crate::errors::{DbError, ServiceError, ServiceResult};
use chrono::{DateTime, Utc};
use log::info;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long a writer waits for another connection's write lock.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (creating if needed) the database at `database_url` and apply migrations.
pub async fn open_pool(database_url: &str) -> ServiceResult<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .map_err(|e| ServiceError::Configuration(format!("Invalid database URL '{}': {}", database_url, e)))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(BUSY_TIMEOUT);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(DbError::from)?;

    run_migrations(&pool).await?;
    Ok(pool)
}

pub struct DocumentEngine {
    pool: SqlitePool,
    config: EngineConfig,
    storage: Arc<dyn FileStorageService>,
    clock: Arc<dyn Clock>,
    index: Arc<dyn ReferenceIndexStore>,
    queue: Arc<dyn FileDeletionQueue>,
    tracker: ReferenceTracker,
    lifecycle: Arc<DocumentLifecycleManager>,
    coordinator: Arc<DeletionCoordinator>,
}

impl DocumentEngine {
    /// Wire the engine over an already migrated pool.
    pub fn new(
        pool: SqlitePool,
        config: EngineConfig,
        storage: Arc<dyn FileStorageService>,
        registry: HostRegistry,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let repo: Arc<dyn DocumentRepository> = Arc::new(SqliteDocumentRepository::new(pool.clone()));
        let index: Arc<dyn ReferenceIndexStore> =
            Arc::new(SqliteReferenceIndexStore::new(pool.clone()).with_clock(clock.clone()));
        let queue: Arc<dyn FileDeletionQueue> =
            Arc::new(SqliteFileDeletionQueue::new(pool.clone()).with_clock(clock.clone()));

        let coordinator = Arc::new(DeletionCoordinator::new(
            pool.clone(),
            repo.clone(),
            Arc::new(registry),
            storage.clone(),
            queue.clone(),
            RetryRunner::new(config.blob_retry.clone(), clock.clone()),
            config.blob_deletion,
            config.transactional_delete,
        ));
        let lifecycle = Arc::new(DocumentLifecycleManager::new(
            pool.clone(),
            repo,
            index.clone(),
            storage.clone(),
            coordinator.clone(),
            clock.clone(),
            config.max_upload_bytes,
        ));

        Self {
            tracker: ReferenceTracker::new(index.clone()),
            pool,
            config,
            storage,
            clock,
            index,
            queue,
            lifecycle,
            coordinator,
        }
    }

    /// Open the configured database and storage with the system clock.
    /// `register_hosts` receives the pool so host adapters can share it.
    pub async fn connect<F>(config: EngineConfig, register_hosts: F) -> ServiceResult<Self>
    where
        F: FnOnce(&SqlitePool) -> ServiceResult<HostRegistry>,
    {
        let pool = open_pool(&config.database_url).await?;
        let storage = build_storage(&config.storage)
            .map_err(|e| ServiceError::Configuration(format!("Failed to initialize storage: {}", e)))?;
        let registry = register_hosts(&pool)?;
        info!("Document engine ready with {} host type(s)", registry.len());
        Ok(Self::new(pool, config, storage, registry, Arc::new(SystemClock)))
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Tracker for host repositories to call on save and delete.
    pub fn reference_tracker(&self) -> &ReferenceTracker {
        &self.tracker
    }

    pub async fn upload_file(&self, file: UploadFile, user_id: Uuid, metadata: UploadMetadata) -> ServiceResult<Document> {
        Ok(self.lifecycle.upload(file, user_id, metadata).await?)
    }

    pub async fn add_document_references(&self, update: ReferenceUpdate) -> ServiceResult<()> {
        let target = update.into_target()?;
        self.index
            .add_references(&target.document_ids, &target.entity_name, target.entity_id, &target.field)
            .await?;
        Ok(())
    }

    pub async fn remove_document_references(&self, update: ReferenceUpdate) -> ServiceResult<()> {
        let target = update.into_target()?;
        self.index
            .remove_references(&target.document_ids, &target.entity_name, target.entity_id, &target.field)
            .await?;
        Ok(())
    }

    pub async fn mark_as_permanent(
        &self,
        document_id: Uuid,
        used_by: UsedByInput,
        available_for: AvailableFor,
    ) -> ServiceResult<Option<Document>> {
        Ok(self.lifecycle.mark_as_permanent(document_id, used_by, available_for).await?)
    }

    pub async fn remove_document(&self, document_id: Uuid) -> ServiceResult<DeletionReport> {
        Ok(self.coordinator.remove_document(document_id).await?)
    }

    pub async fn cleanup_temporary_files(&self, older_than: DateTime<Utc>) -> ServiceResult<SweepReport> {
        Ok(self.lifecycle.cleanup_temporary_files(older_than).await?)
    }

    pub async fn get_document(&self, document_id: Uuid) -> ServiceResult<Document> {
        Ok(self.lifecycle.get_document(document_id).await?)
    }

    /// Worker over this engine's components, using the configured intervals.
    pub fn file_deletion_worker(&self) -> FileDeletionWorker {
        FileDeletionWorker::new(
            self.queue.clone(),
            self.storage.clone(),
            self.lifecycle.clone(),
            self.clock.clone(),
            self.config.temp_retention,
        )
        .with_intervals(self.config.queue_interval, self.config.sweep_interval)
    }

    /// Run the deletion worker until `shutdown` fires.
    pub fn spawn_worker(&self, shutdown: oneshot::Receiver<()>) -> JoinHandle<ServiceResult<()>> {
        let worker = self.file_deletion_worker().with_shutdown_signal(shutdown);
        tokio::spawn(worker.start())
    }
}
