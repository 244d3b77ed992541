use crate::domains::core::file_storage_service::{FileStorageError, FileStorageService};
use crate::domains::core::retry::Clock;
use crate::domains::document::deletion_queue::{FileDeletionQueue, QUEUE_BATCH_SIZE};
use crate::domains::document::service::DocumentLifecycleManager;
use crate::domains::document::types::SweepReport;
use crate::errors::{DomainResult, ServiceError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time;

/// Outcome of one pass over the file deletion queue
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct QueuePassReport {
    pub completed: usize,
    pub failed: usize,
}

/// Worker for retrying queued blob deletions and sweeping abandoned uploads
pub struct FileDeletionWorker {
    queue: Arc<dyn FileDeletionQueue>,
    storage: Arc<dyn FileStorageService>,
    lifecycle: Arc<DocumentLifecycleManager>,
    clock: Arc<dyn Clock>,
    temp_retention: chrono::Duration,
    queue_interval: Duration,
    sweep_interval: Duration,
    shutdown_signal: Option<oneshot::Receiver<()>>,
}

impl FileDeletionWorker {
    pub fn new(
        queue: Arc<dyn FileDeletionQueue>,
        storage: Arc<dyn FileStorageService>,
        lifecycle: Arc<DocumentLifecycleManager>,
        clock: Arc<dyn Clock>,
        temp_retention: chrono::Duration,
    ) -> Self {
        Self {
            queue,
            storage,
            lifecycle,
            clock,
            temp_retention,
            queue_interval: Duration::from_secs(5 * 60),
            sweep_interval: Duration::from_secs(60 * 60),
            shutdown_signal: None,
        }
    }

    pub fn with_intervals(mut self, queue_interval: Duration, sweep_interval: Duration) -> Self {
        self.queue_interval = queue_interval;
        self.sweep_interval = sweep_interval;
        self
    }

    /// Set shutdown signal receiver
    pub fn with_shutdown_signal(mut self, receiver: oneshot::Receiver<()>) -> Self {
        self.shutdown_signal = Some(receiver);
        self
    }

    /// Start the worker loop
    pub async fn start(mut self) -> Result<(), ServiceError> {
        log::info!(
            "Starting file deletion worker (queue every {:?}, sweep every {:?})",
            self.queue_interval,
            self.sweep_interval
        );

        let mut queue_tick = time::interval(self.queue_interval);
        let mut sweep_tick = time::interval(self.sweep_interval);
        let mut shutdown = self.shutdown_signal.take();

        loop {
            tokio::select! {
                _ = queue_tick.tick() => {
                    if let Err(e) = self.process_deletion_queue().await {
                        log::error!("Error processing file deletion queue: {:?}", e);
                    }
                }
                _ = sweep_tick.tick() => {
                    if let Err(e) = self.run_sweep().await {
                        log::error!("Error sweeping temporary documents: {:?}", e);
                    }
                }
                _ = async {
                    match shutdown.as_mut() {
                        Some(signal) => {
                            let _ = signal.await;
                        }
                        // Never complete if no shutdown signal
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    log::info!("Received shutdown signal, stopping file deletion worker");
                    break;
                }
            }
        }

        Ok(())
    }

    /// Remove temporary documents older than the retention window.
    pub async fn run_sweep(&self) -> DomainResult<SweepReport> {
        let cutoff = self.clock.now() - self.temp_retention;
        self.lifecycle.cleanup_temporary_files(cutoff).await
    }

    /// Retry one batch of queued blob deletions.
    pub async fn process_deletion_queue(&self) -> DomainResult<QueuePassReport> {
        let pending = self.queue.pending(QUEUE_BATCH_SIZE).await?;
        let mut report = QueuePassReport::default();

        if pending.is_empty() {
            log::debug!("No pending file deletions to process");
            return Ok(report);
        }

        log::info!("Found {} pending file deletions", pending.len());

        for deletion in pending {
            match self.storage.delete(&deletion.relative_path).await {
                // Missing files count as deleted
                Ok(()) | Err(FileStorageError::NotFound(_)) => {
                    self.queue.mark_completed(deletion.id).await?;
                    report.completed += 1;
                    log::info!("Deleted queued blob for document: {}", deletion.document_id);
                }
                Err(e) => {
                    let message = e.to_string();
                    self.queue.record_failure(deletion.id, &message).await?;
                    report.failed += 1;
                    log::warn!(
                        "Failed to delete queued blob for document: {} (attempt {}) - Error: {}",
                        deletion.document_id,
                        deletion.attempts + 1,
                        message
                    );
                }
            }
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BlobDeletionMode;
    use crate::domains::core::file_storage_service::UploadFile;
    use crate::domains::core::retry::{RetryPolicy, RetryRunner};
    use crate::domains::document::deletion_coordinator::DeletionCoordinator;
    use crate::domains::document::deletion_queue::SqliteFileDeletionQueue;
    use crate::domains::document::host_registry::HostRegistry;
    use crate::domains::document::reference_index::SqliteReferenceIndexStore;
    use crate::domains::document::repository::SqliteDocumentRepository;
    use crate::domains::document::types::UploadMetadata;
    use crate::test_support::{memory_pool, ManualClock, MemoryStorage};
    use uuid::Uuid;

    struct Fixture {
        storage: Arc<MemoryStorage>,
        queue: Arc<SqliteFileDeletionQueue>,
        clock: Arc<ManualClock>,
        lifecycle: Arc<DocumentLifecycleManager>,
    }

    impl Fixture {
        async fn new() -> Self {
            let pool = memory_pool().await;
            let repo = Arc::new(SqliteDocumentRepository::new(pool.clone()));
            let storage = Arc::new(MemoryStorage::default());
            let clock = Arc::new(ManualClock::default());
            let queue = Arc::new(SqliteFileDeletionQueue::new(pool.clone()).with_clock(clock.clone()));
            let coordinator = Arc::new(DeletionCoordinator::new(
                pool.clone(),
                repo.clone(),
                Arc::new(HostRegistry::new()),
                storage.clone(),
                queue.clone(),
                RetryRunner::new(RetryPolicy::default(), clock.clone()),
                BlobDeletionMode::Inline,
                false,
            ));
            let lifecycle = Arc::new(DocumentLifecycleManager::new(
                pool.clone(),
                repo,
                Arc::new(SqliteReferenceIndexStore::new(pool.clone())),
                storage.clone(),
                coordinator,
                clock.clone(),
                1024 * 1024,
            ));
            Self { storage, queue, clock, lifecycle }
        }

        fn worker(&self) -> FileDeletionWorker {
            FileDeletionWorker::new(
                self.queue.clone(),
                self.storage.clone(),
                self.lifecycle.clone(),
                self.clock.clone(),
                chrono::Duration::hours(24),
            )
        }
    }

    #[tokio::test]
    async fn test_queue_pass_completes_and_records_failures() {
        let fx = Fixture::new().await;
        let stored = fx.storage.upload(&UploadFile::new(b"hello".to_vec(), "a.txt")).await.unwrap();
        let first = fx.queue.enqueue(Uuid::new_v4(), &stored.relative_path, 3, "timeout").await.unwrap();
        // Already gone from storage: still completes
        fx.queue.enqueue(Uuid::new_v4(), "original/test/missing.txt", 3, "timeout").await.unwrap();

        let report = fx.worker().process_deletion_queue().await.unwrap();
        assert_eq!(report, QueuePassReport { completed: 2, failed: 0 });
        assert!(!fx.storage.contains(&stored.relative_path));
        assert!(fx.queue.pending(QUEUE_BATCH_SIZE).await.unwrap().iter().all(|p| p.id != first));

        fx.queue.enqueue(Uuid::new_v4(), "original/test/stuck.txt", 3, "timeout").await.unwrap();
        fx.storage.fail_next_deletes(1);
        let report = fx.worker().process_deletion_queue().await.unwrap();
        assert_eq!(report, QueuePassReport { completed: 0, failed: 1 });
        let pending = fx.queue.pending(QUEUE_BATCH_SIZE).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].attempts, 4);
    }

    #[tokio::test]
    async fn test_sweep_uses_retention_window() {
        let fx = Fixture::new().await;
        let doc = fx
            .lifecycle
            .upload(UploadFile::new(b"draft".to_vec(), "draft.txt"), Uuid::new_v4(), UploadMetadata::default())
            .await
            .unwrap();

        assert!(fx.worker().run_sweep().await.unwrap().removed.is_empty());

        fx.clock.advance(chrono::Duration::hours(25));
        assert_eq!(fx.worker().run_sweep().await.unwrap().removed, vec![doc.id]);
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown_signal() {
        let fx = Fixture::new().await;
        let (tx, rx) = oneshot::channel();
        let worker = fx
            .worker()
            .with_intervals(Duration::from_secs(3600), Duration::from_secs(3600))
            .with_shutdown_signal(rx);

        let handle = tokio::spawn(worker.start());
        tx.send(()).unwrap();

        let result = time::timeout(Duration::from_secs(5), handle).await;
        assert!(matches!(result, Ok(Ok(Ok(())))));
    }
}
