// Public modules
pub mod config;
pub mod db_migration;
pub mod domains;
pub mod engine;
pub mod errors;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use config::{BlobDeletionMode, EngineConfig, StorageConfig};
pub use domains::core::document_linking::{Cardinality, DocumentLinkable, ReferenceField, ReferenceValue};
pub use domains::core::file_storage_service::{
    FileStorageError, FileStorageService, LocalFileStorageService, ApiFileStorageService, StoredFile, UploadFile,
};
pub use domains::core::retry::{Clock, RetryPolicy, RetryRunner, SystemClock};
pub use domains::document::host_registry::{HostRegistry, ReferenceHost, SqliteReferenceHost};
pub use domains::document::reference_tracker::{diff_references, ReferenceDiff, ReferenceTracker};
pub use domains::document::types::{
    AvailableFor, BlobDeletionOutcome, DeletionReport, Document, DocumentStatus, ReferenceUpdate, SweepReport,
    UploadMetadata, UsedByInput, UsedByItem,
};
pub use engine::{open_pool, DocumentEngine};
pub use errors::{DbError, DomainError, ServiceError, ValidationError};
