pub mod document_linking;
pub mod file_storage_service;
pub mod repository;
pub mod retry;

// Re-export the TRAITS and core types, not specific implementations usually
pub use document_linking::{Cardinality, DocumentLinkable, ReferenceField, ReferenceValue};
pub use file_storage_service::{FileStorageService, FileStorageResult, FileStorageError};
pub use repository::{begin_write, FindById, HardDeletable};
pub use retry::{Clock, RetryPolicy, RetryRunner, SystemClock};
