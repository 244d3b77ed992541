pub mod types;
pub mod repository;
pub mod reference_index;
pub mod reference_tracker;
pub mod host_registry;
pub mod deletion_queue;
pub mod deletion_coordinator;
pub mod service;
pub mod file_deletion_worker;

// Re-export main items for other domains to use
pub use types::{Document, DocumentStatus, UsedByItem, AvailableFor, DeletionReport, SweepReport};
pub use service::DocumentLifecycleManager;
pub use deletion_coordinator::DeletionCoordinator;
pub use reference_index::{ReferenceIndexStore, SqliteReferenceIndexStore};
pub use reference_tracker::ReferenceTracker;
pub use host_registry::{HostRegistry, ReferenceHost, SqliteReferenceHost};
