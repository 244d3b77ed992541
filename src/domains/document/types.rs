use crate::domains::core::file_storage_service::{FileMeta, StoredFile};
use crate::errors::{DomainError, DomainResult, ValidationError};
use crate::validation::{Validate, ValidationBuilder};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use uuid::Uuid;

/// Field name used when a `markAsPermanent` caller does not name one.
pub const DEFAULT_REFERENCE_FIELD: &str = "attachments";

/// Lifecycle status of a document, derived from its reverse index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    /// No host entity references the document; eligible for the sweep once old enough.
    Temporary,
    /// At least one host entity references the document.
    Permanent,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Temporary => "temporary",
            DocumentStatus::Permanent => "permanent",
        }
    }
}

impl FromStr for DocumentStatus {
    type Err = DomainError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "temporary" => Ok(DocumentStatus::Temporary),
            "permanent" => Ok(DocumentStatus::Permanent),
            _ => Err(DomainError::Internal(format!("Invalid DocumentStatus string: {}", s))),
        }
    }
}

/// One entry of a document's reverse index: host type, host id and the field holding the reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsedByItem {
    pub entity: String,
    pub id: Uuid,
    pub field: String,
}

impl UsedByItem {
    pub fn new(entity: &str, id: Uuid, field: &str) -> Self {
        Self { entity: entity.to_string(), id, field: field.to_string() }
    }

    /// `Entity/id.field`, used in log lines and failure reports.
    pub fn label(&self) -> String {
        format!("{}/{}.{}", self.entity, self.id, self.field)
    }
}

/// Visibility scopes of a document. Each category is an independent list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AvailableFor {
    pub users: Vec<String>,
    pub departments: Vec<String>,
    pub teams: Vec<String>,
    pub positions: Vec<String>,
    pub hour_groups: Vec<String>,
    pub access: Vec<String>,
}

impl AvailableFor {
    /// Replace every category for which `update` carries a non-empty list.
    /// Categories left empty in `update` keep their current values.
    pub fn merge_from(&mut self, update: &AvailableFor) {
        fn replace_if_present(target: &mut Vec<String>, incoming: &[String]) {
            if !incoming.is_empty() {
                *target = incoming.to_vec();
            }
        }
        replace_if_present(&mut self.users, &update.users);
        replace_if_present(&mut self.departments, &update.departments);
        replace_if_present(&mut self.teams, &update.teams);
        replace_if_present(&mut self.positions, &update.positions);
        replace_if_present(&mut self.hour_groups, &update.hour_groups);
        replace_if_present(&mut self.access, &update.access);
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
            && self.departments.is_empty()
            && self.teams.is_empty()
            && self.positions.is_empty()
            && self.hour_groups.is_empty()
            && self.access.is_empty()
    }
}

/// Uploaded binary asset and its reverse index
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: Uuid,
    pub file: StoredFile,
    pub original_filename: String,
    pub owner: Uuid,
    pub uploaded_by: Uuid,
    pub status: DocumentStatus,
    pub used_by: Vec<UsedByItem>,
    pub available_for: AvailableFor,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn is_referenced_by(&self, entity: &str, id: Uuid, field: &str) -> bool {
        self.used_by.iter().any(|u| u.entity == entity && u.id == id && u.field == field)
    }
}

/// DocumentRow - SQLite row representation for mapping from database
#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    pub id: String,
    pub file_url: String,
    pub relative_path: String,
    pub original_filename: String,
    pub mime_type: String,
    pub size_bytes: i64,
    pub extension: Option<String>,
    pub owner: String,
    pub uploaded_by: String,
    pub status: String,
    pub available_for: String,
    pub metadata: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Row of the `document_references` table
#[derive(Debug, Clone, FromRow)]
pub struct DocumentReferenceRow {
    pub document_id: String,
    pub entity: String,
    pub entity_id: String,
    pub field: String,
}

/// Fixed-width RFC3339 so stored timestamps compare correctly as text.
pub fn db_timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_uuid(value: &str) -> DomainResult<Uuid> {
    Uuid::parse_str(value).map_err(|_| DomainError::InvalidUuid(value.to_string()))
}

fn parse_datetime(field: &str, value: &str) -> DomainResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| DomainError::Internal(format!("Invalid {} format: {}", field, value)))
}

impl DocumentReferenceRow {
    pub fn into_item(self) -> DomainResult<UsedByItem> {
        Ok(UsedByItem {
            entity: self.entity,
            id: parse_uuid(&self.entity_id)?,
            field: self.field,
        })
    }
}

impl DocumentRow {
    /// Convert database row to domain entity
    pub fn into_entity(self, used_by: Vec<UsedByItem>) -> DomainResult<Document> {
        let available_for: AvailableFor = serde_json::from_str(&self.available_for)
            .map_err(|e| DomainError::Internal(format!("Invalid available_for JSON for document {}: {}", self.id, e)))?;
        let metadata = self
            .metadata
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| DomainError::Internal(format!("Invalid metadata JSON for document {}: {}", self.id, e)))?;

        Ok(Document {
            id: parse_uuid(&self.id)?,
            file: StoredFile {
                url: self.file_url,
                relative_path: self.relative_path,
                meta: FileMeta {
                    mime_type: self.mime_type,
                    size: self.size_bytes.max(0) as u64,
                    extension: self.extension,
                },
            },
            original_filename: self.original_filename,
            owner: parse_uuid(&self.owner)?,
            uploaded_by: parse_uuid(&self.uploaded_by)?,
            status: DocumentStatus::from_str(&self.status)?,
            used_by,
            available_for,
            metadata,
            created_at: parse_datetime("created_at", &self.created_at)?,
            updated_at: parse_datetime("updated_at", &self.updated_at)?,
        })
    }
}

/// Insert payload for a freshly uploaded document
#[derive(Debug, Clone)]
pub struct NewDocument {
    pub id: Uuid,
    pub file: StoredFile,
    pub original_filename: String,
    pub uploader_id: Uuid,
    pub available_for: AvailableFor,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Caller-supplied extras for an upload
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UploadMetadata {
    pub available_for: AvailableFor,
    /// Free-form attributes stored alongside the document.
    pub attributes: Option<serde_json::Value>,
}

/// Reference mutation request as received from callers. Every field is
/// required; see [`ReferenceUpdate::into_target`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceUpdate {
    pub document_ids: Option<Vec<Uuid>>,
    pub entity_name: Option<String>,
    pub entity_id: Option<Uuid>,
    pub field: Option<String>,
}

/// Validated reference mutation: which documents, from which host field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferenceTarget {
    pub document_ids: Vec<Uuid>,
    pub entity_name: String,
    pub entity_id: Uuid,
    pub field: String,
}

impl Validate for ReferenceUpdate {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("document_ids", self.document_ids.clone())
            .required()
            .validate()?;
        ValidationBuilder::new("entity_name", self.entity_name.clone())
            .required()
            .not_blank()
            .identifier()
            .validate()?;
        ValidationBuilder::new("entity_id", self.entity_id)
            .required()
            .validate()?;
        ValidationBuilder::new("field", self.field.clone())
            .required()
            .not_blank()
            .identifier()
            .validate()
    }
}

impl ReferenceUpdate {
    pub fn new(document_ids: Vec<Uuid>, entity_name: &str, entity_id: Uuid, field: &str) -> Self {
        Self {
            document_ids: Some(document_ids),
            entity_name: Some(entity_name.to_string()),
            entity_id: Some(entity_id),
            field: Some(field.to_string()),
        }
    }

    /// Validate and unwrap into a [`ReferenceTarget`].
    pub fn into_target(self) -> DomainResult<ReferenceTarget> {
        self.validate()?;
        match (self.document_ids, self.entity_name, self.entity_id, self.field) {
            (Some(document_ids), Some(entity_name), Some(entity_id), Some(field)) => Ok(ReferenceTarget {
                document_ids,
                entity_name,
                entity_id,
                field,
            }),
            _ => Err(DomainError::Validation(ValidationError::custom("reference update is incomplete"))),
        }
    }
}

/// `usedBy` entry for the explicit promotion path; `field` defaults to
/// [`DEFAULT_REFERENCE_FIELD`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsedByInput {
    pub entity: String,
    pub id: Uuid,
    pub field: Option<String>,
}

impl UsedByInput {
    pub fn into_item(self) -> UsedByItem {
        UsedByItem {
            entity: self.entity,
            id: self.id,
            field: self.field.unwrap_or_else(|| DEFAULT_REFERENCE_FIELD.to_string()),
        }
    }
}

impl Validate for UsedByInput {
    fn validate(&self) -> DomainResult<()> {
        ValidationBuilder::new("entity", Some(self.entity.clone()))
            .required()
            .identifier()
            .validate()?;
        ValidationBuilder::new("field", self.field.clone())
            .not_blank()
            .identifier()
            .validate()
    }
}

/// Outcome of deleting the blob behind a removed document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlobDeletionOutcome {
    Deleted { attempts: u32 },
    /// Retries ran out; the blob was handed to the file deletion queue.
    Queued { attempts: u32, error: String },
    /// Deletion handed to a background task.
    Scheduled,
}

/// Reference entry that could not be cleared, and why.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReferenceIssue {
    pub reference: UsedByItem,
    pub reason: String,
}

/// What `remove_document` did.
#[derive(Debug, Clone, Serialize)]
pub struct DeletionReport {
    pub document_id: Uuid,
    pub cleared: Vec<UsedByItem>,
    /// Unknown host type or undeclared field.
    pub skipped: Vec<ReferenceIssue>,
    /// Host update attempted and failed.
    pub failed: Vec<ReferenceIssue>,
    pub blob: BlobDeletionOutcome,
}

impl DeletionReport {
    pub fn is_clean(&self) -> bool {
        self.skipped.is_empty() && self.failed.is_empty() && matches!(self.blob, BlobDeletionOutcome::Deleted { .. })
    }

    /// The host-cleanup failures as a [`DomainError::PartialFailure`], if any.
    pub fn partial_failure(&self) -> Option<DomainError> {
        if self.failed.is_empty() {
            return None;
        }
        Some(DomainError::PartialFailure {
            document_id: self.document_id,
            failures: self
                .failed
                .iter()
                .map(|issue| format!("{}: {}", issue.reference.label(), issue.reason))
                .collect(),
        })
    }
}

/// Result of one temporary-file sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub cutoff: Option<DateTime<Utc>>,
    pub removed: Vec<Uuid>,
    pub failed: Vec<(Uuid, String)>,
}
