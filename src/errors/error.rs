use std::fmt;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use crate::domains::core::file_storage_service::FileStorageError;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Database error: {0}")]
    Other(String),
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DbError", 2)?;
        let kind = match self {
            DbError::Sqlx(_) => "Sqlx",
            DbError::Transaction(_) => "Transaction",
            DbError::Query(_) => "Query",
            DbError::Migration(_) => "Migration",
            DbError::Other(_) => "Other",
        };
        state.serialize_field("type", kind)?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Transaction(s) => DbError::Transaction(s.clone()),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Domain-level errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum DomainError {
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Invalid UUID: {0}")]
    InvalidUuid(String),

    #[error("Entity not found: {0} with ID {1}")]
    EntityNotFound(String, Uuid),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    /// Some host-entity reference clearing updates failed during a cascading delete.
    #[error("Partial failure while clearing references to document {document_id}: {}", .failures.join("; "))]
    PartialFailure {
        document_id: Uuid,
        failures: Vec<String>,
    },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("External error: {0}")]
    External(String),
}

impl From<FileStorageError> for DomainError {
    fn from(error: FileStorageError) -> Self {
        DomainError::Storage(error.to_string())
    }
}

impl From<sqlx::Error> for DomainError {
    fn from(error: sqlx::Error) -> Self {
        DomainError::Database(DbError::from(error))
    }
}

/// Service-level errors (engine and binary surfaces)
#[derive(Debug, Error, Clone, Serialize)]
pub enum ServiceError {
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl From<DbError> for ServiceError {
    fn from(error: DbError) -> Self {
        ServiceError::Domain(DomainError::Database(error))
    }
}

/// Validation errors
#[derive(Debug, Error, Clone, Serialize)]
pub enum ValidationError {
    #[error("Field '{field}' is required")]
    Required {
        field: String,
    },

    #[error("Field '{field}' cannot exceed {max} characters")]
    MaxLength {
        field: String,
        max: usize,
    },

    #[error("Field '{field}' must be between {min} and {max}")]
    Range {
        field: String,
        min: String,
        max: String,
    },

    #[error("Field '{field}' contains invalid format: {reason}")]
    Format {
        field: String,
        reason: String,
    },

    #[error("Field '{field}' contains an invalid value: {reason}")]
    InvalidValue {
        field: String,
        reason: String,
    },

    #[error("Validation error: {0}")]
    Custom(String),
}

impl ValidationError {
    pub fn required(field: &str) -> Self {
        Self::Required {
            field: field.to_string(),
        }
    }

    pub fn max_length(field: &str, max: usize) -> Self {
        Self::MaxLength {
            field: field.to_string(),
            max,
        }
    }

    pub fn range<T: fmt::Display>(field: &str, min: T, max: T) -> Self {
        Self::Range {
            field: field.to_string(),
            min: min.to_string(),
            max: max.to_string(),
        }
    }

    pub fn format(field: &str, reason: &str) -> Self {
        Self::Format {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid_value(field: &str, reason: &str) -> Self {
        Self::InvalidValue {
            field: field.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn custom(message: &str) -> Self {
        Self::Custom(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_converts_to_domain_storage() {
        let err: DomainError = FileStorageError::NotFound("a/b.png".to_string()).into();
        assert!(matches!(err, DomainError::Storage(msg) if msg.contains("a/b.png")));
    }

    #[test]
    fn test_partial_failure_message_lists_failures() {
        let err = DomainError::PartialFailure {
            document_id: Uuid::nil(),
            failures: vec!["Note/1.attachments: locked".to_string(), "Task/2.cover: gone".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("Note/1.attachments: locked; Task/2.cover: gone"));
    }

    #[test]
    fn test_db_error_clone_flattens_sqlx_errors() {
        let err = DbError::Sqlx(sqlx::Error::RowNotFound);
        match err.clone() {
            DbError::Other(message) => assert!(message.starts_with("SQLx error:")),
            other => panic!("unexpected clone result: {:?}", other),
        }
    }
}
