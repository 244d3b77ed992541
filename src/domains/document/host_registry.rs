use crate::domains::core::document_linking::{Cardinality, ReferenceField};
use crate::errors::{DbError, DomainError, DomainResult, ValidationError};
use crate::validation::is_identifier;
use async_trait::async_trait;
use log::{debug, info};
use sqlx::{Sqlite, SqlitePool, Transaction};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

/// Deletion-side capability of a host entity type: remove a document id
/// from one of its reference fields.
#[async_trait]
pub trait ReferenceHost: Send + Sync {
    /// Type tag matching `UsedByItem::entity`.
    fn entity_name(&self) -> &str;

    fn reference_fields(&self) -> &[ReferenceField];

    fn field(&self, name: &str) -> Option<&ReferenceField> {
        self.reference_fields().iter().find(|f| f.name == name)
    }

    /// Returns whether the host row changed. A host that no longer exists, or
    /// no longer holds the id, is not an error.
    async fn clear_reference(
        &self,
        host_id: Uuid,
        field: &ReferenceField,
        document_id: Uuid,
    ) -> DomainResult<bool>;

    async fn clear_reference_with_tx(
        &self,
        host_id: Uuid,
        field: &ReferenceField,
        document_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<bool>;
}

/// Type tag -> host capability, built once at startup.
#[derive(Default, Clone)]
pub struct HostRegistry {
    hosts: HashMap<String, Arc<dyn ReferenceHost>>,
}

impl HostRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, host: Arc<dyn ReferenceHost>) -> DomainResult<()> {
        let name = host.entity_name().to_string();
        if self.hosts.contains_key(&name) {
            return Err(DomainError::Validation(ValidationError::invalid_value(
                "entity_name",
                &format!("host type '{}' is already registered", name),
            )));
        }
        info!(
            "Registered reference host '{}' with fields [{}]",
            name,
            host.reference_fields().iter().map(|f| f.name.as_str()).collect::<Vec<_>>().join(", ")
        );
        self.hosts.insert(name, host);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with_host(mut self, host: Arc<dyn ReferenceHost>) -> DomainResult<Self> {
        self.register(host)?;
        Ok(self)
    }

    pub fn resolve(&self, entity_name: &str) -> Option<Arc<dyn ReferenceHost>> {
        self.hosts.get(entity_name).cloned()
    }

    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

/// Host entity stored as a table in the same SQLite database.
///
/// Single fields hold the document id as text and are set to NULL when
/// cleared. Many fields hold a JSON array of ids; the cleared id is filtered
/// out with `json_each`.
pub struct SqliteReferenceHost {
    pool: SqlitePool,
    entity_name: String,
    table: String,
    id_column: String,
    fields: Vec<ReferenceField>,
}

impl SqliteReferenceHost {
    pub fn new(
        pool: SqlitePool,
        entity_name: &str,
        table: &str,
        fields: Vec<ReferenceField>,
    ) -> DomainResult<Self> {
        for (label, value) in [("entity_name", entity_name), ("table", table)] {
            if !is_identifier(value) {
                return Err(DomainError::Validation(ValidationError::format(label, "not a valid identifier")));
            }
        }
        if fields.is_empty() {
            return Err(DomainError::Validation(ValidationError::required("fields")));
        }
        for field in &fields {
            if !is_identifier(&field.name) {
                return Err(DomainError::Validation(ValidationError::format(
                    "fields",
                    &format!("'{}' is not a valid column name", field.name),
                )));
            }
        }

        Ok(Self {
            pool,
            entity_name: entity_name.to_string(),
            table: table.to_string(),
            id_column: "id".to_string(),
            fields,
        })
    }

    /// Key column other than `id`.
    pub fn with_id_column(mut self, id_column: &str) -> DomainResult<Self> {
        if !is_identifier(id_column) {
            return Err(DomainError::Validation(ValidationError::format("id_column", "not a valid identifier")));
        }
        self.id_column = id_column.to_string();
        Ok(self)
    }

    fn clear_sql(&self, field: &ReferenceField) -> DomainResult<String> {
        // Only declared columns reach SQL text
        let declared = self
            .fields
            .iter()
            .find(|f| f.name == field.name)
            .ok_or_else(|| {
                DomainError::Validation(ValidationError::invalid_value(
                    "field",
                    &format!("'{}' is not a reference field of {}", field.name, self.entity_name),
                ))
            })?;

        Ok(match declared.cardinality {
            Cardinality::Single => format!(
                "UPDATE {table} SET {col} = NULL WHERE {id} = ?1 AND {col} = ?2",
                table = self.table,
                col = declared.name,
                id = self.id_column
            ),
            Cardinality::Many => format!(
                "UPDATE {table} SET {col} = (
                    SELECT json_group_array(value) FROM json_each({table}.{col}) WHERE value != ?2
                ) WHERE {id} = ?1 AND EXISTS (
                    SELECT 1 FROM json_each({table}.{col}) WHERE value = ?2
                )",
                table = self.table,
                col = declared.name,
                id = self.id_column
            ),
        })
    }
}

#[async_trait]
impl ReferenceHost for SqliteReferenceHost {
    fn entity_name(&self) -> &str {
        &self.entity_name
    }

    fn reference_fields(&self) -> &[ReferenceField] {
        &self.fields
    }

    async fn clear_reference(
        &self,
        host_id: Uuid,
        field: &ReferenceField,
        document_id: Uuid,
    ) -> DomainResult<bool> {
        let sql = self.clear_sql(field)?;
        let result = sqlx::query(&sql)
            .bind(host_id.to_string())
            .bind(document_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(DbError::from)?;
        debug!("Cleared {} from {}/{}.{}: {} row(s)", document_id, self.entity_name, host_id, field.name, result.rows_affected());
        Ok(result.rows_affected() > 0)
    }

    async fn clear_reference_with_tx(
        &self,
        host_id: Uuid,
        field: &ReferenceField,
        document_id: Uuid,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<bool> {
        let sql = self.clear_sql(field)?;
        let result = sqlx::query(&sql)
            .bind(host_id.to_string())
            .bind(document_id.to_string())
            .execute(&mut **tx)
            .await
            .map_err(DbError::from)?;
        Ok(result.rows_affected() > 0)
    }
}
