use crate::domains::core::document_linking::{DocumentLinkable, ReferenceValue};
use crate::domains::document::reference_index::ReferenceIndexStore;
use crate::errors::DomainResult;
use log::{debug, error};
use sqlx::{Sqlite, Transaction};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

/// Ids that entered and left one reference field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReferenceDiff {
    pub added: Vec<Uuid>,
    pub removed: Vec<Uuid>,
}

impl ReferenceDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Set difference between two values of the same field. A missing previous
/// value counts as empty.
pub fn diff_references(previous: Option<&ReferenceValue>, current: &ReferenceValue) -> ReferenceDiff {
    let before = previous.map(ReferenceValue::ids).unwrap_or_default();
    let after = current.ids();
    ReferenceDiff {
        added: after.difference(&before).copied().collect(),
        removed: before.difference(&after).copied().collect(),
    }
}

/// One field's pending index change.
struct FieldChange {
    field: String,
    diff: ReferenceDiff,
}

/// Keeps the reverse index in step with host entity saves and deletes.
///
/// Host repositories call [`track_save`](Self::track_save) after computing the
/// new entity state. Any index failure is returned, so the host save fails too.
#[derive(Clone)]
pub struct ReferenceTracker {
    index: Arc<dyn ReferenceIndexStore>,
}

impl ReferenceTracker {
    pub fn new(index: Arc<dyn ReferenceIndexStore>) -> Self {
        Self { index }
    }

    fn changes_for_save<E: DocumentLinkable>(previous: Option<&E>, current: &E) -> Vec<FieldChange> {
        E::reference_fields()
            .into_iter()
            .filter_map(|field| {
                let before = previous.map(|p| p.reference_value(&field.name));
                let after = current.reference_value(&field.name);
                let diff = diff_references(before.as_ref(), &after);
                (!diff.is_empty()).then(|| FieldChange { field: field.name, diff })
            })
            .collect()
    }

    fn changes_for_delete<E: DocumentLinkable>(entity: &E) -> Vec<FieldChange> {
        E::reference_fields()
            .into_iter()
            .filter_map(|field| {
                let removed: BTreeSet<Uuid> = entity.reference_value(&field.name).ids();
                (!removed.is_empty()).then(|| FieldChange {
                    field: field.name,
                    diff: ReferenceDiff { added: Vec::new(), removed: removed.into_iter().collect() },
                })
            })
            .collect()
    }

    /// Apply the field-by-field difference between `previous` (None for a new
    /// entity) and `current`.
    pub async fn track_save<E: DocumentLinkable + Sync>(&self, previous: Option<&E>, current: &E) -> DomainResult<()> {
        let host_id = current.entity_id();
        for change in Self::changes_for_save(previous, current) {
            self.apply(E::entity_name(), host_id, &change).await?;
        }
        Ok(())
    }

    pub async fn track_save_with_tx<E: DocumentLinkable + Sync>(
        &self,
        previous: Option<&E>,
        current: &E,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let host_id = current.entity_id();
        for change in Self::changes_for_save(previous, current) {
            self.apply_with_tx(E::entity_name(), host_id, &change, tx).await?;
        }
        Ok(())
    }

    /// Every reference the entity holds is released.
    pub async fn track_delete<E: DocumentLinkable + Sync>(&self, entity: &E) -> DomainResult<()> {
        let host_id = entity.entity_id();
        for change in Self::changes_for_delete(entity) {
            self.apply(E::entity_name(), host_id, &change).await?;
        }
        Ok(())
    }

    pub async fn track_delete_with_tx<E: DocumentLinkable + Sync>(
        &self,
        entity: &E,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        let host_id = entity.entity_id();
        for change in Self::changes_for_delete(entity) {
            self.apply_with_tx(E::entity_name(), host_id, &change, tx).await?;
        }
        Ok(())
    }

    async fn apply(&self, entity: &str, host_id: Uuid, change: &FieldChange) -> DomainResult<()> {
        debug!(
            "Reference change on {}/{}.{}: +{} -{}",
            entity,
            host_id,
            change.field,
            change.diff.added.len(),
            change.diff.removed.len()
        );
        if !change.diff.added.is_empty() {
            self.index
                .add_references(&change.diff.added, entity, host_id, &change.field)
                .await
                .map_err(|e| {
                    error!("Failed to index references for {}/{}.{}: {}", entity, host_id, change.field, e);
                    e
                })?;
        }
        if !change.diff.removed.is_empty() {
            self.index
                .remove_references(&change.diff.removed, entity, host_id, &change.field)
                .await
                .map_err(|e| {
                    error!("Failed to release references for {}/{}.{}: {}", entity, host_id, change.field, e);
                    e
                })?;
        }
        Ok(())
    }

    async fn apply_with_tx(
        &self,
        entity: &str,
        host_id: Uuid,
        change: &FieldChange,
        tx: &mut Transaction<'_, Sqlite>,
    ) -> DomainResult<()> {
        if !change.diff.added.is_empty() {
            self.index
                .add_references_with_tx(&change.diff.added, entity, host_id, &change.field, tx)
                .await?;
        }
        if !change.diff.removed.is_empty() {
            self.index
                .remove_references_with_tx(&change.diff.removed, entity, host_id, &change.field, tx)
                .await?;
        }
        Ok(())
    }
}
