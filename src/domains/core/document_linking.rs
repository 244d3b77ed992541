// src/domains/core/document_linking.rs
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// How many documents a reference field can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Cardinality {
    /// A single optional document id (e.g. `avatar`).
    Single,
    /// A list of document ids (e.g. `attachments`).
    Many,
}

/// A field on a host entity that points at documents.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReferenceField {
    pub name: String,
    pub cardinality: Cardinality,
}

impl ReferenceField {
    pub fn single(name: &str) -> Self {
        Self { name: name.to_string(), cardinality: Cardinality::Single }
    }

    pub fn many(name: &str) -> Self {
        Self { name: name.to_string(), cardinality: Cardinality::Many }
    }
}

/// Current value of a reference field on one host entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReferenceValue {
    Single(Option<Uuid>),
    Many(Vec<Uuid>),
}

impl ReferenceValue {
    pub fn empty(cardinality: Cardinality) -> Self {
        match cardinality {
            Cardinality::Single => ReferenceValue::Single(None),
            Cardinality::Many => ReferenceValue::Many(Vec::new()),
        }
    }

    /// The referenced ids as a set.
    pub fn ids(&self) -> BTreeSet<Uuid> {
        match self {
            ReferenceValue::Single(id) => id.iter().copied().collect(),
            ReferenceValue::Many(ids) => ids.iter().copied().collect(),
        }
    }
}

/// Trait for host entities whose fields reference documents.
///
/// Reference fields are declared explicitly; nothing is inferred from the
/// entity's shape.
pub trait DocumentLinkable {
    /// Type tag stored in each document's `usedBy` entries (e.g. `"Note"`).
    fn entity_name() -> &'static str;

    fn entity_id(&self) -> Uuid;

    fn reference_fields() -> Vec<ReferenceField>;

    /// Current value of the named field. Unknown fields read as empty.
    fn reference_value(&self, field: &str) -> ReferenceValue;

    /// Check if a specific field is a declared reference field.
    fn is_reference_field(field: &str) -> bool {
        Self::reference_fields().iter().any(|f| f.name == field)
    }
}
