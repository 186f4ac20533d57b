//! Schema declarations and label projection.
//!
//! A schema is the typed shape of one kind of state within a domain. Its
//! id is the SHA-256 of the canonical JSON of the declaration, so the same
//! declaration always lands on the same id on every node — schemas are
//! immutable once inserted.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::filters::{LabelKind, LabelValue};
use crate::types::{SchemaId, StateId};

use super::StateError;

// ---------------------------------------------------------------------------
// Declaration
// ---------------------------------------------------------------------------

/// One typed field of a state schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    pub kind: LabelKind,
    /// Indexed fields become label rows and are queryable; the rest are
    /// opaque payload.
    #[serde(default)]
    pub indexed: bool,
}

impl FieldDef {
    pub fn indexed(name: &str, kind: LabelKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            indexed: true,
        }
    }

    pub fn opaque(name: &str, kind: LabelKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            indexed: false,
        }
    }
}

/// The declaration a domain hands over when registering a schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDeclaration {
    pub name: String,
    pub fields: Vec<FieldDef>,
}

// ---------------------------------------------------------------------------
// Schema
// ---------------------------------------------------------------------------

/// A registered schema: declaration plus its content-derived id, scoped
/// to one domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub id: SchemaId,
    pub domain: String,
    pub declaration: SchemaDeclaration,
}

impl Schema {
    /// Build a schema, deriving the id from the declaration.
    pub fn new(domain: &str, declaration: SchemaDeclaration) -> Self {
        let id = Self::hash_declaration(&declaration);
        Self {
            id,
            domain: domain.to_string(),
            declaration,
        }
    }

    /// SHA-256 over the canonical JSON of the declaration.
    pub fn hash_declaration(declaration: &SchemaDeclaration) -> SchemaId {
        let canonical = canonical_json(
            &serde_json::to_value(declaration).expect("declaration serializes"),
        );
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        SchemaId(hasher.finalize().into())
    }

    /// Declared kind of a field, or `None` if the field is unknown or
    /// not indexed.
    pub fn label_kind(&self, field: &str) -> Option<LabelKind> {
        self.declaration
            .fields
            .iter()
            .find(|f| f.indexed && f.name == field)
            .map(|f| f.kind)
    }

    /// The indexed fields of this schema.
    pub fn label_fields(&self) -> impl Iterator<Item = &FieldDef> {
        self.declaration.fields.iter().filter(|f| f.indexed)
    }

    /// Project a state's data through this schema, materialising every
    /// indexed field into a typed label value.
    ///
    /// Every indexed field must be present in the data — a state that
    /// cannot produce its labels is not a valid state of this schema.
    pub fn project_labels(
        &self,
        data: &Value,
    ) -> Result<BTreeMap<String, LabelValue>, StateError> {
        let obj = data.as_object().ok_or_else(|| {
            StateError::InvalidState(format!(
                "state data for schema {:?} must be a JSON object",
                self.declaration.name
            ))
        })?;

        let mut labels = BTreeMap::new();
        for field in self.label_fields() {
            let raw = obj.get(&field.name).ok_or_else(|| {
                StateError::InvalidState(format!(
                    "state data is missing indexed field {:?}",
                    field.name
                ))
            })?;
            let value = LabelValue::coerce(field.kind, &field.name, raw)?;
            labels.insert(field.name.clone(), value);
        }
        Ok(labels)
    }

    /// The default state-id rule: SHA-256 over the schema id and the
    /// canonical JSON of the data. Domains with a custom hash function
    /// bypass this entirely.
    pub fn default_state_id(&self, data: &Value) -> StateId {
        let mut hasher = Sha256::new();
        hasher.update(self.id.as_bytes());
        hasher.update(canonical_json(data).as_bytes());
        StateId::new(hasher.finalize().to_vec())
    }
}

/// Canonical JSON rendering: object keys sorted, no insignificant
/// whitespace. `serde_json`'s default map is ordered, so a re-serialize
/// of a parsed value is already canonical.
pub fn canonical_json(value: &Value) -> String {
    value.to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
