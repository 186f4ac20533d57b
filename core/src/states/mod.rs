//! # State Store & Domain Contexts
//!
//! Private states live in two places at once: durably in the store
//! (schemas, state rows, label rows, nullifiers, confirmation and spend
//! markers) and transiently in per-transaction **domain contexts** — an
//! overlay of not-yet-flushed states plus the in-memory lock view that
//! makes extra states visible to an assembling transaction and hides the
//! ones it is spending.
//!
//! The contract that everything else leans on: a state visible to
//! `find_available_states` under context C is either durable and not
//! spend-locked by C, or it is in C's creating map. Nothing in between.
//!
//! - [`schema`] — schema declarations, content-hash ids, label projection
//! - [`store`] — the durable side, scoped by (domain, contract, schema)
//! - [`context`] — the overlay, locks, and the flushing pipeline
//! - [`writer`] — the seam through which a sealed overlay reaches disk

pub mod context;
pub mod schema;
pub mod store;
pub mod writer;

pub use context::{AvailableState, ContextInfo, DomainContext};
pub use schema::{FieldDef, Schema, SchemaDeclaration};
pub use store::{ReceivedState, StateStore, StateStoreConfig, StoredState};
pub use writer::{DbFlushWriter, FlushWriter, WriteOperation};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Classified, ErrorKind};
use crate::filters::{FilterError, LabelValue};
use crate::storage::DbError;
use crate::types::{SchemaId, StateId};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Filter(#[from] FilterError),

    #[error("schema {0} not found")]
    SchemaNotFound(SchemaId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("state id mismatch: expected {expected}, got {got}")]
    HashMismatch { expected: StateId, got: StateId },

    #[error("nullifier refers to state {state} which is not in this context")]
    NullifierNotInContext { state: StateId },

    #[error("state {state} already has nullifier {existing}")]
    NullifierConflict { state: StateId, existing: StateId },

    #[error("create lock refers to state {state} which is not in this context")]
    CreateLockNotInContext { state: StateId },

    #[error("state lock is missing its transaction id")]
    LockMissingTransaction,

    #[error("domain context is closed")]
    ContextClosed,

    #[error("flush failed, context must be reset: {0}")]
    FlushFailed(String),
}

impl Classified for StateError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(DbError::NotFound(_)) | Self::SchemaNotFound(_) => ErrorKind::NotFound,
            Self::Db(_) => ErrorKind::Transient,
            Self::Filter(_) | Self::InvalidState(_) | Self::HashMismatch { .. } => {
                ErrorKind::InputValidation
            }
            Self::NullifierNotInContext { .. }
            | Self::NullifierConflict { .. }
            | Self::CreateLockNotInContext { .. }
            | Self::LockMissingTransaction
            | Self::ContextClosed
            | Self::FlushFailed(_) => ErrorKind::InternalInvariant,
        }
    }
}

// ---------------------------------------------------------------------------
// Locks
// ---------------------------------------------------------------------------

/// What a transaction is doing with a state while it is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockKind {
    /// The transaction proposes to create this state. The state must be
    /// held in the owning context's overlay.
    Create,
    /// The transaction reads the state without consuming it.
    Read,
    /// The transaction consumes the state; it disappears from later
    /// "available" queries in the same context.
    Spend,
}

/// An in-memory lock tying a state to an in-flight transaction.
///
/// Locks exist only on the assembling node and only inside one domain
/// context; they are never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateLock {
    pub state: StateId,
    pub transaction: Uuid,
    pub kind: LockKind,
}

// ---------------------------------------------------------------------------
// Nullifiers
// ---------------------------------------------------------------------------

/// A spend-proof token for domains that reveal a nullifier rather than the
/// state id. At most one nullifier ever exists per state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Nullifier {
    pub id: StateId,
    pub state: StateId,
    pub domain: String,
}

// ---------------------------------------------------------------------------
// Upserts and materialised states
// ---------------------------------------------------------------------------

/// Input to [`DomainContext::upsert_states`].
#[derive(Debug, Clone)]
pub struct StateUpsert {
    /// Pre-computed id, or `None` to derive it via the schema's default
    /// hash rule.
    pub id: Option<StateId>,
    pub schema: SchemaId,
    pub data: Value,
    /// When set, a create-lock for this transaction is added and the
    /// state becomes returnable from this context's queries.
    pub created_by: Option<Uuid>,
}

/// A state with its label values fully materialised.
///
/// This is the unit held in a context's overlay and returned from
/// queries: everything needed to evaluate and sort without going back to
/// the raw data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MaterializedState {
    pub id: StateId,
    pub schema: SchemaId,
    pub domain: String,
    pub data: Value,
    pub created_at: i64,
    pub labels: BTreeMap<String, LabelValue>,
    pub nullifier: Option<Nullifier>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_error_classification() {
        assert_eq!(
            StateError::InvalidState("x".into()).kind(),
            ErrorKind::InputValidation
        );
        assert_eq!(
            StateError::FlushFailed("x".into()).kind(),
            ErrorKind::InternalInvariant
        );
        assert!(StateError::Db(DbError::Serialization("x".into())).is_retryable());
        assert!(!StateError::ContextClosed.is_retryable());
    }

    #[test]
    fn lock_kind_serde_names() {
        assert_eq!(serde_json::to_string(&LockKind::Spend).unwrap(), "\"spend\"");
        assert_eq!(serde_json::to_string(&LockKind::Create).unwrap(), "\"create\"");
    }
}
