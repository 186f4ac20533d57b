//! The flush seam: how a sealed overlay reaches durable storage.
//!
//! A context seals its `unFlushed` write operation and hands it to a
//! [`FlushWriter`] on a background thread. The production writer stages
//! everything into one gateway transaction; tests substitute a failing
//! writer to exercise the must-reset path.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::storage::{CoreDb, DbTxn, Table};
use crate::types::LedgerAddress;

use super::schema::canonical_json;
use super::store::{label_key, label_table, nullifier_key, state_key, StoredState};
use super::{MaterializedState, Nullifier, StateError};

// ---------------------------------------------------------------------------
// WriteOperation
// ---------------------------------------------------------------------------

/// A sealed batch of overlay writes bound for the database.
///
/// Ordered: repeat upserts of the same state id have already been
/// de-duplicated by the context, so a write operation never contains two
/// entries for one id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteOperation {
    pub id: Uuid,
    pub domain: String,
    pub contract: LedgerAddress,
    pub states: Vec<MaterializedState>,
    pub nullifiers: Vec<Nullifier>,
}

impl WriteOperation {
    pub fn new(domain: &str, contract: LedgerAddress) -> Self {
        Self {
            id: Uuid::new_v4(),
            domain: domain.to_string(),
            contract,
            states: Vec::new(),
            nullifiers: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty() && self.nullifiers.is_empty()
    }
}

// ---------------------------------------------------------------------------
// FlushWriter
// ---------------------------------------------------------------------------

/// Writes one sealed operation durably. Runs on the flush thread, outside
/// the context mutex.
pub trait FlushWriter: Send + Sync {
    fn write(&self, op: &WriteOperation) -> Result<(), StateError>;
}

/// The production writer: everything in one gateway transaction.
pub struct DbFlushWriter {
    db: Arc<CoreDb>,
}

impl DbFlushWriter {
    pub fn new(db: Arc<CoreDb>) -> Self {
        Self { db }
    }

    /// Stage one materialised state (row + label rows) into a write-set.
    /// Shared with the peer-receive path, which persists states without a
    /// context.
    pub(crate) fn stage_state(
        txn: &mut DbTxn<'_>,
        contract: LedgerAddress,
        state: &MaterializedState,
    ) -> Result<(), StateError> {
        let row = StoredState {
            id: state.id.clone(),
            schema: state.schema,
            domain: state.domain.clone(),
            contract,
            data: canonical_json(&state.data),
            created_at: state.created_at,
        };
        txn.put(Table::States, &state_key(&state.domain, &contract, &state.id), &row)?;
        for (field, value) in &state.labels {
            txn.put(
                label_table(value),
                &label_key(&state.domain, &contract, &state.id, field),
                value,
            )?;
        }
        Ok(())
    }

    /// Stage a nullifier, enforcing the one-nullifier-per-state rule.
    pub(crate) fn stage_nullifier(
        txn: &mut DbTxn<'_>,
        nullifier: &Nullifier,
    ) -> Result<(), StateError> {
        let key = nullifier_key(&nullifier.domain, &nullifier.state);
        if let Some(existing) = txn.get::<Nullifier>(Table::StateNullifiers, &key)? {
            if existing.id != nullifier.id {
                return Err(StateError::NullifierConflict {
                    state: nullifier.state.clone(),
                    existing: existing.id,
                });
            }
            return Ok(()); // idempotent re-write
        }
        txn.put(Table::StateNullifiers, &key, nullifier)?;
        Ok(())
    }
}

impl FlushWriter for DbFlushWriter {
    fn write(&self, op: &WriteOperation) -> Result<(), StateError> {
        self.db.transaction(|txn| {
            for state in &op.states {
                Self::stage_state(txn, op.contract, state)?;
            }
            for nullifier in &op.nullifiers {
                Self::stage_nullifier(txn, nullifier)?;
            }
            Ok(())
        })
    }
}
