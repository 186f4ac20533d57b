//! # Private Transaction Coordination
//!
//! The coordinator owns the submission boundary (the `transactions`
//! and `transaction_deps` rows commit inside the submission's gateway
//! transaction, with public submissions staged in the same commit,
//! bound 1:1) and drives the private lifecycle: sequencer slot per
//! (domain, contract) → domain context → Init → verifier resolution →
//! Assemble → attestation gathering (local signatures, remote
//! endorsements over the reliable channel) → Prepare → dispatch to the
//! public orchestrator → on confirmation, clear the context locks and
//! write the receipt.
//!
//! - [`manager`] — submission, idempotency, updates, finalisation
//! - [`sequencer`] — one serialising task per (domain, contract)
//! - [`flow`] — the assemble/attest/prepare/dispatch pipeline

pub mod flow;
pub mod manager;
pub mod sequencer;

pub use manager::{Coordinator, CoordinatorConfig};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::abi::{AbiError, AbiFunction, AbiHash};
use crate::domains::DomainError;
use crate::error::{Classified, ErrorKind};
use crate::keys::KeyError;
use crate::publictx::ledger::TxLocation;
use crate::publictx::PublicTxError;
use crate::states::StateError;
use crate::storage::DbError;
use crate::transport::TransportError;
use crate::types::LedgerAddress;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error(transparent)]
    Abi(#[from] AbiError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    PublicTx(#[from] PublicTxError),

    #[error("key error: {0}")]
    Key(#[from] KeyError),

    #[error("invalid transaction: {0}")]
    Validation(String),

    #[error("transaction {0} not found")]
    NotFound(Uuid),

    #[error("idempotency key {key:?} clashes with existing transaction {existing}")]
    IdempotencyClash { key: String, existing: Uuid },

    #[error("transaction domain {given:?} does not match contract domain {actual:?}")]
    DomainMismatch { given: String, actual: String },

    #[error("a private deploy requires a 'domain'")]
    MissingDomain,

    #[error("endorsement rejected by {party:?}: {reason}")]
    EndorsementRejected { party: String, reason: String },

    #[error("endorsement from {party:?} timed out")]
    EndorsementTimeout { party: String },

    #[error("coordinator is stopped")]
    Stopped,
}

impl Classified for TxError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(DbError::NotFound(_)) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Db(_) | Self::Stopped | Self::EndorsementTimeout { .. } => ErrorKind::Transient,
            Self::Abi(e) => e.kind(),
            Self::State(e) => e.kind(),
            Self::Domain(e) => e.kind(),
            Self::Transport(e) => e.kind(),
            Self::PublicTx(e) => e.kind(),
            Self::Key(e) => e.kind(),
            Self::Validation(_)
            | Self::IdempotencyClash { .. }
            | Self::DomainMismatch { .. }
            | Self::MissingDomain => ErrorKind::InputValidation,
            Self::EndorsementRejected { .. } => ErrorKind::DomainPermanent,
        }
    }
}

// ---------------------------------------------------------------------------
// Submission types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxType {
    Public,
    Private,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitMode {
    /// Submit and drive to completion.
    Auto,
    /// Prepare only; an external party submits.
    External,
    /// Read-only call.
    Call,
}

/// A transaction as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionInput {
    #[serde(rename = "type")]
    pub tx_type: TxType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<LedgerAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<Vec<AbiFunction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi_reference: Option<AbiHash>,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<Uuid>,
    /// Public transactions only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

/// Update of an existing (public) transaction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionUpdate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi: Option<Vec<AbiFunction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abi_reference: Option<AbiHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<LedgerAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gas_limit: Option<u64>,
}

// ---------------------------------------------------------------------------
// Stored rows
// ---------------------------------------------------------------------------

/// The durable transaction record. Immutable after insert except
/// through the narrow public-transaction update path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub id: Uuid,
    pub submit_mode: SubmitMode,
    #[serde(rename = "type")]
    pub tx_type: TxType,
    pub created: i64,
    pub from: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<LedgerAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    /// Resolved function signature.
    pub function: String,
    pub abi_reference: AbiHash,
    /// Normalized JSON inputs, as text.
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}

/// One dependency edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionDep {
    pub transaction: Uuid,
    pub depends_on: Uuid,
}

/// The durable binding from a private transaction to the public
/// submission that consumed its prepared call, keyed by
/// (public-tx, private-tx).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchRow {
    pub private_transaction: Uuid,
    pub sender: LedgerAddress,
    pub public_local_id: u64,
}

/// The terminal record every submitted transaction eventually gets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionReceipt {
    pub transaction: Uuid,
    pub indexed: i64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<TxLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<LedgerAddress>,
    /// Domain enrichment (JSON text); allowed to be absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_receipt: Option<String>,
    /// Recorded, non-fatal enrichment failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain_receipt_error: Option<String>,
}
