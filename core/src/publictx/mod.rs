//! # Public Transaction Orchestration
//!
//! One signing address is one nonce space, and an external ledger can
//! delay, reject or replace what we send it. This module owns that
//! problem: per-sender **orchestrators** advancing FIFO queues of
//! in-flight transaction state machines, a **nonce allocator** that
//! hands out gap-free monotonic nonces recovered from persisted rows,
//! a **balance manager** gating admission by expected cost, and
//! gas-price escalation with a cap when the chain sits on a
//! submission.
//!
//! Every stage output is written durably *before* the state machine
//! advances; an update mid-flight opens a new explicit version rather
//! than mutating the record in place.
//!
//! - [`ledger`] — the base-ledger client contract
//! - [`nonce`] — per-sender nonce allocation with crash recovery
//! - [`balance`] — available-to-spend gating
//! - [`inflight`] — the staged state machine and its versions
//! - [`orchestrator`] — the per-sender driver task
//! - [`manager`] — orchestrator lifecycle, admission, completions

pub mod balance;
pub mod devchain;
pub mod inflight;
pub mod ledger;
pub mod manager;
pub mod nonce;
pub mod orchestrator;

pub use devchain::DevChain;
pub use inflight::{InFlight, TxStage, TxVersion};
pub use ledger::{BaseLedger, LedgerError, SignedSubmission, TxLocation};
pub use manager::{PublicTxManager, PublicTxManagerConfig, TxCompletion};
pub use orchestrator::OrchestratorConfig;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{Classified, ErrorKind};
use crate::storage::DbError;
use crate::types::LedgerAddress;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum PublicTxError {
    #[error(transparent)]
    Db(#[from] DbError),

    #[error("public transaction {0} not found")]
    NotFound(u64),

    #[error("invalid public transaction: {0}")]
    Validation(String),

    #[error("base ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("signer error: {0}")]
    Signer(String),

    #[error("public transaction manager is stopped")]
    Stopped,
}

impl Classified for PublicTxError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Db(DbError::NotFound(_)) | Self::NotFound(_) => ErrorKind::NotFound,
            Self::Validation(_) => ErrorKind::InputValidation,
            Self::Ledger(e) => e.kind(),
            _ => ErrorKind::Transient,
        }
    }
}

// ---------------------------------------------------------------------------
// Inputs and rows
// ---------------------------------------------------------------------------

/// A public transaction as staged by the coordinator (or directly by a
/// submission of type `public`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTxInput {
    /// Local signer identifier whose key submits this transaction.
    pub from: String,
    /// `None` for contract deploys.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<LedgerAddress>,
    /// The call payload: `{function, inputs}` as prepared JSON.
    pub data: Value,
    pub gas_limit: u64,
    /// Engine transactions bound 1:1 to this public submission.
    #[serde(default)]
    pub bindings: Vec<Uuid>,
}

/// The durable row of one public transaction, updated stage by stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTxRow {
    /// Node-local monotonic id (the admission order).
    pub local_id: u64,
    pub from: String,
    pub sender: LedgerAddress,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<LedgerAddress>,
    /// Call payload JSON text.
    pub data: String,
    pub gas_limit: u64,
    pub created: i64,
    /// Output of the Received stage: the allocated nonce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<u64>,
    /// Output of the Signing stage: hex of the submission signature.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Output of the Submitting stage: the chain transaction hash.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submitted_hash: Option<String>,
    /// Last gas price sent (escalation state survives restart).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_gas_price: Option<u128>,
    /// Highest version sequence persisted for this transaction.
    #[serde(default)]
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confirmed: Option<TxLocation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl PublicTxRow {
    pub fn is_complete(&self) -> bool {
        self.confirmed.is_some() || self.failure.is_some()
    }
}

/// Binding row: one engine transaction to the public submission that
/// carries it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicTxSubmissionRow {
    pub transaction: Uuid,
    pub sender: LedgerAddress,
    pub local_id: u64,
}

// ---------------------------------------------------------------------------
// Keys
// ---------------------------------------------------------------------------

pub(crate) fn public_tx_key(sender: &LedgerAddress, local_id: u64) -> Vec<u8> {
    let mut k = Vec::with_capacity(20 + 8);
    k.extend_from_slice(sender.as_bytes());
    k.extend_from_slice(&local_id.to_be_bytes());
    k
}

pub(crate) fn sender_prefix(sender: &LedgerAddress) -> Vec<u8> {
    sender.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_order_follows_local_id() {
        let sender = LedgerAddress([1u8; 20]);
        let a = public_tx_key(&sender, 1);
        let b = public_tx_key(&sender, 2);
        let c = public_tx_key(&sender, 300);
        assert!(a < b && b < c);
        assert!(a.starts_with(&sender_prefix(&sender)));
    }

    #[test]
    fn row_completion() {
        let mut row = PublicTxRow {
            local_id: 1,
            from: "seq".to_string(),
            sender: LedgerAddress([0u8; 20]),
            to: None,
            data: "{}".to_string(),
            gas_limit: 21_000,
            created: 0,
            nonce: None,
            signature: None,
            submitted_hash: None,
            last_gas_price: None,
            version: 0,
            confirmed: None,
            failure: None,
        };
        assert!(!row.is_complete());
        row.failure = Some("rejected".to_string());
        assert!(row.is_complete());
    }
}
