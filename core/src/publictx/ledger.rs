//! The base-ledger client contract.
//!
//! The shared ledger is an external collaborator: it accepts signed
//! submissions into one nonce space per sender, eventually confirms
//! them at a block location, and emits events the domains interpret.
//! The orchestrator only ever talks through this trait, so tests bring
//! a programmable mock chain.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Classified, ErrorKind};
use crate::types::{LedgerAddress, LedgerEvent};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum LedgerError {
    /// The chain holds a same-nonce transaction at a higher price; the
    /// orchestrator reacts with a further gas bump.
    #[error("replacement transaction underpriced")]
    Underpriced,

    /// The nonce was already consumed on chain.
    #[error("nonce too low")]
    NonceTooLow,

    /// Permanent rejection of this submission.
    #[error("transaction rejected: {0}")]
    Rejected(String),

    /// The ledger endpoint is unreachable; safe to re-drive.
    #[error("base ledger unavailable: {0}")]
    Unavailable(String),
}

impl Classified for LedgerError {
    fn kind(&self) -> ErrorKind {
        match self {
            Self::Rejected(_) | Self::NonceTooLow => ErrorKind::InputValidation,
            Self::Underpriced | Self::Unavailable(_) => ErrorKind::Transient,
        }
    }
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// A fully signed submission ready for the chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedSubmission {
    pub sender: LedgerAddress,
    pub nonce: u64,
    pub gas_price: u128,
    pub gas_limit: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<LedgerAddress>,
    /// Call payload JSON text.
    pub data: String,
    /// Signature over the canonical submission encoding.
    pub signature: Vec<u8>,
}

impl SignedSubmission {
    /// The canonical bytes the signature covers: every consensus field,
    /// excluding the signature itself.
    pub fn signing_payload(
        sender: &LedgerAddress,
        nonce: u64,
        gas_limit: u64,
        to: Option<&LedgerAddress>,
        data: &str,
    ) -> Vec<u8> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(nonce.to_be_bytes());
        hasher.update(gas_limit.to_be_bytes());
        if let Some(to) = to {
            hasher.update(to.as_bytes());
        }
        hasher.update(data.as_bytes());
        hasher.finalize().to_vec()
    }
}

/// Where a confirmed transaction landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxLocation {
    pub block: u64,
    pub tx_index: u64,
    pub success: bool,
    /// For deploys: the created contract address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract_address: Option<LedgerAddress>,
}

// ---------------------------------------------------------------------------
// BaseLedger
// ---------------------------------------------------------------------------

#[async_trait]
pub trait BaseLedger: Send + Sync {
    /// Spendable balance of a sender address.
    async fn balance(&self, sender: &LedgerAddress) -> Result<u128, LedgerError>;

    /// Highest confirmed nonce for a sender, or `None` if it has never
    /// transacted — the recovery baseline for the nonce allocator.
    async fn confirmed_nonce(&self, sender: &LedgerAddress) -> Result<Option<u64>, LedgerError>;

    /// Current market gas price.
    async fn gas_price(&self) -> Result<u128, LedgerError>;

    /// Submit; returns the chain transaction hash. Re-submitting the
    /// same nonce with a higher price replaces the earlier submission.
    async fn submit(&self, submission: &SignedSubmission) -> Result<String, LedgerError>;

    /// Confirmation status of a submitted hash.
    async fn transaction_location(&self, tx_hash: &str) -> Result<Option<TxLocation>, LedgerError>;

    /// Events after `from_block` (exclusive); returns the new cursor.
    async fn events_since(&self, from_block: u64)
        -> Result<(u64, Vec<LedgerEvent>), LedgerError>;
}
