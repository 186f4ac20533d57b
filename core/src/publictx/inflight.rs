//! The in-flight transaction state machine.
//!
//! Stages run strictly in order: *Received → Signing → Submitting →
//! Tracking → (Escalating | Confirmed | Failed)*. The rule that makes
//! crash recovery and updates sane: a stage's output is persisted to
//! the row before the machine advances, and the stage is re-derived
//! from the persisted outputs — a nonce means Received is done, a
//! signature means Signing is done, a submitted hash means we are
//! Tracking. Committed work is never redone.
//!
//! An update opens a new **version** (higher sequence) instead of
//! mutating the record: the old version keeps whatever it already
//! committed, while its not-yet-applied outputs are discarded — the
//! orchestrator checks [`InFlight::is_current_version`] after every
//! await before applying a result. A transaction is *removable* once
//! it is complete and every version has drained its pending output.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::LedgerAddress;

use super::ledger::TxLocation;
use super::PublicTxRow;

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxStage {
    Received,
    Signing,
    Submitting,
    Tracking,
    Escalating,
    Confirmed,
    Failed,
}

impl std::fmt::Display for TxStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Received => "received",
            Self::Signing => "signing",
            Self::Submitting => "submitting",
            Self::Tracking => "tracking",
            Self::Escalating => "escalating",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Versions
// ---------------------------------------------------------------------------

/// One version of the submission content. The first version is created
/// at admission; updates append.
#[derive(Debug, Clone)]
pub struct TxVersion {
    pub sequence: u32,
    pub to: Option<LedgerAddress>,
    /// Call payload JSON text.
    pub data: String,
    pub gas_limit: u64,
    pub current: bool,
    /// Signing-stage output for this version's content.
    pub signature: Option<Vec<u8>>,
    /// A produced-but-not-yet-persisted stage output.
    pub output_pending: bool,
}

// ---------------------------------------------------------------------------
// InFlight
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct InFlight {
    pub local_id: u64,
    pub from: String,
    pub sender: LedgerAddress,
    pub bindings: Vec<Uuid>,
    pub stage: TxStage,
    pub nonce: Option<u64>,
    pub submitted_hash: Option<String>,
    pub last_gas_price: Option<u128>,
    /// Not persisted: drives the escalation trigger.
    pub last_submit_at: Option<Instant>,
    pub versions: Vec<TxVersion>,
    pub confirmed: Option<TxLocation>,
    pub failure: Option<String>,
}

impl InFlight {
    /// Rebuild the machine from a persisted row: the stage is exactly
    /// what the committed outputs imply.
    pub fn from_row(row: &PublicTxRow, bindings: Vec<Uuid>) -> Self {
        let stage = if row.failure.is_some() {
            TxStage::Failed
        } else if row.confirmed.is_some() {
            TxStage::Confirmed
        } else if row.submitted_hash.is_some() {
            TxStage::Tracking
        } else if row.signature.is_some() {
            TxStage::Submitting
        } else if row.nonce.is_some() {
            TxStage::Signing
        } else {
            TxStage::Received
        };

        let signature = row
            .signature
            .as_ref()
            .and_then(|hex_sig| hex::decode(hex_sig.strip_prefix("0x").unwrap_or(hex_sig)).ok());

        Self {
            local_id: row.local_id,
            from: row.from.clone(),
            sender: row.sender,
            bindings,
            stage,
            nonce: row.nonce,
            submitted_hash: row.submitted_hash.clone(),
            last_gas_price: row.last_gas_price,
            last_submit_at: None,
            versions: vec![TxVersion {
                sequence: row.version,
                to: row.to,
                data: row.data.clone(),
                gas_limit: row.gas_limit,
                current: true,
                signature,
                output_pending: false,
            }],
            confirmed: row.confirmed.clone(),
            failure: row.failure.clone(),
        }
    }

    pub fn current_version(&self) -> &TxVersion {
        self.versions.last().expect("at least one version")
    }

    pub fn current_version_mut(&mut self) -> &mut TxVersion {
        self.versions.last_mut().expect("at least one version")
    }

    /// True if `sequence` still names the authoritative version — the
    /// check applied to every async result before it is believed.
    pub fn is_current_version(&self, sequence: u32) -> bool {
        self.current_version().sequence == sequence
    }

    /// Open a new version with updated content. Returns `false` (no
    /// version opened) once the transaction is complete.
    ///
    /// The nonce — and any committed stage output of earlier versions —
    /// stays authoritative; only the not-yet-signed content restarts,
    /// so the machine rewinds to Signing for the new content.
    pub fn new_version(&mut self, to: Option<LedgerAddress>, data: String, gas_limit: u64) -> bool {
        if self.is_complete() {
            return false;
        }
        let next_sequence = self.current_version().sequence + 1;
        self.current_version_mut().current = false;
        self.versions.push(TxVersion {
            sequence: next_sequence,
            to,
            data,
            gas_limit,
            current: true,
            signature: None,
            output_pending: false,
        });
        if self.nonce.is_some() {
            self.stage = TxStage::Signing;
        }
        true
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.stage, TxStage::Confirmed | TxStage::Failed)
    }

    /// Removable = complete and every version has drained its outputs.
    pub fn removable(&self) -> bool {
        self.is_complete() && self.versions.iter().all(|v| !v.output_pending)
    }

    pub fn mark_confirmed(&mut self, location: TxLocation) {
        self.confirmed = Some(location);
        self.stage = TxStage::Confirmed;
    }

    pub fn mark_failed(&mut self, reason: String) {
        self.failure = Some(reason);
        self.stage = TxStage::Failed;
    }
}

// ---------------------------------------------------------------------------
// Gas escalation
// ---------------------------------------------------------------------------

/// The next gas price after an escalation trigger: the last price
/// multiplied by `factor`, at least one unit higher, capped.
pub fn escalate_gas_price(last: u128, factor: f64, cap: u128) -> u128 {
    let scaled = (last as f64 * factor) as u128;
    scaled.max(last.saturating_add(1)).min(cap)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn row() -> PublicTxRow {
        PublicTxRow {
            local_id: 1,
            from: "seq".to_string(),
            sender: LedgerAddress([1u8; 20]),
            to: Some(LedgerAddress([2u8; 20])),
            data: r#"{"function":"transfer()"}"#.to_string(),
            gas_limit: 50_000,
            created: 0,
            nonce: None,
            signature: None,
            submitted_hash: None,
            last_gas_price: None,
            version: 0,
            confirmed: None,
            failure: None,
        }
    }

    // -- Stage recovery -----------------------------------------------------

    #[test]
    fn stage_derived_from_persisted_outputs() {
        let mut r = row();
        assert_eq!(InFlight::from_row(&r, vec![]).stage, TxStage::Received);

        r.nonce = Some(4);
        assert_eq!(InFlight::from_row(&r, vec![]).stage, TxStage::Signing);

        r.signature = Some("0x0102".to_string());
        assert_eq!(InFlight::from_row(&r, vec![]).stage, TxStage::Submitting);

        r.submitted_hash = Some("0xhash".to_string());
        assert_eq!(InFlight::from_row(&r, vec![]).stage, TxStage::Tracking);

        r.confirmed = Some(TxLocation {
            block: 5,
            tx_index: 0,
            success: true,
            contract_address: None,
        });
        assert_eq!(InFlight::from_row(&r, vec![]).stage, TxStage::Confirmed);

        let mut failed = row();
        failed.failure = Some("rejected".to_string());
        assert_eq!(InFlight::from_row(&failed, vec![]).stage, TxStage::Failed);
    }

    // -- Versions -----------------------------------------------------------

    #[test]
    fn update_opens_version_and_rewinds_to_signing() {
        let mut r = row();
        r.nonce = Some(3);
        r.signature = Some("0x01".to_string());
        r.submitted_hash = Some("0xaa".to_string());
        let mut inflight = InFlight::from_row(&r, vec![]);
        assert_eq!(inflight.stage, TxStage::Tracking);

        let opened = inflight.new_version(r.to, r#"{"function":"updated()"}"#.to_string(), 60_000);
        assert!(opened);
        assert_eq!(inflight.versions.len(), 2);
        assert_eq!(inflight.stage, TxStage::Signing, "new content must re-sign");
        assert_eq!(inflight.nonce, Some(3), "the nonce is never re-allocated");
        assert!(inflight.current_version().signature.is_none());
        assert!(!inflight.versions[0].current);

        // The old version's sequence is now stale.
        assert!(!inflight.is_current_version(0));
        assert!(inflight.is_current_version(1));
    }

    #[test]
    fn completed_transaction_refuses_updates() {
        let mut r = row();
        r.failure = Some("done".to_string());
        let mut inflight = InFlight::from_row(&r, vec![]);
        assert!(!inflight.new_version(None, "{}".to_string(), 1));
        assert_eq!(inflight.versions.len(), 1);
    }

    #[test]
    fn removable_requires_drained_versions() {
        let mut inflight = InFlight::from_row(&row(), vec![]);
        inflight.mark_confirmed(TxLocation {
            block: 1,
            tx_index: 0,
            success: true,
            contract_address: None,
        });
        assert!(inflight.removable());

        inflight.current_version_mut().output_pending = true;
        assert!(!inflight.removable());
        inflight.current_version_mut().output_pending = false;
        assert!(inflight.removable());
    }

    // -- Escalation ---------------------------------------------------------

    #[test]
    fn escalation_multiplies_and_caps() {
        assert_eq!(escalate_gas_price(100, 1.5, 1_000), 150);
        assert_eq!(escalate_gas_price(900, 1.5, 1_000), 1_000);
        // Always at least one unit up, even with factor 1.0.
        assert_eq!(escalate_gas_price(100, 1.0, 1_000), 101);
    }
}
