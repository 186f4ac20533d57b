//! An in-memory base ledger for dev mode and tests.
//!
//! Confirms every acceptable submission into its own block, derives
//! contract addresses for deploys, and echoes deploy call data back as
//! `contract_deployment` events — the loop the domain manager's
//! registration path rides on. Tests can set balances, a minimum gas
//! price (to force escalation) and per-submission failures.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::types::{LedgerAddress, LedgerEvent};

use super::ledger::{BaseLedger, LedgerError, SignedSubmission, TxLocation};

#[derive(Default)]
struct ChainState {
    next_block: u64,
    balances: HashMap<LedgerAddress, u128>,
    /// Highest confirmed nonce per sender.
    confirmed_nonces: HashMap<LedgerAddress, u64>,
    /// Confirmed transactions by hash.
    confirmed: HashMap<String, TxLocation>,
    /// Hash submitted per (sender, nonce) — replacements overwrite.
    by_nonce: HashMap<(LedgerAddress, u64), String>,
    events: Vec<LedgerEvent>,
    /// Submissions below this price bounce with `Underpriced`.
    min_gas_price: u128,
    /// One-shot rejection injected by a test.
    fail_next: Option<LedgerError>,
    submission_count: u64,
}

pub struct DevChain {
    state: Mutex<ChainState>,
}

impl DevChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ChainState {
                next_block: 1,
                ..Default::default()
            }),
        })
    }

    /// Default balance handed to any sender never explicitly funded.
    const DEFAULT_BALANCE: u128 = u128::MAX / 2;

    pub fn set_balance(&self, sender: LedgerAddress, balance: u128) {
        self.state.lock().balances.insert(sender, balance);
    }

    /// Bounce submissions below this price with `Underpriced`.
    pub fn set_min_gas_price(&self, price: u128) {
        self.state.lock().min_gas_price = price;
    }

    /// Make the next submission fail with the given error.
    pub fn fail_next_submission(&self, error: LedgerError) {
        self.state.lock().fail_next = Some(error);
    }

    pub fn submission_count(&self) -> u64 {
        self.state.lock().submission_count
    }

    fn contract_address(sender: &LedgerAddress, nonce: u64) -> LedgerAddress {
        let mut hasher = Sha256::new();
        hasher.update(sender.as_bytes());
        hasher.update(nonce.to_be_bytes());
        let digest: [u8; 32] = hasher.finalize().into();
        let mut address = [0u8; 20];
        address.copy_from_slice(&digest[12..]);
        LedgerAddress(address)
    }
}

#[async_trait]
impl BaseLedger for DevChain {
    async fn balance(&self, sender: &LedgerAddress) -> Result<u128, LedgerError> {
        Ok(*self
            .state
            .lock()
            .balances
            .get(sender)
            .unwrap_or(&Self::DEFAULT_BALANCE))
    }

    async fn confirmed_nonce(&self, sender: &LedgerAddress) -> Result<Option<u64>, LedgerError> {
        Ok(self.state.lock().confirmed_nonces.get(sender).copied())
    }

    async fn gas_price(&self) -> Result<u128, LedgerError> {
        Ok(1)
    }

    async fn submit(&self, submission: &SignedSubmission) -> Result<String, LedgerError> {
        let mut state = self.state.lock();
        state.submission_count += 1;

        if let Some(error) = state.fail_next.take() {
            return Err(error);
        }
        if submission.gas_price < state.min_gas_price {
            return Err(LedgerError::Underpriced);
        }
        if let Some(confirmed) = state.confirmed_nonces.get(&submission.sender) {
            if submission.nonce <= *confirmed {
                return Err(LedgerError::NonceTooLow);
            }
        }

        let block = state.next_block;
        state.next_block += 1;
        let hash = format!("0x{}", hex::encode(Sha256::digest(
            [
                submission.sender.as_bytes(),
                &submission.nonce.to_be_bytes()[..],
                &block.to_be_bytes()[..],
            ]
            .concat(),
        )));

        let contract_address = match submission.to {
            Some(_) => None,
            None => Some(Self::contract_address(&submission.sender, submission.nonce)),
        };
        let location = TxLocation {
            block,
            tx_index: 0,
            success: true,
            contract_address,
        };

        // A replacement for the same nonce supersedes the earlier hash.
        if let Some(previous) = state
            .by_nonce
            .insert((submission.sender, submission.nonce), hash.clone())
        {
            state.confirmed.remove(&previous);
        }
        state.confirmed.insert(hash.clone(), location.clone());
        let highest = state
            .confirmed_nonces
            .entry(submission.sender)
            .or_insert(submission.nonce);
        if submission.nonce > *highest {
            *highest = submission.nonce;
        }

        // Deploys echo their call data as a deployment event.
        if let Some(address) = contract_address {
            let call: Value =
                serde_json::from_str(&submission.data).unwrap_or_else(|_| json!({}));
            state.events.push(LedgerEvent {
                block,
                tx_index: 0,
                address,
                data: json!({"type": "contract_deployment", "call": call}),
            });
            debug!(block, address = %address, "dev chain deployed contract");
        }

        Ok(hash)
    }

    async fn transaction_location(&self, tx_hash: &str) -> Result<Option<TxLocation>, LedgerError> {
        Ok(self.state.lock().confirmed.get(tx_hash).cloned())
    }

    async fn events_since(&self, from_block: u64) -> Result<(u64, Vec<LedgerEvent>), LedgerError> {
        let state = self.state.lock();
        let events: Vec<LedgerEvent> = state
            .events
            .iter()
            .filter(|e| e.block > from_block)
            .cloned()
            .collect();
        let cursor = state.next_block.saturating_sub(1).max(from_block);
        Ok((cursor, events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submission(sender: LedgerAddress, nonce: u64, gas_price: u128, deploy: bool) -> SignedSubmission {
        SignedSubmission {
            sender,
            nonce,
            gas_price,
            gas_limit: 21_000,
            to: (!deploy).then_some(LedgerAddress([7u8; 20])),
            data: r#"{"function":"constructor(string)","domain":"noto","inputs":{"notary":"NV"}}"#
                .to_string(),
            signature: vec![],
        }
    }

    #[tokio::test]
    async fn submissions_confirm_and_track_nonces() {
        let chain = DevChain::new();
        let sender = LedgerAddress([1u8; 20]);

        let hash = chain.submit(&submission(sender, 0, 1, false)).await.unwrap();
        let location = chain.transaction_location(&hash).await.unwrap().unwrap();
        assert!(location.success);
        assert_eq!(chain.confirmed_nonce(&sender).await.unwrap(), Some(0));

        // Replaying a consumed nonce bounces.
        let err = chain.submit(&submission(sender, 0, 1, false)).await.unwrap_err();
        assert!(matches!(err, LedgerError::NonceTooLow));
    }

    #[tokio::test]
    async fn deploys_emit_deployment_events() {
        let chain = DevChain::new();
        let sender = LedgerAddress([1u8; 20]);
        chain.submit(&submission(sender, 0, 1, true)).await.unwrap();

        let (cursor, events) = chain.events_since(0).await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(cursor >= events[0].block);
        assert_eq!(
            events[0].data.get("type").unwrap().as_str().unwrap(),
            "contract_deployment"
        );
        // The cursor advances past the event.
        let (_, later) = chain.events_since(cursor).await.unwrap();
        assert!(later.is_empty());
    }

    #[tokio::test]
    async fn min_gas_price_forces_escalation_path() {
        let chain = DevChain::new();
        chain.set_min_gas_price(100);
        let sender = LedgerAddress([1u8; 20]);

        let err = chain.submit(&submission(sender, 0, 99, false)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Underpriced));
        chain.submit(&submission(sender, 0, 100, false)).await.unwrap();
    }

    #[tokio::test]
    async fn injected_failure_fires_once() {
        let chain = DevChain::new();
        chain.fail_next_submission(LedgerError::Rejected("nope".to_string()));
        let sender = LedgerAddress([1u8; 20]);

        let err = chain.submit(&submission(sender, 0, 1, false)).await.unwrap_err();
        assert!(matches!(err, LedgerError::Rejected(_)));
        chain.submit(&submission(sender, 1, 1, false)).await.unwrap();
    }
}
