//! Available-to-spend gating.
//!
//! An in-flight transaction may only be submitted when the sender's
//! balance covers its worst-case cost *plus* the cost reserved by every
//! transaction ahead of it in the queue. On a zero-gas-price chain the
//! gate is always open.

use std::sync::Arc;

use super::ledger::{BaseLedger, LedgerError};
use crate::types::LedgerAddress;

pub struct BalanceManager {
    ledger: Arc<dyn BaseLedger>,
}

impl BalanceManager {
    pub fn new(ledger: Arc<dyn BaseLedger>) -> Self {
        Self { ledger }
    }

    /// Worst-case cost of a submission at a given price.
    pub fn cost(gas_limit: u64, gas_price: u128) -> u128 {
        gas_price.saturating_mul(gas_limit as u128)
    }

    /// Balance remaining after `reserved_ahead` (the summed cost of
    /// earlier queue entries) is set aside.
    pub async fn available_to_spend(
        &self,
        sender: &LedgerAddress,
        reserved_ahead: u128,
    ) -> Result<u128, LedgerError> {
        let balance = self.ledger.balance(sender).await?;
        Ok(balance.saturating_sub(reserved_ahead))
    }

    /// The admission decision.
    pub fn can_submit(cost: u128, available: u128) -> bool {
        cost == 0 || cost <= available
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::publictx::ledger::{SignedSubmission, TxLocation};
    use crate::types::LedgerEvent;

    struct FixedBalance(u128);

    #[async_trait]
    impl BaseLedger for FixedBalance {
        async fn balance(&self, _sender: &LedgerAddress) -> Result<u128, LedgerError> {
            Ok(self.0)
        }
        async fn confirmed_nonce(
            &self,
            _sender: &LedgerAddress,
        ) -> Result<Option<u64>, LedgerError> {
            Ok(None)
        }
        async fn gas_price(&self) -> Result<u128, LedgerError> {
            Ok(1)
        }
        async fn submit(&self, _submission: &SignedSubmission) -> Result<String, LedgerError> {
            Err(LedgerError::Unavailable("test".into()))
        }
        async fn transaction_location(
            &self,
            _tx_hash: &str,
        ) -> Result<Option<TxLocation>, LedgerError> {
            Ok(None)
        }
        async fn events_since(
            &self,
            from_block: u64,
        ) -> Result<(u64, Vec<LedgerEvent>), LedgerError> {
            Ok((from_block, vec![]))
        }
    }

    #[tokio::test]
    async fn available_subtracts_reservations() {
        let manager = BalanceManager::new(Arc::new(FixedBalance(1_000)));
        let sender = LedgerAddress([0u8; 20]);
        assert_eq!(manager.available_to_spend(&sender, 0).await.unwrap(), 1_000);
        assert_eq!(manager.available_to_spend(&sender, 400).await.unwrap(), 600);
        assert_eq!(manager.available_to_spend(&sender, 5_000).await.unwrap(), 0);
    }

    #[test]
    fn zero_cost_always_submits() {
        assert!(BalanceManager::can_submit(0, 0));
        assert!(BalanceManager::can_submit(100, 100));
        assert!(!BalanceManager::can_submit(101, 100));
    }

    #[test]
    fn cost_saturates() {
        assert_eq!(BalanceManager::cost(2, 10), 20);
        assert_eq!(BalanceManager::cost(u64::MAX, u128::MAX), u128::MAX);
    }
}
