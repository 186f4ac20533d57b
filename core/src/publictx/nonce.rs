//! Per-sender nonce allocation.
//!
//! Nonces are assigned in admission order and persisted with the row
//! as the Received stage's output *before* anything is signed or
//! submitted. Recovery therefore never needs allocator state: the next
//! nonce is one past the highest ever persisted for the sender, floored
//! by the chain's own confirmed nonce. A crash between allocation and
//! persistence simply re-allocates the same number — no gaps.

use parking_lot::Mutex;

/// Allocator for one sender's nonce space. Owned by that sender's
/// orchestrator; never shared.
#[derive(Debug)]
pub struct NonceAllocator {
    next: Mutex<u64>,
}

impl NonceAllocator {
    /// Rebuild from recovery inputs: the highest nonce persisted in our
    /// rows (if any) and the chain's highest confirmed nonce (if any).
    pub fn recover(highest_persisted: Option<u64>, chain_confirmed: Option<u64>) -> Self {
        let from_rows = highest_persisted.map(|n| n + 1).unwrap_or(0);
        let from_chain = chain_confirmed.map(|n| n + 1).unwrap_or(0);
        Self {
            next: Mutex::new(from_rows.max(from_chain)),
        }
    }

    /// Assign the next nonce. The caller must persist it before moving
    /// the owning transaction past Received.
    pub fn assign(&self) -> u64 {
        let mut next = self.next.lock();
        let nonce = *next;
        *next += 1;
        nonce
    }

    /// Peek without assigning (status surfaces).
    pub fn peek(&self) -> u64 {
        *self.next.lock()
    }
}
