use std::collections::HashMap;
use std::sync::Arc;

use alloy::primitives::Address;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Locally tracked next nonce for one sub-wallet. `None` until primed from
/// `eth_getTransactionCount`.
#[derive(Debug, Default)]
pub struct NonceSlot {
    next: Option<u64>,
}

impl NonceSlot {
    pub fn current(&self) -> Option<u64> {
        self.next
    }

    pub fn prime(&mut self, on_chain: u64) -> u64 {
        *self.next.get_or_insert(on_chain)
    }

    /// Advance only after `eth_sendRawTransaction` accepted the tx. A send
    /// that never reached the mempool leaves the slot untouched, which is
    /// the rollback path.
    pub fn advance(&mut self, used: u64) {
        self.next = Some(used + 1);
    }

    /// Drop local state so the next send re-reads the chain, e.g. after an
    /// endpoint disagreed about the account nonce.
    pub fn reset(&mut self) {
        self.next = None;
    }
}

/// One mutex per sub-wallet. Holding the slot across sign+send is what
/// keeps outbound transactions of a wallet strictly nonce-ordered even when
/// two actions were planned concurrently.
#[derive(Default)]
pub struct NonceTracker {
    slots: Mutex<HashMap<Address, Arc<Mutex<NonceSlot>>>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn lock(&self, address: Address) -> OwnedMutexGuard<NonceSlot> {
        let slot = {
            let mut map = self.slots.lock().await;
            map.entry(address).or_default().clone()
        };
        slot.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn nonces_advance_only_on_send_success() {
        let tracker = NonceTracker::new();
        let addr = Address::repeat_byte(1);

        let mut slot = tracker.lock(addr).await;
        assert_eq!(slot.prime(7), 7);
        // Simulated failed send: no advance.
        drop(slot);

        let mut slot = tracker.lock(addr).await;
        assert_eq!(slot.prime(7), 7);
        slot.advance(7);
        drop(slot);

        let mut slot = tracker.lock(addr).await;
        assert_eq!(slot.prime(99), 8, "primed slot ignores later chain reads");
    }

    #[tokio::test]
    async fn accepted_nonces_form_contiguous_prefix() {
        let tracker = NonceTracker::new();
        let addr = Address::repeat_byte(2);
        let mut accepted = Vec::new();

        for _ in 0..5 {
            let mut slot = tracker.lock(addr).await;
            let nonce = slot.prime(0);
            accepted.push(nonce);
            slot.advance(nonce);
        }

        assert_eq!(accepted, vec![0, 1, 2, 3, 4]);
    }
}
