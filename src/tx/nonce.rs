//! Nonce management for concurrent runs sharing a signer
//!
//! Two runs submitting from the same account at the same time would race for
//! the same nonce. Each (chain, signer) pair gets an async mutex that is held
//! from nonce allocation until the transaction has been broadcast.

use crate::error::SettlementResult;

use dashmap::DashMap;
use ethers::types::Address;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

/// Per-signer nonce state
#[derive(Debug, Default)]
struct SignerNonce {
    /// Next nonce to use; `None` forces a resync from chain
    next: Option<u64>,
}

/// Manages nonces across chains and signers
#[derive(Default)]
pub struct NonceManager {
    signers: DashMap<(u64, Address), Arc<Mutex<SignerNonce>>>,
}

/// Exclusive right to submit with one nonce
///
/// Dropping the lease without [`NonceLease::commit`] makes the next lease
/// resync from chain.
pub struct NonceLease {
    chain_id: u64,
    nonce: u64,
    committed: bool,
    guard: OwnedMutexGuard<SignerNonce>,
}

impl NonceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for the signer's slot and allocate its next nonce
    ///
    /// `fetch` is only called when no local nonce is known.
    pub async fn lease<F, Fut>(
        &self,
        chain_id: u64,
        address: Address,
        fetch: F,
    ) -> SettlementResult<NonceLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = SettlementResult<u64>>,
    {
        let slot = self
            .signers
            .entry((chain_id, address))
            .or_insert_with(|| Arc::new(Mutex::new(SignerNonce::default())))
            .clone();

        let mut guard = slot.lock_owned().await;
        let nonce = match guard.next {
            Some(nonce) => nonce,
            None => {
                let nonce = fetch().await?;
                debug!("Synced nonce {} for {:?} on chain {}", nonce, address, chain_id);
                nonce
            }
        };
        guard.next = Some(nonce);

        Ok(NonceLease {
            chain_id,
            nonce,
            committed: false,
            guard,
        })
    }
}

impl NonceLease {
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The transaction was broadcast; advance the local nonce
    pub fn commit(mut self) {
        self.guard.next = Some(self.nonce + 1);
        self.committed = true;
        debug!("Committed nonce {} on chain {}", self.nonce, self.chain_id);
    }
}

impl Drop for NonceLease {
    fn drop(&mut self) {
        if !self.committed {
            self.guard.next = None;
        }
    }
}
