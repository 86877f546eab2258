//! Transaction signing, broadcast and receipt tracking

use super::gas::GasEstimator;
use super::nonce::NonceManager;
use crate::chain::{ChainProvider, GasPrice};
use crate::config::WalletConfig;
use crate::error::{or_abort, SettlementError, SettlementResult};

use ethers::prelude::*;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Signs and broadcasts transactions for live settlement runs
pub struct TransactionSender {
    /// Shared across runs so concurrent runs of one buyer get distinct nonces
    nonce_manager: Arc<NonceManager>,
    /// Gas estimator
    gas_estimator: GasEstimator,
    /// Upper bound for a single broadcast call
    send_timeout: Duration,
}

impl TransactionSender {
    pub fn new(nonce_manager: Arc<NonceManager>) -> Self {
        Self {
            nonce_manager,
            gas_estimator: GasEstimator::new(),
            send_timeout: Duration::from_secs(30),
        }
    }

    /// Load the buyer wallet from the configured environment variable
    pub fn load_wallet(config: &WalletConfig) -> SettlementResult<LocalWallet> {
        let key = config.buyer_key().ok_or_else(|| SettlementError::Configuration {
            missing: vec![format!("env {}", config.buyer_key_env)],
        })?;

        key.trim()
            .parse::<LocalWallet>()
            .map_err(|e| SettlementError::Wallet(format!("Invalid private key: {}", e)))
    }

    /// Sign and broadcast a contract call, returning its hash
    ///
    /// A call that would revert fails at gas estimation, before a nonce is
    /// consumed. Cancellation releases the signer's nonce slot; a broadcast
    /// cut short that way leaves the nonce to be resynced from chain.
    pub async fn submit(
        &self,
        provider: &ChainProvider,
        wallet: &LocalWallet,
        to: Address,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> SettlementResult<H256> {
        if cancel.is_cancelled() {
            return Err(SettlementError::StreamAbort);
        }

        let chain_id = provider.chain_id();
        let wallet = wallet.clone().with_chain_id(chain_id);
        let from = wallet.address();

        let lease = or_abort(
            cancel,
            self.nonce_manager
                .lease(chain_id, from, || provider.get_transaction_count(from)),
        )
        .await?;

        let gas_price = or_abort(cancel, self.gas_estimator.get_gas_price(provider)).await?;
        let mut tx = build_transaction(from, to, data, lease.nonce(), &gas_price, chain_id);

        let estimate = or_abort(cancel, provider.estimate_gas(&tx)).await?;
        tx.set_gas(self.gas_estimator.buffered_gas_limit(estimate));

        let signature = wallet
            .sign_transaction(&tx)
            .await
            .map_err(|e| SettlementError::Wallet(e.to_string()))?;
        let raw = tx.rlp_signed(&signature);

        let broadcast = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(
                    "Run cancelled while broadcasting nonce {} on {}",
                    lease.nonce(),
                    provider.name()
                );
                return Err(SettlementError::StreamAbort);
            }
            result = timeout(self.send_timeout, provider.send_raw_transaction(raw)) => result,
        };

        let tx_hash = match broadcast {
            Ok(Ok(hash)) => hash,
            Ok(Err(e)) => {
                crate::metrics::record_tx_failed(provider.name());
                if e.to_string().contains("nonce too low") {
                    warn!("Nonce too low on {}, will resync", provider.name());
                    return Err(SettlementError::Nonce {
                        chain_id,
                        message: "Nonce too low".to_string(),
                    });
                }
                return Err(e);
            }
            Err(_) => {
                crate::metrics::record_tx_failed(provider.name());
                return Err(SettlementError::Submission {
                    chain: provider.name().to_string(),
                    reason: format!("broadcast timed out after {}s", self.send_timeout.as_secs()),
                });
            }
        };

        info!(
            "Transaction sent on {}: {:?} (nonce {})",
            provider.name(),
            tx_hash,
            lease.nonce()
        );
        lease.commit();
        crate::metrics::record_tx_submitted(provider.name());

        Ok(tx_hash)
    }

    /// Poll for a receipt until it appears, the deadline passes or the run is cancelled
    ///
    /// A reverted receipt and a missing receipt are both submission failures.
    pub async fn wait_for_receipt(
        &self,
        provider: &ChainProvider,
        tx_hash: H256,
        max_wait: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> SettlementResult<TransactionReceipt> {
        let deadline = Instant::now() + max_wait;

        loop {
            if cancel.is_cancelled() {
                return Err(SettlementError::StreamAbort);
            }

            match provider.get_transaction_receipt(tx_hash).await {
                Ok(Some(receipt)) => {
                    if receipt.status == Some(U64::zero()) {
                        crate::metrics::record_tx_failed(provider.name());
                        return Err(SettlementError::Submission {
                            chain: provider.name().to_string(),
                            reason: format!("transaction {:?} reverted", tx_hash),
                        });
                    }
                    debug!(
                        "Receipt for {:?} in block {:?}",
                        tx_hash, receipt.block_number
                    );
                    return Ok(receipt);
                }
                Ok(None) => {}
                Err(e) => warn!("Failed to get receipt for {:?}: {}", tx_hash, e),
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(SettlementError::Submission {
                    chain: provider.name().to_string(),
                    reason: format!(
                        "no receipt for {:?} within {}s",
                        tx_hash,
                        max_wait.as_secs()
                    ),
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(poll_interval.min(deadline - now)) => {}
                _ = cancel.cancelled() => return Err(SettlementError::StreamAbort),
            }
        }
    }
}

/// Build an unsigned call with the chain's fee model; gas limit is set later
pub fn build_transaction(
    from: Address,
    to: Address,
    data: Bytes,
    nonce: u64,
    gas_price: &GasPrice,
    chain_id: u64,
) -> TypedTransaction {
    match gas_price {
        GasPrice::Legacy(price) => TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .nonce(nonce)
            .gas_price(*price)
            .chain_id(chain_id)
            .into(),
        GasPrice::Eip1559 {
            max_fee_per_gas,
            max_priority_fee_per_gas,
        } => Eip1559TransactionRequest::new()
            .from(from)
            .to(to)
            .data(data)
            .nonce(nonce)
            .max_fee_per_gas(*max_fee_per_gas)
            .max_priority_fee_per_gas(*max_priority_fee_per_gas)
            .chain_id(chain_id)
            .into(),
    }
}
