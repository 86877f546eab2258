//! Chain provider with multi-RPC support and automatic failover

use super::ContractReader;
use crate::config::{ChainConfig, ChainRole, GasPriceStrategy};
use crate::error::{SettlementError, SettlementResult};
use crate::watcher::LogSource;

use async_trait::async_trait;
use ethers::prelude::*;
use ethers::providers::{Http, Provider};
use ethers::types::transaction::eip2718::TypedTransaction;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tracing::{debug, error, warn};

/// Multi-provider wrapper with automatic failover
pub struct ChainProvider {
    /// Which leg of the settlement this chain serves
    role: ChainRole,
    /// Chain configuration
    config: ChainConfig,
    /// HTTP providers (multiple for failover)
    http_providers: Vec<Provider<Http>>,
    /// Current active provider index
    current_provider: AtomicUsize,
}

impl ChainProvider {
    /// Create a new chain provider
    pub fn new(role: ChainRole, config: ChainConfig) -> SettlementResult<Self> {
        let mut http_providers = Vec::new();

        for url in config.rpc_urls.iter().filter(|u| !u.trim().is_empty()) {
            match Provider::<Http>::try_from(url.as_str()) {
                Ok(provider) => {
                    let provider = provider.interval(Duration::from_millis(250));
                    http_providers.push(provider);
                    debug!("Added HTTP provider for {} chain {}: {}", role, config.name, url);
                }
                Err(e) => {
                    warn!("Failed to create provider for {}: {}", url, e);
                }
            }
        }

        if http_providers.is_empty() {
            return Err(SettlementError::ChainConnection {
                chain: config.name.clone(),
                message: "No valid RPC providers".to_string(),
            });
        }

        Ok(Self {
            role,
            config,
            http_providers,
            current_provider: AtomicUsize::new(0),
        })
    }

    /// Get the active HTTP provider
    pub fn http(&self) -> &Provider<Http> {
        let idx = self.current_provider.load(Ordering::Relaxed);
        &self.http_providers[idx % self.http_providers.len()]
    }

    /// Switch to next available provider
    pub fn failover(&self) {
        let current = self.current_provider.load(Ordering::Relaxed);
        let next = (current + 1) % self.http_providers.len();
        self.current_provider.store(next, Ordering::Relaxed);
        if self.http_providers.len() > 1 {
            warn!("Chain {} failover to provider {}", self.config.name, next);
        }
    }

    fn connection_error(&self, message: impl Into<String>) -> SettlementError {
        SettlementError::ChainConnection {
            chain: self.config.name.clone(),
            message: message.into(),
        }
    }

    /// Get current block number with failover
    pub async fn get_block_number(&self) -> SettlementResult<u64> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_block_number().await {
                Ok(block) => {
                    let block_num = block.as_u64();
                    crate::metrics::record_block_height(self.name(), block_num);
                    return Ok(block_num);
                }
                Err(e) => {
                    warn!("Failed to get block number from chain {}: {}", self.config.name, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed"))
    }

    /// Get logs for a filter
    pub async fn get_logs(&self, filter: &Filter) -> SettlementResult<Vec<Log>> {
        for _ in 0..self.http_providers.len() {
            match self.http().get_logs(filter).await {
                Ok(logs) => return Ok(logs),
                Err(e) => {
                    warn!("Failed to get logs from chain {}: {}", self.config.name, e);
                    self.failover();
                }
            }
        }

        Err(self.connection_error("All providers failed to get logs"))
    }

    /// Get transaction receipt
    pub async fn get_transaction_receipt(
        &self,
        tx_hash: H256,
    ) -> SettlementResult<Option<TransactionReceipt>> {
        self.http()
            .get_transaction_receipt(tx_hash)
            .await
            .map_err(|e| self.connection_error(e.to_string()))
    }

    /// Next nonce for an account, counting pending transactions
    pub async fn get_transaction_count(&self, address: Address) -> SettlementResult<u64> {
        self.http()
            .get_transaction_count(address, Some(BlockId::Number(BlockNumber::Pending)))
            .await
            .map(|n| n.as_u64())
            .map_err(|e| SettlementError::Nonce {
                chain_id: self.config.chain_id,
                message: e.to_string(),
            })
    }

    /// Native balance of an account
    pub async fn get_balance(&self, address: Address) -> SettlementResult<U256> {
        self.http()
            .get_balance(address, None)
            .await
            .map_err(|e| self.connection_error(e.to_string()))
    }

    /// Read-only contract call
    pub async fn call(&self, to: Address, data: Bytes) -> SettlementResult<Bytes> {
        let tx: TypedTransaction = TransactionRequest::new().to(to).data(data).into();
        self.http()
            .call(&tx, None)
            .await
            .map_err(|e| self.connection_error(e.to_string()))
    }

    /// Estimate gas for a transaction; a failed estimate means the call would revert
    pub async fn estimate_gas(&self, tx: &TypedTransaction) -> SettlementResult<U256> {
        self.http()
            .estimate_gas(tx, None)
            .await
            .map_err(|e| SettlementError::Submission {
                chain: self.config.name.clone(),
                reason: format!("gas estimation failed: {}", e),
            })
    }

    /// Broadcast a signed transaction
    pub async fn send_raw_transaction(&self, raw: Bytes) -> SettlementResult<H256> {
        self.http()
            .send_raw_transaction(raw)
            .await
            .map(|pending| pending.tx_hash())
            .map_err(|e| SettlementError::Submission {
                chain: self.config.name.clone(),
                reason: e.to_string(),
            })
    }

    /// Get current gas price based on chain strategy
    pub async fn get_gas_price(&self) -> SettlementResult<GasPrice> {
        match self.config.gas_price_strategy {
            GasPriceStrategy::Legacy => {
                let price = self
                    .http()
                    .get_gas_price()
                    .await
                    .map_err(|e| self.connection_error(e.to_string()))?;
                Ok(GasPrice::Legacy(price))
            }
            GasPriceStrategy::Eip1559 => {
                let (max_fee, priority_fee) = self.estimate_eip1559_fees().await?;
                Ok(GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee,
                    max_priority_fee_per_gas: priority_fee,
                })
            }
        }
    }

    /// Estimate EIP-1559 fees
    async fn estimate_eip1559_fees(&self) -> SettlementResult<(U256, U256)> {
        let block = self
            .http()
            .get_block(BlockNumber::Latest)
            .await
            .map_err(|e| self.connection_error(e.to_string()))?
            .ok_or_else(|| self.connection_error("No latest block"))?;

        let base_fee = block
            .base_fee_per_gas
            .ok_or_else(|| self.connection_error("No base fee in block"))?;

        let priority_fee = U256::from(2_000_000_000u64); // 2 gwei

        // Max fee = 2 * base_fee + priority_fee
        let max_fee = base_fee * 2 + priority_fee;

        let max_gwei = U256::from(self.config.max_gas_price_gwei) * U256::from(1_000_000_000u64);
        let max_fee = std::cmp::min(max_fee, max_gwei);

        Ok((max_fee, std::cmp::min(priority_fee, max_fee)))
    }

    /// Health check
    pub async fn health_check(&self) -> bool {
        match self.get_block_number().await {
            Ok(_) => true,
            Err(e) => {
                error!("Health check failed for chain {}: {}", self.config.name, e);
                false
            }
        }
    }

    pub fn role(&self) -> ChainRole {
        self.role
    }

    pub fn chain_id(&self) -> u64 {
        self.config.chain_id
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }
}

#[async_trait]
impl LogSource for ChainProvider {
    async fn latest_block(&self) -> SettlementResult<u64> {
        self.get_block_number().await
    }

    async fn logs(&self, filter: &Filter) -> SettlementResult<Vec<Log>> {
        self.get_logs(filter).await
    }
}

#[async_trait]
impl ContractReader for ChainProvider {
    async fn read_contract(&self, to: Address, data: Bytes) -> SettlementResult<Bytes> {
        self.call(to, data).await
    }
}

/// Gas price types
#[derive(Debug, Clone, PartialEq)]
pub enum GasPrice {
    Legacy(U256),
    Eip1559 {
        max_fee_per_gas: U256,
        max_priority_fee_per_gas: U256,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain_config(rpc_urls: Vec<&str>) -> ChainConfig {
        ChainConfig {
            chain_id: 84532,
            name: "base-sepolia".to_string(),
            rpc_urls: rpc_urls.into_iter().map(String::from).collect(),
            gas_price_strategy: GasPriceStrategy::Eip1559,
            max_gas_price_gwei: 50,
            payment_token: None,
            gateway: None,
            router: None,
            escrow: None,
            nft: None,
        }
    }

    #[test]
    fn test_provider_requires_rpc_url() {
        let err = ChainProvider::new(ChainRole::Origin, chain_config(vec![])).err();
        assert!(matches!(err, Some(SettlementError::ChainConnection { .. })));
    }

    #[test]
    fn test_failover_rotates_providers() {
        let provider = ChainProvider::new(
            ChainRole::Origin,
            chain_config(vec!["http://127.0.0.1:1", "http://127.0.0.1:2"]),
        )
        .unwrap();

        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 1);
        provider.failover();
        assert_eq!(provider.current_provider.load(Ordering::Relaxed), 0);
        assert_eq!(provider.role(), ChainRole::Origin);
        assert_eq!(provider.chain_id(), 84532);
    }
}
