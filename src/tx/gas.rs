//! Gas estimation with safety buffers

use crate::chain::{ChainProvider, GasPrice};
use crate::error::SettlementResult;

use ethers::types::U256;
use tracing::debug;

/// Gas estimator for transactions
pub struct GasEstimator {
    /// Buffer percentage for gas limit (e.g., 20 = 20% buffer)
    gas_limit_buffer_percent: u64,
    /// Buffer percentage for gas price
    gas_price_buffer_percent: u64,
}

impl GasEstimator {
    pub fn new() -> Self {
        Self {
            gas_limit_buffer_percent: 20,
            gas_price_buffer_percent: 10,
        }
    }

    /// Pad a node's gas estimate
    pub fn buffered_gas_limit(&self, estimate: U256) -> U256 {
        estimate + estimate * self.gas_limit_buffer_percent / 100
    }

    /// Get buffered gas price for a chain
    pub async fn get_gas_price(&self, provider: &ChainProvider) -> SettlementResult<GasPrice> {
        let gas_price = self.buffer_price(provider.get_gas_price().await?);
        debug!("Gas price for chain {}: {:?}", provider.name(), gas_price);
        Ok(gas_price)
    }

    fn buffer_price(&self, gas_price: GasPrice) -> GasPrice {
        match gas_price {
            GasPrice::Legacy(price) => {
                let buffer = price * self.gas_price_buffer_percent / 100;
                GasPrice::Legacy(price + buffer)
            }
            GasPrice::Eip1559 {
                max_fee_per_gas,
                max_priority_fee_per_gas,
            } => {
                let fee_buffer = max_fee_per_gas * self.gas_price_buffer_percent / 100;
                let priority_buffer =
                    max_priority_fee_per_gas * self.gas_price_buffer_percent / 100;
                GasPrice::Eip1559 {
                    max_fee_per_gas: max_fee_per_gas + fee_buffer,
                    max_priority_fee_per_gas: max_priority_fee_per_gas + priority_buffer,
                }
            }
        }
    }
}

impl Default for GasEstimator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gas_limit_buffer() {
        let estimator = GasEstimator::new();
        assert_eq!(
            estimator.buffered_gas_limit(U256::from(100_000u64)),
            U256::from(120_000u64)
        );
    }

    #[test]
    fn test_price_buffer_applies_to_both_fee_fields() {
        let estimator = GasEstimator::new();
        assert_eq!(
            estimator.buffer_price(GasPrice::Legacy(U256::from(1_000u64))),
            GasPrice::Legacy(U256::from(1_100u64))
        );
        assert_eq!(
            estimator.buffer_price(GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(200u64),
                max_priority_fee_per_gas: U256::from(20u64),
            }),
            GasPrice::Eip1559 {
                max_fee_per_gas: U256::from(220u64),
                max_priority_fee_per_gas: U256::from(22u64),
            }
        );
    }
}
