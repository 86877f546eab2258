//! Chain module - shared RPC connections for the three settlement legs
//!
//! Providers are created once per process and shared by every live run.

pub mod provider;

pub use provider::{ChainProvider, GasPrice};

use crate::config::{ChainRole, Settings};
use crate::error::{SettlementError, SettlementResult};

use async_trait::async_trait;
use dashmap::DashMap;
use ethers::types::{Address, Bytes};
use std::sync::Arc;
use tracing::{info, warn};

/// Read-only `eth_call` access to deployed contracts
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ContractReader: Send + Sync {
    async fn read_contract(&self, to: Address, data: Bytes) -> SettlementResult<Bytes>;
}

/// Health of a single connected chain
#[derive(Debug, Clone)]
pub struct ChainHealth {
    pub role: ChainRole,
    pub name: String,
    pub chain_id: u64,
    pub healthy: bool,
}

/// Manages connections to all configured chains
pub struct ChainManager {
    /// Chain providers indexed by settlement role
    providers: DashMap<ChainRole, Arc<ChainProvider>>,
}

impl ChainManager {
    /// Create providers for every chain that has RPC URLs configured
    pub fn new(settings: &Settings) -> Self {
        let providers = DashMap::new();

        for role in ChainRole::ALL {
            let Some(chain_config) = settings.chains.get(role) else {
                continue;
            };
            if chain_config.rpc_urls.iter().all(|u| u.trim().is_empty()) {
                warn!("Skipping {} chain {} - no RPC URLs configured", role, chain_config.name);
                continue;
            }

            match ChainProvider::new(role, chain_config.clone()) {
                Ok(provider) => {
                    info!(
                        "Initialized {} chain {} (ID: {})",
                        role, chain_config.name, chain_config.chain_id
                    );
                    providers.insert(role, Arc::new(provider));
                }
                Err(e) => warn!("Failed to initialize {} chain: {}", role, e),
            }
        }

        Self { providers }
    }

    /// Get provider for a settlement role
    pub fn get_provider(&self, role: ChainRole) -> SettlementResult<Arc<ChainProvider>> {
        self.providers
            .get(&role)
            .map(|p| p.clone())
            .ok_or_else(|| SettlementError::Configuration {
                missing: vec![format!("chains.{}.rpc_urls", role)],
            })
    }

    /// Health check for all chains
    pub async fn health_check(&self) -> Vec<ChainHealth> {
        let providers: Vec<Arc<ChainProvider>> =
            self.providers.iter().map(|e| e.value().clone()).collect();

        let mut results = Vec::new();
        for provider in providers {
            let healthy = provider.health_check().await;
            crate::metrics::record_chain_health(provider.name(), healthy);
            results.push(ChainHealth {
                role: provider.role(),
                name: provider.name().to_string(),
                chain_id: provider.chain_id(),
                healthy,
            });
        }

        results
    }

    /// Get all connected chain roles
    pub fn connected_chains(&self) -> Vec<ChainRole> {
        ChainRole::ALL
            .into_iter()
            .filter(|role| self.providers.contains_key(role))
            .collect()
    }
}
