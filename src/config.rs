//! Configuration management for the settlement engine
//!
//! Loads configuration from a TOML file with environment variable substitution,
//! then layers `SETTLER__SECTION__KEY` environment overrides on top.

use crate::settlement::Mode;

use anyhow::{Context, Result};
use serde::Deserialize;
use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub settlement: SettlementConfig,
    #[serde(default)]
    pub chains: ChainsConfig,
    #[serde(default)]
    pub wallet: WalletConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            port: 9090,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    pub filter: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,deal_settler=debug,hyper=warn".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SettlementConfig {
    pub poll_interval_ms: u64,
    pub observe_timeout_ms: u64,
    pub receipt_timeout_ms: u64,
    pub simulate_step_delay_ms: u64,
    pub heartbeat_secs: u64,
    pub deal_ttl_secs: u64,
    /// Upstream engine base URL for the relay endpoint
    pub upstream_url: Option<String>,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 3_000,
            observe_timeout_ms: 120_000,
            receipt_timeout_ms: 90_000,
            simulate_step_delay_ms: 800,
            heartbeat_secs: 15,
            deal_ttl_secs: 3_600,
            upstream_url: None,
        }
    }
}

impl SettlementConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn observe_timeout(&self) -> Duration {
        Duration::from_millis(self.observe_timeout_ms)
    }

    pub fn receipt_timeout(&self) -> Duration {
        Duration::from_millis(self.receipt_timeout_ms)
    }

    pub fn simulate_step_delay(&self) -> Duration {
        Duration::from_millis(self.simulate_step_delay_ms)
    }

    pub fn heartbeat(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs.max(1))
    }
}

/// The three chains a settlement touches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChainRole {
    /// Buyer pays here (approve + deposit)
    Origin,
    /// Cross-chain router processes the deal here
    Intermediary,
    /// Escrow releases the asset here
    Destination,
}

impl ChainRole {
    pub const ALL: [ChainRole; 3] = [
        ChainRole::Origin,
        ChainRole::Intermediary,
        ChainRole::Destination,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChainRole::Origin => "origin",
            ChainRole::Intermediary => "intermediary",
            ChainRole::Destination => "destination",
        }
    }

    /// Contract keys that must be configured for live settlement
    pub fn required_contracts(&self) -> &'static [&'static str] {
        match self {
            ChainRole::Origin => &["payment_token", "gateway"],
            ChainRole::Intermediary => &["router"],
            ChainRole::Destination => &["escrow", "nft"],
        }
    }
}

impl fmt::Display for ChainRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChainsConfig {
    pub origin: Option<ChainConfig>,
    pub intermediary: Option<ChainConfig>,
    pub destination: Option<ChainConfig>,
}

impl ChainsConfig {
    pub fn get(&self, role: ChainRole) -> Option<&ChainConfig> {
        match role {
            ChainRole::Origin => self.origin.as_ref(),
            ChainRole::Intermediary => self.intermediary.as_ref(),
            ChainRole::Destination => self.destination.as_ref(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChainConfig {
    pub chain_id: u64,
    pub name: String,
    #[serde(default)]
    pub rpc_urls: Vec<String>,
    #[serde(default = "default_gas_price_strategy")]
    pub gas_price_strategy: GasPriceStrategy,
    #[serde(default = "default_max_gas_price_gwei")]
    pub max_gas_price_gwei: u64,
    #[serde(default)]
    pub payment_token: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
    #[serde(default)]
    pub router: Option<String>,
    #[serde(default)]
    pub escrow: Option<String>,
    #[serde(default)]
    pub nft: Option<String>,
}

fn default_gas_price_strategy() -> GasPriceStrategy {
    GasPriceStrategy::Eip1559
}

fn default_max_gas_price_gwei() -> u64 {
    200
}

impl ChainConfig {
    /// Look up a configured contract address by key, ignoring blanks
    pub fn contract(&self, key: &str) -> Option<&str> {
        let value = match key {
            "payment_token" => self.payment_token.as_deref(),
            "gateway" => self.gateway.as_deref(),
            "router" => self.router.as_deref(),
            "escrow" => self.escrow.as_deref(),
            "nft" => self.nft.as_deref(),
            _ => None,
        };
        value.map(str::trim).filter(|v| !v.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum GasPriceStrategy {
    Legacy,
    Eip1559,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    /// Name of the environment variable holding the buyer's private key
    pub buyer_key_env: String,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            buyer_key_env: "BUYER_PRIVATE_KEY".to_string(),
        }
    }
}

impl WalletConfig {
    pub fn buyer_key(&self) -> Option<String> {
        if self.buyer_key_env.trim().is_empty() {
            return None;
        }
        env::var(&self.buyer_key_env)
            .ok()
            .filter(|k| !k.trim().is_empty())
    }
}

impl Settings {
    /// Load settings from configuration files
    pub fn load() -> Result<Self> {
        let config_path = env::var("SETTLER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config/default.toml"));

        let config_str = std::fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {:?}", config_path))?;

        Self::from_toml_str(&config_str)
    }

    /// Parse settings from TOML text, applying env substitution and overrides
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config_str = substitute_env_vars(raw);

        let settings: Settings = config::Config::builder()
            .add_source(config::File::from_str(&config_str, config::FileFormat::Toml))
            .add_source(
                config::Environment::with_prefix("SETTLER")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()
            .context("Failed to assemble configuration")?
            .try_deserialize()
            .context("Failed to parse configuration")?;

        settings.validate()?;

        Ok(settings)
    }

    /// Validate configuration
    fn validate(&self) -> Result<()> {
        if self.settlement.poll_interval_ms == 0 {
            anyhow::bail!("settlement.poll_interval_ms must be greater than zero");
        }

        if self.settlement.observe_timeout_ms < self.settlement.poll_interval_ms {
            tracing::warn!(
                "settlement.observe_timeout_ms ({}) is shorter than one poll interval",
                self.settlement.observe_timeout_ms
            );
        }

        for role in ChainRole::ALL {
            if let Some(chain) = self.chains.get(role) {
                if chain.rpc_urls.is_empty() {
                    tracing::warn!(
                        "Chain {} ({}) has no RPC URLs - testnet mode unavailable",
                        role,
                        chain.name
                    );
                }
            }
        }

        Ok(())
    }

    /// List every configuration key the given mode requires but lacks
    pub fn missing_keys(&self, mode: Mode) -> Vec<String> {
        let mut missing = Vec::new();
        if mode == Mode::Simulate {
            return missing;
        }

        for role in ChainRole::ALL {
            match self.chains.get(role) {
                None => missing.push(format!("chains.{}", role)),
                Some(chain) => {
                    if chain.rpc_urls.iter().all(|u| u.trim().is_empty()) {
                        missing.push(format!("chains.{}.rpc_urls", role));
                    }
                    for key in role.required_contracts() {
                        if chain.contract(key).is_none() {
                            missing.push(format!("chains.{}.{}", role, key));
                        }
                    }
                }
            }
        }

        if self.wallet.buyer_key_env.trim().is_empty() {
            missing.push("wallet.buyer_key_env".to_string());
        } else if self.wallet.buyer_key().is_none() {
            missing.push(format!("env {}", self.wallet.buyer_key_env));
        }

        missing
    }
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(input: &str) -> String {
    let mut result = input.to_string();
    let re = regex::Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)\}").expect("static regex");

    for cap in re.captures_iter(input) {
        let var_name = &cap[1];
        let var_value = env::var(var_name).unwrap_or_default();
        result = result.replace(&cap[0], &var_value);
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const LIVE_CONFIG: &str = r#"
[api]
host = "127.0.0.1"
port = 8181

[settlement]
poll_interval_ms = 500
observe_timeout_ms = 5000

[chains.origin]
chain_id = 84532
name = "base-sepolia"
rpc_urls = ["https://sepolia.base.org"]
payment_token = "0x036CbD53842c5426634e7929541eC2318f3dCF7e"
gateway = "0x0c487a766110c85d301d96e33579c5b317fa4995"

[chains.intermediary]
chain_id = 7001
name = "zeta-athens"
rpc_urls = ["https://zetachain-athens-evm.blockpi.network/v1/rpc/public"]
router = "0x1111111111111111111111111111111111111111"

[chains.destination]
chain_id = 80002
name = "polygon-amoy"
rpc_urls = ["${SETTLER_TEST_AMOY_RPC}"]
escrow = "0x2222222222222222222222222222222222222222"
nft = "0x3333333333333333333333333333333333333333"

[wallet]
buyer_key_env = "SETTLER_TEST_BUYER_KEY_UNSET"
"#;

    #[test]
    fn test_env_var_substitution() {
        env::set_var("SETTLER_TEST_VAR", "test_value");
        let input = "url = \"https://api.example.com/${SETTLER_TEST_VAR}/endpoint\"";
        let result = substitute_env_vars(input);
        assert_eq!(result, "url = \"https://api.example.com/test_value/endpoint\"");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.api.port, 8080);
        assert_eq!(settings.settlement.poll_interval_ms, 3_000);
        assert_eq!(settings.wallet.buyer_key_env, "BUYER_PRIVATE_KEY");
        assert!(settings.missing_keys(Mode::Simulate).is_empty());
    }

    #[test]
    fn test_testnet_mode_lists_every_missing_key() {
        let settings = Settings::from_toml_str("[wallet]\nbuyer_key_env = \"\"\n").unwrap();
        let missing = settings.missing_keys(Mode::Testnet);
        assert_eq!(
            missing,
            vec![
                "chains.origin",
                "chains.intermediary",
                "chains.destination",
                "wallet.buyer_key_env",
            ]
        );
    }

    #[test]
    fn test_live_config_from_file() {
        env::set_var("SETTLER_TEST_AMOY_RPC", "https://rpc-amoy.polygon.technology");
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(LIVE_CONFIG.as_bytes()).unwrap();

        let raw = std::fs::read_to_string(file.path()).unwrap();
        let settings = Settings::from_toml_str(&raw).unwrap();

        assert_eq!(settings.api.port, 8181);
        let destination = settings.chains.get(ChainRole::Destination).unwrap();
        assert_eq!(destination.rpc_urls, vec!["https://rpc-amoy.polygon.technology"]);
        assert_eq!(
            destination.contract("escrow"),
            Some("0x2222222222222222222222222222222222222222")
        );

        // Only the signer is absent
        assert_eq!(
            settings.missing_keys(Mode::Testnet),
            vec!["env SETTLER_TEST_BUYER_KEY_UNSET"]
        );
    }

    #[test]
    fn test_blank_contract_counts_as_missing() {
        let raw = LIVE_CONFIG.replace(
            "router = \"0x1111111111111111111111111111111111111111\"",
            "router = \"  \"",
        );
        let settings = Settings::from_toml_str(&raw).unwrap();
        let missing = settings.missing_keys(Mode::Testnet);
        assert!(missing.contains(&"chains.intermediary.router".to_string()));
    }

    #[test]
    fn test_zero_poll_interval_rejected() {
        let err = Settings::from_toml_str("[settlement]\npoll_interval_ms = 0\n").unwrap_err();
        assert!(err.to_string().contains("poll_interval_ms"));
    }

    #[test]
    fn test_shipped_default_config_parses() {
        let settings = Settings::from_toml_str(include_str!("../config/default.toml")).unwrap();
        assert_eq!(settings.api.port, 8080);
        assert_eq!(settings.logging.format, LogFormat::Pretty);
        assert_eq!(settings.chains.origin.as_ref().map(|c| c.chain_id), Some(84532));
        assert_eq!(
            settings.chains.destination.as_ref().map(|c| c.gas_price_strategy.clone()),
            Some(GasPriceStrategy::Legacy)
        );
    }
}
