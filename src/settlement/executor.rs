//! Chain side of a settlement run
//!
//! The orchestrator drives the same four steps in both modes; what a step does
//! is decided by the [`ChainExecutor`] picked for the run.

use super::Mode;
use crate::chain::{ChainManager, ChainProvider, ContractReader};
use crate::config::{ChainRole, Settings};
use crate::deal::{address_to_hex, keccak256, parse_address, Deal};
use crate::error::{or_abort, SettlementError, SettlementResult};
use crate::events::{deal_processed_filter, released_filter};
use crate::tx::TransactionSender;
use crate::watcher::{EventWatcher, LogSource, WatchWindow};

use async_trait::async_trait;
use ethers::abi::Token;
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address, Bytes, H256, U256};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Detail reported when an observation window closes without a match
pub const NOT_YET_OBSERVED: &str = "not yet observed, may still be processing";

/// Result of watching for a downstream effect
#[derive(Debug, Clone, PartialEq)]
pub enum Observation {
    Observed {
        tx_hash: H256,
        block_number: Option<u64>,
    },
    /// Window closed; the effect may still land later
    Pending { detail: String },
}

#[async_trait]
pub trait ChainExecutor: Send + Sync {
    /// Checks that need the chains, run before the checkout gate
    async fn preflight(&self, deal: &Deal, cancel: &CancellationToken) -> SettlementResult<()>;

    async fn approve(&self, deal: &Deal, cancel: &CancellationToken) -> SettlementResult<H256>;

    async fn deposit(
        &self,
        deal: &Deal,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> SettlementResult<H256>;

    async fn observe_orchestration(
        &self,
        deal: &Deal,
        cancel: &CancellationToken,
    ) -> SettlementResult<Observation>;

    async fn observe_delivery(
        &self,
        deal: &Deal,
        cancel: &CancellationToken,
    ) -> SettlementResult<Observation>;
}

/// Picks the executor for a run
pub trait ExecutorProvider: Send + Sync {
    fn executor_for(&self, mode: Mode) -> SettlementResult<Box<dyn ChainExecutor>>;
}

async fn pause(delay: Duration, cancel: &CancellationToken) -> SettlementResult<()> {
    tokio::select! {
        _ = tokio::time::sleep(delay) => Ok(()),
        _ = cancel.cancelled() => Err(SettlementError::StreamAbort),
    }
}

/// ABI-encode a call: 4-byte selector followed by the encoded arguments
pub fn calldata(signature: &str, args: &[Token]) -> Bytes {
    let mut data = keccak256(signature.as_bytes())[..4].to_vec();
    data.extend(ethers::abi::encode(args));
    Bytes::from(data)
}

/// Fixed delays and deterministic fake hashes; never touches a chain
pub struct SimulatedExecutor {
    step_delay: Duration,
}

impl SimulatedExecutor {
    pub fn new(step_delay: Duration) -> Self {
        Self { step_delay }
    }

    fn synthetic_hash(deal: &Deal, step: &str) -> H256 {
        let mut seed = deal.deal_id.as_bytes().to_vec();
        seed.extend_from_slice(step.as_bytes());
        H256::from(keccak256(&seed))
    }

    async fn step(&self, deal: &Deal, step: &str, cancel: &CancellationToken) -> SettlementResult<H256> {
        pause(self.step_delay, cancel).await?;
        Ok(Self::synthetic_hash(deal, step))
    }
}

#[async_trait]
impl ChainExecutor for SimulatedExecutor {
    async fn preflight(&self, _deal: &Deal, _cancel: &CancellationToken) -> SettlementResult<()> {
        Ok(())
    }

    async fn approve(&self, deal: &Deal, cancel: &CancellationToken) -> SettlementResult<H256> {
        self.step(deal, "approve", cancel).await
    }

    async fn deposit(
        &self,
        deal: &Deal,
        _payload: Bytes,
        cancel: &CancellationToken,
    ) -> SettlementResult<H256> {
        self.step(deal, "deposit", cancel).await
    }

    async fn observe_orchestration(
        &self,
        deal: &Deal,
        cancel: &CancellationToken,
    ) -> SettlementResult<Observation> {
        let tx_hash = self.step(deal, "orchestrate", cancel).await?;
        Ok(Observation::Observed {
            tx_hash,
            block_number: None,
        })
    }

    async fn observe_delivery(
        &self,
        deal: &Deal,
        cancel: &CancellationToken,
    ) -> SettlementResult<Observation> {
        let tx_hash = self.step(deal, "deliver", cancel).await?;
        Ok(Observation::Observed {
            tx_hash,
            block_number: None,
        })
    }
}

/// Contract addresses a live run talks to
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LiveContracts {
    pub payment_token: Address,
    pub gateway: Address,
    pub router: Address,
    pub escrow: Address,
    pub nft: Address,
}

impl LiveContracts {
    pub fn from_settings(settings: &Settings) -> SettlementResult<Self> {
        Ok(Self {
            payment_token: configured_address(settings, ChainRole::Origin, "payment_token")?,
            gateway: configured_address(settings, ChainRole::Origin, "gateway")?,
            router: configured_address(settings, ChainRole::Intermediary, "router")?,
            escrow: configured_address(settings, ChainRole::Destination, "escrow")?,
            nft: configured_address(settings, ChainRole::Destination, "nft")?,
        })
    }
}

fn configured_address(settings: &Settings, role: ChainRole, key: &str) -> SettlementResult<Address> {
    let path = format!("chains.{}.{}", role, key);
    let value = settings
        .chains
        .get(role)
        .and_then(|chain| chain.contract(key))
        .ok_or_else(|| SettlementError::Configuration {
            missing: vec![path.clone()],
        })?;
    parse_address(&path, value).map_err(|e| SettlementError::InvalidConfig(e.to_string()))
}

/// Blocks to start watching from, captured just before the deposit
#[derive(Debug, Default, Clone, Copy)]
struct StartBlocks {
    intermediary: Option<u64>,
    destination: Option<u64>,
}

/// Real transactions and log observation across the three chains
///
/// Only the origin leg signs; the other two are read through [`LogSource`]
/// and [`ContractReader`].
pub struct LiveExecutor {
    origin: Arc<ChainProvider>,
    intermediary: Arc<dyn LogSource>,
    destination: Arc<dyn LogSource>,
    destination_reader: Arc<dyn ContractReader>,
    contracts: LiveContracts,
    sender: Arc<TransactionSender>,
    wallet: LocalWallet,
    watcher: Arc<dyn EventWatcher>,
    window: WatchWindow,
    receipt_timeout: Duration,
    start_blocks: Mutex<StartBlocks>,
}

impl LiveExecutor {
    async fn submit_and_confirm(
        &self,
        to: Address,
        data: Bytes,
        cancel: &CancellationToken,
    ) -> SettlementResult<H256> {
        let tx_hash = self
            .sender
            .submit(&self.origin, &self.wallet, to, data, cancel)
            .await?;
        self.sender
            .wait_for_receipt(
                &self.origin,
                tx_hash,
                self.receipt_timeout,
                self.window.poll_interval,
                cancel,
            )
            .await?;

        Ok(tx_hash)
    }

    async fn start_block(
        &self,
        source: &dyn LogSource,
        leg: &str,
        captured: Option<u64>,
        cancel: &CancellationToken,
    ) -> SettlementResult<u64> {
        if let Some(block) = captured {
            return Ok(block);
        }
        match or_abort(cancel, source.latest_block()).await {
            Ok(block) => Ok(block),
            Err(SettlementError::StreamAbort) => Err(SettlementError::StreamAbort),
            Err(e) => {
                warn!("No start block on the {} chain, watching from genesis: {}", leg, e);
                Ok(0)
            }
        }
    }

    /// `ownerOf(tokenId)` on the destination asset
    async fn owner_of(
        &self,
        token_id: U256,
        cancel: &CancellationToken,
    ) -> SettlementResult<Address> {
        let data = calldata("ownerOf(uint256)", &[Token::Uint(token_id)]);
        let output = or_abort(
            cancel,
            self.destination_reader.read_contract(self.contracts.nft, data),
        )
        .await?;
        if output.len() < 32 {
            return Err(SettlementError::Internal(format!(
                "ownerOf returned {} bytes",
                output.len()
            )));
        }
        Ok(Address::from_slice(&output[12..32]))
    }
}

#[async_trait]
impl ChainExecutor for LiveExecutor {
    async fn preflight(&self, deal: &Deal, cancel: &CancellationToken) -> SettlementResult<()> {
        if deal.polygon_escrow != self.contracts.escrow {
            return Err(SettlementError::invalid_field(
                "polygonEscrow",
                format!(
                    "deal targets {} but the destination escrow is {}",
                    address_to_hex(&deal.polygon_escrow),
                    address_to_hex(&self.contracts.escrow)
                ),
            ));
        }
        if deal.nft != self.contracts.nft {
            return Err(SettlementError::invalid_field(
                "nft",
                format!(
                    "deal targets {} but the destination asset is {}",
                    address_to_hex(&deal.nft),
                    address_to_hex(&self.contracts.nft)
                ),
            ));
        }

        let signer = self.wallet.address();
        if signer != deal.buyer {
            warn!(
                "Deal {} buyer {} differs from signer {}",
                deal.short_id(),
                address_to_hex(&deal.buyer),
                address_to_hex(&signer)
            );
        }

        let balance = or_abort(cancel, self.origin.get_balance(signer)).await?;
        if balance.is_zero() {
            return Err(SettlementError::Configuration {
                missing: vec![format!(
                    "funded buyer wallet {} on {}",
                    address_to_hex(&signer),
                    self.origin.name()
                )],
            });
        }

        // Fail before the gate if a leg is unreachable
        or_abort(cancel, self.intermediary.latest_block()).await?;
        or_abort(cancel, self.destination.latest_block()).await?;
        Ok(())
    }

    async fn approve(&self, deal: &Deal, cancel: &CancellationToken) -> SettlementResult<H256> {
        let data = calldata(
            "approve(address,uint256)",
            &[Token::Address(self.contracts.gateway), Token::Uint(deal.price)],
        );
        self.submit_and_confirm(self.contracts.payment_token, data, cancel)
            .await
    }

    async fn deposit(
        &self,
        deal: &Deal,
        payload: Bytes,
        cancel: &CancellationToken,
    ) -> SettlementResult<H256> {
        {
            let mut start = self.start_blocks.lock().await;
            start.intermediary = or_abort(cancel, self.intermediary.latest_block()).await.ok();
            start.destination = or_abort(cancel, self.destination.latest_block()).await.ok();
            debug!("Watch start blocks for {}: {:?}", deal.short_id(), *start);
        }

        let data = calldata(
            "depositAndCall(address,uint256,address,bytes)",
            &[
                Token::Address(self.contracts.router),
                Token::Uint(deal.price),
                Token::Address(self.contracts.payment_token),
                Token::Bytes(payload.to_vec()),
            ],
        );
        self.submit_and_confirm(self.contracts.gateway, data, cancel)
            .await
    }

    async fn observe_orchestration(
        &self,
        deal: &Deal,
        cancel: &CancellationToken,
    ) -> SettlementResult<Observation> {
        let captured = self.start_blocks.lock().await.intermediary;
        let from = self
            .start_block(self.intermediary.as_ref(), "intermediary", captured, cancel)
            .await?;
        let filter = deal_processed_filter(self.contracts.router, deal);

        let observed = self
            .watcher
            .poll_for_event(self.intermediary.as_ref(), filter, from, self.window, cancel)
            .await;

        match observed {
            Some(event) => Ok(Observation::Observed {
                tx_hash: event.tx_hash,
                block_number: Some(event.block_number),
            }),
            None if cancel.is_cancelled() => Err(SettlementError::StreamAbort),
            None => Err(SettlementError::ObservationTimeout {
                operation: "DealProcessed".to_string(),
            }),
        }
    }

    async fn observe_delivery(
        &self,
        deal: &Deal,
        cancel: &CancellationToken,
    ) -> SettlementResult<Observation> {
        let captured = self.start_blocks.lock().await.destination;
        let from = self
            .start_block(self.destination.as_ref(), "destination", captured, cancel)
            .await?;
        let filter = released_filter(self.contracts.escrow, deal);

        let observed = self
            .watcher
            .poll_for_event(self.destination.as_ref(), filter, from, self.window, cancel)
            .await;

        if let Some(event) = observed {
            return Ok(Observation::Observed {
                tx_hash: event.tx_hash,
                block_number: Some(event.block_number),
            });
        }
        if cancel.is_cancelled() {
            return Err(SettlementError::StreamAbort);
        }

        match self.owner_of(deal.token_id, cancel).await {
            Ok(owner) if owner == deal.buyer => Ok(Observation::Pending {
                detail: format!(
                    "Released not observed, but the buyer already owns token #{}",
                    deal.token_id
                ),
            }),
            Ok(owner) => Ok(Observation::Pending {
                detail: format!(
                    "{}; token #{} owned by {}",
                    NOT_YET_OBSERVED,
                    deal.token_id,
                    address_to_hex(&owner)
                ),
            }),
            Err(SettlementError::StreamAbort) => Err(SettlementError::StreamAbort),
            Err(e) => {
                warn!("ownerOf fallback failed for {}: {}", deal.short_id(), e);
                Err(SettlementError::ObservationTimeout {
                    operation: "Released".to_string(),
                })
            }
        }
    }
}

/// Builds a simulated executor or a live one from the shared chain connections
pub struct DefaultExecutorProvider {
    settings: Arc<Settings>,
    chain_manager: Arc<ChainManager>,
    sender: Arc<TransactionSender>,
    watcher: Arc<dyn EventWatcher>,
}

impl DefaultExecutorProvider {
    pub fn new(
        settings: Arc<Settings>,
        chain_manager: Arc<ChainManager>,
        sender: Arc<TransactionSender>,
        watcher: Arc<dyn EventWatcher>,
    ) -> Self {
        Self {
            settings,
            chain_manager,
            sender,
            watcher,
        }
    }

    fn live(&self) -> SettlementResult<LiveExecutor> {
        let contracts = LiveContracts::from_settings(&self.settings)?;
        let wallet = TransactionSender::load_wallet(&self.settings.wallet)?;
        let settlement = &self.settings.settlement;

        info!(
            "Live executor for buyer {} on {:?}",
            address_to_hex(&wallet.address()),
            self.chain_manager.connected_chains()
        );

        let destination = self.chain_manager.get_provider(ChainRole::Destination)?;

        Ok(LiveExecutor {
            origin: self.chain_manager.get_provider(ChainRole::Origin)?,
            intermediary: self.chain_manager.get_provider(ChainRole::Intermediary)?,
            destination: destination.clone(),
            destination_reader: destination,
            contracts,
            sender: self.sender.clone(),
            wallet,
            watcher: self.watcher.clone(),
            window: WatchWindow {
                timeout: settlement.observe_timeout(),
                poll_interval: settlement.poll_interval(),
            },
            receipt_timeout: settlement.receipt_timeout(),
            start_blocks: Mutex::new(StartBlocks::default()),
        })
    }
}

impl ExecutorProvider for DefaultExecutorProvider {
    fn executor_for(&self, mode: Mode) -> SettlementResult<Box<dyn ChainExecutor>> {
        match mode {
            Mode::Simulate => Ok(Box::new(SimulatedExecutor::new(
                self.settings.settlement.simulate_step_delay(),
            ))),
            Mode::Testnet => Ok(Box::new(self.live()?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::MockContractReader;
    use crate::config::{ChainConfig, GasPriceStrategy};
    use crate::deal::tests::sample_deal;
    use crate::events::tests::log_with;
    use crate::events::topics;
    use crate::tx::NonceManager;
    use crate::watcher::{MockLogSource, PollingWatcher};
    use tokio::time::Instant;

    const TEST_KEY: &str = "0x59c6995e998f97a5a0044966f0945389dc9e86dae88c7a8412f4603b6b78690d";

    /// Origin leg that is never reached by the observation paths
    fn idle_origin() -> Arc<ChainProvider> {
        let config = ChainConfig {
            chain_id: 84532,
            name: "base-sepolia".to_string(),
            rpc_urls: vec!["http://127.0.0.1:1".to_string()],
            gas_price_strategy: GasPriceStrategy::Eip1559,
            max_gas_price_gwei: 50,
            payment_token: None,
            gateway: None,
            router: None,
            escrow: None,
            nft: None,
        };
        Arc::new(ChainProvider::new(ChainRole::Origin, config).unwrap())
    }

    fn quiet_chain(head: u64) -> MockLogSource {
        let mut source = MockLogSource::new();
        source.expect_latest_block().returning(move || Ok(head));
        source.expect_logs().returning(|_| Ok(vec![]));
        source
    }

    fn live_executor(
        intermediary: MockLogSource,
        destination: MockLogSource,
        reader: MockContractReader,
    ) -> LiveExecutor {
        let deal = sample_deal();
        LiveExecutor {
            origin: idle_origin(),
            intermediary: Arc::new(intermediary),
            destination: Arc::new(destination),
            destination_reader: Arc::new(reader),
            contracts: LiveContracts {
                payment_token: Address::repeat_byte(0x11),
                gateway: Address::repeat_byte(0x12),
                router: Address::repeat_byte(0x13),
                escrow: deal.polygon_escrow,
                nft: deal.nft,
            },
            sender: Arc::new(TransactionSender::new(Arc::new(NonceManager::new()))),
            wallet: TEST_KEY.parse().unwrap(),
            watcher: Arc::new(PollingWatcher),
            window: WatchWindow {
                timeout: Duration::from_secs(3),
                poll_interval: Duration::from_secs(1),
            },
            receipt_timeout: Duration::from_secs(10),
            start_blocks: Mutex::new(StartBlocks::default()),
        }
    }

    fn owner_of_returns(owner: Address) -> MockContractReader {
        let nft = sample_deal().nft;
        let mut reader = MockContractReader::new();
        reader
            .expect_read_contract()
            .withf(move |to, data| *to == nft && data[..4] == [0x63, 0x52, 0x21, 0x1e])
            .times(1)
            .returning(move |_, _| {
                Ok(Bytes::from(ethers::abi::encode(&[Token::Address(owner)])))
            });
        reader
    }

    #[test]
    fn test_calldata_selectors() {
        let approve = calldata(
            "approve(address,uint256)",
            &[Token::Address(Address::repeat_byte(1)), Token::Uint(U256::from(5u64))],
        );
        assert_eq!(&approve[..4], &[0x09, 0x5e, 0xa7, 0xb3]);
        assert_eq!(approve.len(), 4 + 64);

        let owner = calldata("ownerOf(uint256)", &[Token::Uint(U256::from(42u64))]);
        assert_eq!(&owner[..4], &[0x63, 0x52, 0x21, 0x1e]);
    }

    #[test]
    fn test_deposit_calldata_carries_payload() {
        let deal = sample_deal();
        let payload = crate::deal::encode_deal_payload(&deal);
        let data = calldata(
            "depositAndCall(address,uint256,address,bytes)",
            &[
                Token::Address(Address::repeat_byte(2)),
                Token::Uint(deal.price),
                Token::Address(Address::repeat_byte(3)),
                Token::Bytes(payload.to_vec()),
            ],
        );
        // selector, four head words, length word, payload
        assert_eq!(data.len(), 4 + 4 * 32 + 32 + 256);
        assert_eq!(&data[data.len() - 256..], payload.as_ref());
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_steps_are_deterministic() {
        let executor = SimulatedExecutor::new(Duration::from_millis(800));
        let deal = sample_deal();
        let cancel = CancellationToken::new();

        let started = Instant::now();
        let first = executor.approve(&deal, &cancel).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(800));

        assert_eq!(first, executor.approve(&deal, &cancel).await.unwrap());
        assert_ne!(
            first,
            executor.deposit(&deal, Bytes::new(), &cancel).await.unwrap()
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_step_aborts() {
        let executor = SimulatedExecutor::new(Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.observe_delivery(&sample_deal(), &cancel).await;
        assert_eq!(result, Err(SettlementError::StreamAbort));
    }

    #[test]
    fn test_testnet_executor_requires_configuration() {
        let settings = Arc::new(Settings::default());
        let provider = DefaultExecutorProvider::new(
            settings.clone(),
            Arc::new(ChainManager::new(&settings)),
            Arc::new(TransactionSender::new(Arc::new(NonceManager::new()))),
            Arc::new(PollingWatcher),
        );

        assert!(provider.executor_for(Mode::Simulate).is_ok());
        match provider.executor_for(Mode::Testnet) {
            Err(SettlementError::Configuration { missing }) => {
                assert_eq!(missing, vec!["chains.origin.payment_token"])
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("testnet executor without configuration"),
        }
    }

    #[test]
    fn test_invalid_configured_address() {
        let settings = Settings::from_toml_str(
            r#"
[chains.origin]
chain_id = 84532
name = "base-sepolia"
payment_token = "0x1234"
"#,
        )
        .unwrap();

        assert!(matches!(
            LiveContracts::from_settings(&settings),
            Err(SettlementError::InvalidConfig(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_orchestration_reports_observed_event() {
        let deal = sample_deal();
        let mut intermediary = MockLogSource::new();
        intermediary.expect_latest_block().returning(|| Ok(500));
        intermediary.expect_logs().returning(|_| {
            Ok(vec![log_with(
                vec![*topics::DEAL_PROCESSED, sample_deal().deal_id],
                501,
                H256::repeat_byte(0xab),
            )])
        });
        let executor =
            live_executor(intermediary, MockLogSource::new(), MockContractReader::new());

        let observation = executor
            .observe_orchestration(&deal, &CancellationToken::new())
            .await;
        assert_eq!(
            observation,
            Ok(Observation::Observed {
                tx_hash: H256::repeat_byte(0xab),
                block_number: Some(501),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_orchestration_miss_is_an_observation_timeout() {
        let executor = live_executor(
            quiet_chain(500),
            MockLogSource::new(),
            MockContractReader::new(),
        );

        let result = executor
            .observe_orchestration(&sample_deal(), &CancellationToken::new())
            .await;
        match result {
            Err(e) => {
                assert_eq!(
                    e,
                    SettlementError::ObservationTimeout {
                        operation: "DealProcessed".into()
                    }
                );
                assert!(!e.is_fatal());
            }
            Ok(other) => panic!("expected a timeout, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_miss_reports_buyer_ownership() {
        let deal = sample_deal();
        let executor = live_executor(
            MockLogSource::new(),
            quiet_chain(900),
            owner_of_returns(deal.buyer),
        );

        match executor.observe_delivery(&deal, &CancellationToken::new()).await {
            Ok(Observation::Pending { detail }) => {
                assert!(detail.contains("buyer already owns token #42"), "{}", detail)
            }
            other => panic!("expected pending delivery, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_miss_reports_other_owner() {
        let other = Address::repeat_byte(0x77);
        let executor = live_executor(
            MockLogSource::new(),
            quiet_chain(900),
            owner_of_returns(other),
        );

        match executor
            .observe_delivery(&sample_deal(), &CancellationToken::new())
            .await
        {
            Ok(Observation::Pending { detail }) => {
                assert!(detail.starts_with(NOT_YET_OBSERVED), "{}", detail);
                assert!(detail.contains(&address_to_hex(&other)), "{}", detail);
            }
            other => panic!("expected pending delivery, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_delivery_falls_back_to_timeout_when_owner_lookup_fails() {
        let mut reader = MockContractReader::new();
        reader.expect_read_contract().times(1).returning(|_, _| {
            Err(SettlementError::ChainConnection {
                chain: "polygon-amoy".into(),
                message: "execution reverted".into(),
            })
        });
        let executor = live_executor(MockLogSource::new(), quiet_chain(900), reader);

        let result = executor
            .observe_delivery(&sample_deal(), &CancellationToken::new())
            .await;
        assert_eq!(
            result,
            Err(SettlementError::ObservationTimeout {
                operation: "Released".into()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_delivery_skips_owner_lookup() {
        let mut reader = MockContractReader::new();
        reader.expect_read_contract().never();
        let executor = live_executor(MockLogSource::new(), quiet_chain(900), reader);

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(1_500)).await;
            trigger.cancel();
        });

        let result = executor.observe_delivery(&sample_deal(), &cancel).await;
        assert_eq!(result, Err(SettlementError::StreamAbort));
    }

    #[tokio::test]
    async fn test_preflight_rejects_foreign_escrow() {
        let executor = live_executor(
            MockLogSource::new(),
            MockLogSource::new(),
            MockContractReader::new(),
        );
        let mut fields = crate::deal::tests::sample_fields();
        fields.polygon_escrow = Address::repeat_byte(0x99);
        let deal = crate::deal::create_deal(fields);

        let result = executor.preflight(&deal, &CancellationToken::new()).await;
        assert!(matches!(
            result,
            Err(SettlementError::InvalidField { ref field, .. }) if field == "polygonEscrow"
        ));
    }

    #[tokio::test]
    async fn test_cancelled_preflight_stops_before_rpc() {
        let mut intermediary = MockLogSource::new();
        intermediary.expect_latest_block().never();
        let executor = live_executor(
            intermediary,
            MockLogSource::new(),
            MockContractReader::new(),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor.preflight(&sample_deal(), &cancel).await;
        assert_eq!(result, Err(SettlementError::StreamAbort));
    }
}
