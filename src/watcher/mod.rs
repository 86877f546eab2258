//! Chain event watcher
//!
//! Looks for a single matching event within a bounded window. Absence is a
//! soft outcome: `None` means "not yet observed", the transaction may still be
//! in flight.

use crate::error::SettlementResult;
use crate::events::{parse_log, ContractEvent};

use async_trait::async_trait;
use ethers::types::{Filter, Log, H256};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Read access to a chain's logs
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LogSource: Send + Sync {
    async fn latest_block(&self) -> SettlementResult<u64>;

    async fn logs(&self, filter: &Filter) -> SettlementResult<Vec<Log>>;
}

/// A matching log found by the watcher
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedEvent {
    pub tx_hash: H256,
    pub block_number: u64,
    pub event: ContractEvent,
}

impl ObservedEvent {
    fn from_log(log: &Log) -> Self {
        let tx_hash = log.transaction_hash.unwrap_or_default();
        let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
        let event = parse_log(log).unwrap_or_else(|e| {
            warn!("Matched log could not be parsed: {}", e);
            ContractEvent::Unknown {
                topic: log.topics.first().copied().unwrap_or_default(),
                block_number,
                tx_hash,
            }
        });

        Self {
            tx_hash,
            block_number,
            event,
        }
    }
}

/// Observation window for one watch
#[derive(Debug, Clone, Copy)]
pub struct WatchWindow {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Finds an event matching a filter, or gives up after the window
#[async_trait]
pub trait EventWatcher: Send + Sync {
    async fn poll_for_event(
        &self,
        source: &dyn LogSource,
        filter: Filter,
        start_block: u64,
        window: WatchWindow,
        abort: &CancellationToken,
    ) -> Option<ObservedEvent>;
}

/// `eth_getLogs` polling over an advancing block range
#[derive(Debug, Default, Clone, Copy)]
pub struct PollingWatcher;

#[async_trait]
impl EventWatcher for PollingWatcher {
    async fn poll_for_event(
        &self,
        source: &dyn LogSource,
        filter: Filter,
        start_block: u64,
        window: WatchWindow,
        abort: &CancellationToken,
    ) -> Option<ObservedEvent> {
        let deadline = Instant::now() + window.timeout;
        let mut from_block = start_block;

        loop {
            if abort.is_cancelled() {
                return None;
            }

            match within_window(source.latest_block(), deadline, abort).await? {
                Ok(latest) if latest >= from_block => {
                    let range = filter.clone().from_block(from_block).to_block(latest);
                    debug!("Querying logs in blocks {} to {}", from_block, latest);

                    match within_window(source.logs(&range), deadline, abort).await? {
                        Ok(logs) => {
                            if let Some(log) = logs.first() {
                                let observed = ObservedEvent::from_log(log);
                                crate::metrics::record_event(&observed.event);
                                return Some(observed);
                            }
                            // Never query the same blocks twice
                            from_block = latest + 1;
                        }
                        Err(e) => warn!("Failed to get logs, will retry range: {}", e),
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("Failed to get latest block: {}", e),
            }

            let now = Instant::now();
            if now >= deadline {
                return None;
            }

            let nap = window.poll_interval.min(deadline - now);
            tokio::select! {
                _ = tokio::time::sleep(nap) => {}
                _ = abort.cancelled() => return None,
            }
        }
    }
}

/// Run one RPC call inside the watch window
///
/// `None` when the window closes or the watch is aborted first; a stalled
/// node must not hold the watch open.
async fn within_window<T>(
    call: impl Future<Output = T>,
    deadline: Instant,
    abort: &CancellationToken,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = abort.cancelled() => None,
        result = tokio::time::timeout_at(deadline, call) => match result {
            Ok(value) => Some(value),
            Err(_) => {
                debug!("Watch window closed during RPC call");
                None
            }
        },
    }
}
