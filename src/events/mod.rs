//! Contract event types, filters and parsing
//!
//! Settlement observes two events:
//! - `DealProcessed(bytes32 indexed dealId)` from the intermediary router
//! - `Released(address indexed nft, uint256 indexed tokenId, address indexed buyer)`
//!   from the destination escrow

use crate::deal::Deal;
use crate::error::{SettlementError, SettlementResult};

use ethers::prelude::*;
use serde::Serialize;

/// Events the settlement engine correlates against
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum ContractEvent {
    /// The intermediary router processed a deal
    DealProcessed {
        deal_id: H256,
        block_number: u64,
        tx_hash: H256,
    },

    /// The escrow released an asset to the buyer
    Released {
        nft: Address,
        token_id: U256,
        buyer: Address,
        block_number: u64,
        tx_hash: H256,
    },

    /// Unknown event
    Unknown {
        topic: H256,
        block_number: u64,
        tx_hash: H256,
    },
}

impl ContractEvent {
    /// Get event name for metrics and narration
    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::DealProcessed { .. } => "DealProcessed",
            ContractEvent::Released { .. } => "Released",
            ContractEvent::Unknown { .. } => "unknown",
        }
    }
}

/// Event topic signatures (keccak256 of event signature)
pub mod topics {
    use crate::deal::keccak256;
    use ethers::types::H256;
    use lazy_static::lazy_static;

    pub const DEAL_PROCESSED_SIGNATURE: &str = "DealProcessed(bytes32)";
    pub const RELEASED_SIGNATURE: &str = "Released(address,uint256,address)";

    lazy_static! {
        pub static ref DEAL_PROCESSED: H256 = H256::from(keccak256(DEAL_PROCESSED_SIGNATURE.as_bytes()));
        pub static ref RELEASED: H256 = H256::from(keccak256(RELEASED_SIGNATURE.as_bytes()));
    }
}

pub fn address_topic(address: Address) -> H256 {
    H256::from(address)
}

pub fn uint_topic(value: U256) -> H256 {
    let mut word = [0u8; 32];
    value.to_big_endian(&mut word);
    H256::from(word)
}

/// Filter for the router's processed event, correlated by deal id
pub fn deal_processed_filter(router: Address, deal: &Deal) -> Filter {
    Filter::new()
        .address(router)
        .topic0(*topics::DEAL_PROCESSED)
        .topic1(deal.deal_id)
}

/// Filter for the escrow's release event, correlated by (nft, tokenId, buyer)
pub fn released_filter(escrow: Address, deal: &Deal) -> Filter {
    Filter::new()
        .address(escrow)
        .topic0(*topics::RELEASED)
        .topic1(address_topic(deal.nft))
        .topic2(uint_topic(deal.token_id))
        .topic3(address_topic(deal.buyer))
}

/// Parse a log entry into a ContractEvent
pub fn parse_log(log: &Log) -> SettlementResult<ContractEvent> {
    let block_number = log.block_number.map(|b| b.as_u64()).unwrap_or(0);
    let tx_hash = log.transaction_hash.unwrap_or_default();
    let topic = log.topics.first().copied().unwrap_or_default();

    let indexed = |idx: usize| {
        log.topics.get(idx).copied().ok_or_else(|| {
            SettlementError::Internal(format!("log {:?} missing topic {}", tx_hash, idx))
        })
    };

    if topic == *topics::DEAL_PROCESSED {
        return Ok(ContractEvent::DealProcessed {
            deal_id: indexed(1)?,
            block_number,
            tx_hash,
        });
    }

    if topic == *topics::RELEASED {
        return Ok(ContractEvent::Released {
            nft: Address::from_slice(&indexed(1)?.0[12..32]),
            token_id: U256::from_big_endian(indexed(2)?.as_bytes()),
            buyer: Address::from_slice(&indexed(3)?.0[12..32]),
            block_number,
            tx_hash,
        });
    }

    Ok(ContractEvent::Unknown {
        topic,
        block_number,
        tx_hash,
    })
}
