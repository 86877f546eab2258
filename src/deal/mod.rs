//! Deal identity and wire representation
//!
//! A deal is identified by the keccak256 hash of the ABI tuple encoding of its
//! seven terms. The client preview, the server preparer and the receiving
//! contract all hash the same tuple, so the layout here must never change:
//!
//! `(address buyer, address sellerBase, address polygonEscrow, address nft,
//!   uint256 tokenId, uint256 price, uint256 deadline)`

pub mod codec;
pub mod price;

pub use codec::{decode_deal_payload, encode_deal_payload, payload_from_hex, payload_to_hex};
pub use price::{format_price, parse_price};

use crate::error::{SettlementError, SettlementResult};

use ethers::abi::Token;
use ethers::types::{Address, H256, U256};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};

/// The seven agreed terms that feed the deal hash
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DealFields {
    pub buyer: Address,
    pub seller_base: Address,
    pub polygon_escrow: Address,
    pub nft: Address,
    pub token_id: U256,
    /// Payment amount with 6 implied decimals
    pub price: U256,
    /// Unix seconds
    pub deadline: U256,
}

impl DealFields {
    fn tokens(&self) -> Vec<Token> {
        vec![
            Token::Address(self.buyer),
            Token::Address(self.seller_base),
            Token::Address(self.polygon_escrow),
            Token::Address(self.nft),
            Token::Uint(self.token_id),
            Token::Uint(self.price),
            Token::Uint(self.deadline),
        ]
    }
}

/// An agreed deal bound to its content hash
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "DealWire", into = "DealWire")]
pub struct Deal {
    pub deal_id: H256,
    pub buyer: Address,
    pub seller_base: Address,
    pub polygon_escrow: Address,
    pub nft: Address,
    pub token_id: U256,
    pub price: U256,
    pub deadline: U256,
}

impl Deal {
    pub fn fields(&self) -> DealFields {
        DealFields {
            buyer: self.buyer,
            seller_base: self.seller_base,
            polygon_escrow: self.polygon_escrow,
            nft: self.nft,
            token_id: self.token_id,
            price: self.price,
            deadline: self.deadline,
        }
    }

    /// Recompute the hash and reject the deal if any term was altered
    pub fn verify(&self) -> SettlementResult<()> {
        let computed = compute_deal_id(&self.fields());
        if computed != self.deal_id {
            return Err(SettlementError::invalid_field(
                "dealId",
                format!(
                    "does not match deal terms (expected {}, got {})",
                    hash_to_hex(&computed),
                    hash_to_hex(&self.deal_id)
                ),
            ));
        }
        Ok(())
    }

    /// Abbreviated id for narration, e.g. `0x1a2b3c4d…`
    pub fn short_id(&self) -> String {
        let full = hash_to_hex(&self.deal_id);
        format!("{}…", &full[..10])
    }
}

/// Compute the content-addressed deal id
pub fn compute_deal_id(fields: &DealFields) -> H256 {
    let encoded = ethers::abi::encode(&fields.tokens());
    H256::from(keccak256(&encoded))
}

/// Build a deal from its terms
pub fn create_deal(fields: DealFields) -> Deal {
    let deal_id = compute_deal_id(&fields);
    Deal {
        deal_id,
        buyer: fields.buyer,
        seller_base: fields.seller_base,
        polygon_escrow: fields.polygon_escrow,
        nft: fields.nft,
        token_id: fields.token_id,
        price: fields.price,
        deadline: fields.deadline,
    }
}

pub(crate) fn keccak256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// JSON shape of a deal: integers as decimal strings, addresses as hex
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealWire {
    pub deal_id: String,
    pub buyer: String,
    pub seller_base: String,
    pub polygon_escrow: String,
    pub nft: String,
    pub token_id: String,
    pub price: String,
    pub deadline: String,
}

impl From<Deal> for DealWire {
    fn from(deal: Deal) -> Self {
        DealWire {
            deal_id: hash_to_hex(&deal.deal_id),
            buyer: address_to_hex(&deal.buyer),
            seller_base: address_to_hex(&deal.seller_base),
            polygon_escrow: address_to_hex(&deal.polygon_escrow),
            nft: address_to_hex(&deal.nft),
            token_id: deal.token_id.to_string(),
            price: deal.price.to_string(),
            deadline: deal.deadline.to_string(),
        }
    }
}

impl TryFrom<DealWire> for Deal {
    type Error = SettlementError;

    fn try_from(wire: DealWire) -> SettlementResult<Self> {
        Ok(Deal {
            deal_id: parse_hash("dealId", &wire.deal_id)?,
            buyer: parse_address("buyer", &wire.buyer)?,
            seller_base: parse_address("sellerBase", &wire.seller_base)?,
            polygon_escrow: parse_address("polygonEscrow", &wire.polygon_escrow)?,
            nft: parse_address("nft", &wire.nft)?,
            token_id: parse_uint("tokenId", &wire.token_id)?,
            price: parse_uint("price", &wire.price)?,
            deadline: parse_uint("deadline", &wire.deadline)?,
        })
    }
}

/// Agreed terms before identification, as sent by a preparer
///
/// `price` is in human units (`"80.5"`); `deadline` defaults to the
/// configured deal lifetime from now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DealTerms {
    pub buyer: String,
    pub seller_base: String,
    pub polygon_escrow: String,
    pub nft: String,
    pub token_id: String,
    pub price: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<String>,
}

impl DealTerms {
    pub fn to_fields(&self, default_deadline: u64) -> SettlementResult<DealFields> {
        let deadline = match &self.deadline {
            Some(value) => parse_uint("deadline", value)?,
            None => U256::from(default_deadline),
        };

        Ok(DealFields {
            buyer: parse_address("buyer", &self.buyer)?,
            seller_base: parse_address("sellerBase", &self.seller_base)?,
            polygon_escrow: parse_address("polygonEscrow", &self.polygon_escrow)?,
            nft: parse_address("nft", &self.nft)?,
            token_id: parse_uint("tokenId", &self.token_id)?,
            price: parse_price(&self.price)?,
            deadline,
        })
    }
}

pub fn address_to_hex(address: &Address) -> String {
    format!("0x{}", hex::encode(address.as_bytes()))
}

pub fn hash_to_hex(hash: &H256) -> String {
    format!("0x{}", hex::encode(hash.as_bytes()))
}

fn strip_hex_prefix<'a>(field: &str, value: &'a str) -> SettlementResult<&'a str> {
    value
        .trim()
        .strip_prefix("0x")
        .or_else(|| value.trim().strip_prefix("0X"))
        .ok_or_else(|| SettlementError::invalid_field(field, "expected 0x-prefixed hex"))
}

pub(crate) fn parse_address(field: &str, value: &str) -> SettlementResult<Address> {
    let digits = strip_hex_prefix(field, value)?;
    if digits.len() != 40 {
        return Err(SettlementError::invalid_field(
            field,
            format!("expected 20-byte address, got {} hex digits", digits.len()),
        ));
    }
    let bytes = hex::decode(digits)
        .map_err(|e| SettlementError::invalid_field(field, format!("invalid hex: {}", e)))?;
    Ok(Address::from_slice(&bytes))
}

fn parse_hash(field: &str, value: &str) -> SettlementResult<H256> {
    let digits = strip_hex_prefix(field, value)?;
    if digits.len() != 64 {
        return Err(SettlementError::invalid_field(
            field,
            format!("expected 32-byte hash, got {} hex digits", digits.len()),
        ));
    }
    let bytes = hex::decode(digits)
        .map_err(|e| SettlementError::invalid_field(field, format!("invalid hex: {}", e)))?;
    Ok(H256::from_slice(&bytes))
}

fn parse_uint(field: &str, value: &str) -> SettlementResult<U256> {
    let digits = value.trim();
    if digits.starts_with('-') {
        return Err(SettlementError::invalid_field(field, "must not be negative"));
    }
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(SettlementError::invalid_field(
            field,
            "expected a decimal integer string",
        ));
    }
    U256::from_dec_str(digits)
        .map_err(|_| SettlementError::invalid_field(field, "exceeds 256 bits"))
}
