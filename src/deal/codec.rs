//! Canonical deal payload carried by the cross-chain deposit
//!
//! Layout is the static ABI tuple
//! `(bytes32 dealId, address buyer, address sellerBase, address polygonEscrow,
//!   address nft, uint256 tokenId, uint256 price, uint256 deadline)`,
//! which is exactly 256 bytes and matches the receiving contract's decoder.

use super::Deal;
use crate::error::{SettlementError, SettlementResult};

use ethers::abi::{ParamType, Token};
use ethers::types::{Bytes, H256};

/// Eight 32-byte words
pub const DEAL_PAYLOAD_LEN: usize = 8 * 32;

/// Word positions holding addresses (left-padded with 12 zero bytes)
const ADDRESS_WORDS: [(usize, &str); 4] = [
    (1, "buyer"),
    (2, "sellerBase"),
    (3, "polygonEscrow"),
    (4, "nft"),
];

fn payload_types() -> [ParamType; 8] {
    [
        ParamType::FixedBytes(32),
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Address,
        ParamType::Uint(256),
        ParamType::Uint(256),
        ParamType::Uint(256),
    ]
}

/// Encode all eight deal fields
pub fn encode_deal_payload(deal: &Deal) -> Bytes {
    let tokens = [
        Token::FixedBytes(deal.deal_id.as_bytes().to_vec()),
        Token::Address(deal.buyer),
        Token::Address(deal.seller_base),
        Token::Address(deal.polygon_escrow),
        Token::Address(deal.nft),
        Token::Uint(deal.token_id),
        Token::Uint(deal.price),
        Token::Uint(deal.deadline),
    ];
    Bytes::from(ethers::abi::encode(&tokens))
}

/// Decode a payload back into a deal
///
/// The id is carried as-is; call [`Deal::verify`] to check it against the terms.
pub fn decode_deal_payload(bytes: &[u8]) -> SettlementResult<Deal> {
    if bytes.len() != DEAL_PAYLOAD_LEN {
        return Err(SettlementError::MalformedPayload(format!(
            "expected {} bytes, got {}",
            DEAL_PAYLOAD_LEN,
            bytes.len()
        )));
    }

    for (word, field) in ADDRESS_WORDS {
        let start = word * 32;
        if bytes[start..start + 12].iter().any(|b| *b != 0) {
            return Err(SettlementError::MalformedPayload(format!(
                "non-canonical address padding in {}",
                field
            )));
        }
    }

    let tokens = ethers::abi::decode(&payload_types(), bytes)
        .map_err(|e| SettlementError::MalformedPayload(e.to_string()))?;

    let mut tokens = tokens.into_iter();
    let mut next = || {
        tokens
            .next()
            .ok_or_else(|| SettlementError::MalformedPayload("missing field".to_string()))
    };

    let deal_id = match next()? {
        Token::FixedBytes(raw) if raw.len() == 32 => H256::from_slice(&raw),
        other => return Err(unexpected("dealId", &other)),
    };
    let buyer = expect_address("buyer", next()?)?;
    let seller_base = expect_address("sellerBase", next()?)?;
    let polygon_escrow = expect_address("polygonEscrow", next()?)?;
    let nft = expect_address("nft", next()?)?;
    let token_id = expect_uint("tokenId", next()?)?;
    let price = expect_uint("price", next()?)?;
    let deadline = expect_uint("deadline", next()?)?;

    Ok(Deal {
        deal_id,
        buyer,
        seller_base,
        polygon_escrow,
        nft,
        token_id,
        price,
        deadline,
    })
}

fn expect_address(field: &str, token: Token) -> SettlementResult<ethers::types::Address> {
    match token {
        Token::Address(address) => Ok(address),
        other => Err(unexpected(field, &other)),
    }
}

fn expect_uint(field: &str, token: Token) -> SettlementResult<ethers::types::U256> {
    match token {
        Token::Uint(value) => Ok(value),
        other => Err(unexpected(field, &other)),
    }
}

fn unexpected(field: &str, token: &Token) -> SettlementError {
    SettlementError::MalformedPayload(format!("unexpected token for {}: {:?}", field, token))
}

pub fn payload_to_hex(payload: &[u8]) -> String {
    format!("0x{}", hex::encode(payload))
}

pub fn payload_from_hex(value: &str) -> SettlementResult<Vec<u8>> {
    let digits = value.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    hex::decode(digits).map_err(|e| SettlementError::MalformedPayload(format!("invalid hex: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deal::tests::{sample_deal, sample_fields};
    use crate::deal::create_deal;
    use ethers::types::U256;

    #[test]
    fn test_payload_is_eight_words() {
        let payload = encode_deal_payload(&sample_deal());
        assert_eq!(payload.len(), DEAL_PAYLOAD_LEN);
        assert_eq!(&payload[..32], sample_deal().deal_id.as_bytes());
    }

    #[test]
    fn test_round_trip_keeps_id() {
        let deal = sample_deal();
        let decoded = decode_deal_payload(&encode_deal_payload(&deal)).unwrap();
        assert_eq!(decoded, deal);
        assert!(decoded.verify().is_ok());
    }

    #[test]
    fn test_round_trip_extreme_magnitudes() {
        let mut fields = sample_fields();
        fields.token_id = U256::MAX;
        fields.price = U256::MAX;
        fields.deadline = U256::zero();
        let deal = create_deal(fields);

        let decoded = decode_deal_payload(&encode_deal_payload(&deal)).unwrap();
        assert_eq!(decoded, deal);
        assert_eq!(decoded.token_id, U256::MAX);
    }

    #[test]
    fn test_decode_rejects_wrong_length() {
        let payload = encode_deal_payload(&sample_deal());
        let err = decode_deal_payload(&payload[..224]).unwrap_err();
        assert_eq!(
            err,
            SettlementError::MalformedPayload("expected 256 bytes, got 224".to_string())
        );

        let mut longer = payload.to_vec();
        longer.push(0);
        assert!(decode_deal_payload(&longer).is_err());
    }

    #[test]
    fn test_decode_rejects_dirty_address_padding() {
        let mut payload = encode_deal_payload(&sample_deal()).to_vec();
        payload[3 * 32] = 0xff;
        match decode_deal_payload(&payload) {
            Err(SettlementError::MalformedPayload(msg)) => assert!(msg.contains("polygonEscrow")),
            other => panic!("expected malformed payload, got {:?}", other),
        }
    }

    #[test]
    fn test_hex_helpers() {
        let payload = encode_deal_payload(&sample_deal());
        let hex = payload_to_hex(&payload);
        assert!(hex.starts_with("0x"));
        assert_eq!(payload_from_hex(&hex).unwrap(), payload.to_vec());
        assert!(payload_from_hex("0xzz").is_err());
    }
}
