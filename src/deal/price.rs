//! Six-decimal fixed point prices (`"80500000"` == 80.50 units)

use crate::error::{SettlementError, SettlementResult};

use ethers::types::U256;

pub const PRICE_DECIMALS: usize = 6;

/// Parse a human price such as `"80.5"` into base units
pub fn parse_price(value: &str) -> SettlementResult<U256> {
    let value = value.trim();
    if value.starts_with('-') {
        return Err(SettlementError::invalid_field("price", "must not be negative"));
    }

    let (whole, fraction) = match value.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (value, ""),
    };

    if whole.is_empty() && fraction.is_empty() {
        return Err(SettlementError::invalid_field("price", "empty price"));
    }
    if !whole.bytes().chain(fraction.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(SettlementError::invalid_field(
            "price",
            format!("not a decimal number: {}", value),
        ));
    }
    if fraction.len() > PRICE_DECIMALS {
        return Err(SettlementError::invalid_field(
            "price",
            format!("more than {} decimal places", PRICE_DECIMALS),
        ));
    }

    let digits = format!(
        "{}{:0<width$}",
        if whole.is_empty() { "0" } else { whole },
        fraction,
        width = PRICE_DECIMALS
    );
    U256::from_dec_str(&digits).map_err(|_| SettlementError::invalid_field("price", "too large"))
}

/// Render base units for humans, keeping at least two decimals
pub fn format_price(units: U256) -> String {
    let digits = format!("{:0>width$}", units.to_string(), width = PRICE_DECIMALS + 1);
    let (whole, fraction) = digits.split_at(digits.len() - PRICE_DECIMALS);
    let mut fraction = fraction.trim_end_matches('0').to_string();
    while fraction.len() < 2 {
        fraction.push('0');
    }
    format!("{}.{}", whole, fraction)
}
