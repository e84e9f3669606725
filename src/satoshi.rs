//! Exact decimal-to-satoshi conversion.
//!
//! The node reports values as decimal strings (e.g. `"0.00012345"`). We
//! convert to the canonical integer satoshi form via `rust_decimal`
//! rather than `f64`, so `0.1 + 0.2`-style rounding drift never enters
//! a balance.

use crate::error::{IndexerError, Result};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

const SATOSHI_SCALE: Decimal = dec!(100_000_000);

/// Parse a decimal value string from the node and return its satoshi form.
pub fn decimal_to_satoshi(value: &str) -> Result<i64> {
    let decimal: Decimal = value
        .parse()
        .map_err(|e| IndexerError::InvalidData(format!("bad decimal value {value:?}: {e}")))?;
    let satoshis = decimal * SATOSHI_SCALE;
    satoshis
        .trunc()
        .to_string()
        .parse::<i64>()
        .map_err(|e| IndexerError::InvalidData(format!("satoshi overflow for {value:?}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converts_whole_coins() {
        assert_eq!(decimal_to_satoshi("1.0").unwrap(), 100_000_000);
    }

    #[test]
    fn converts_fractional_without_drift() {
        assert_eq!(decimal_to_satoshi("0.00000001").unwrap(), 1);
        assert_eq!(decimal_to_satoshi("21000000.00000000").unwrap(), 2_100_000_000_000_000);
    }

    #[test]
    fn rejects_garbage() {
        assert!(decimal_to_satoshi("not-a-number").is_err());
    }
}
