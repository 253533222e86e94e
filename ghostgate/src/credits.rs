//! Credit arithmetic within the platform's numeric ceiling.
//!
//! Every balance mutation goes through these helpers. Results outside
//! `[0, MAX_CREDITS]` are errors, never clamped or wrapped.

use alloy_primitives::U256;

/// Largest balance or amount a wallet can hold (signed 32-bit column range).
pub const MAX_CREDITS: u64 = 2_147_483_647;

/// Cost charged when neither a pricing row nor a configured default applies.
pub const FALLBACK_CREDIT_COST: u64 = 1;

/// A credit computation left the permitted range.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("credit value out of range: {operation} would produce {detail}")]
pub struct OutOfRange {
    /// The operation that overflowed (e.g. `"credit"`).
    pub operation: &'static str,
    /// Human-readable description of the offending value.
    pub detail: String,
}

impl OutOfRange {
    fn new(operation: &'static str, detail: impl Into<String>) -> Self {
        Self {
            operation,
            detail: detail.into(),
        }
    }
}

/// Validates that `value` is a representable credit amount.
///
/// # Errors
///
/// Returns [`OutOfRange`] if `value` exceeds [`MAX_CREDITS`].
pub fn ensure_in_range(operation: &'static str, value: u64) -> Result<u64, OutOfRange> {
    if value > MAX_CREDITS {
        return Err(OutOfRange::new(
            operation,
            format!("{value} (max {MAX_CREDITS})"),
        ));
    }
    Ok(value)
}

/// Adds `amount` to `balance`.
///
/// # Errors
///
/// Returns [`OutOfRange`] if the sum exceeds [`MAX_CREDITS`].
pub fn checked_add(balance: u64, amount: u64) -> Result<u64, OutOfRange> {
    let sum = balance
        .checked_add(amount)
        .ok_or_else(|| OutOfRange::new("credit", "an overflowing sum"))?;
    ensure_in_range("credit", sum)
}

/// Subtracts `amount` from `balance`.
///
/// Returns `None` when the balance is insufficient; callers turn that into a
/// payment error rather than a range error.
#[must_use]
pub const fn checked_sub(balance: u64, amount: u64) -> Option<u64> {
    balance.checked_sub(amount)
}

/// Converts deposited wei into whole credits at `price_wei` per credit.
///
/// `residual_wei` is the remainder carried from earlier conversions. Returns
/// `(credits, new_residual)` where `new_residual < price_wei`.
///
/// # Errors
///
/// Returns [`OutOfRange`] if the price is zero or the credit count does not
/// fit the credit range.
pub fn wei_to_credits(
    residual_wei: U256,
    deposited_wei: U256,
    price_wei: U256,
) -> Result<(u64, U256), OutOfRange> {
    if price_wei.is_zero() {
        return Err(OutOfRange::new("sync", "a division by a zero credit price"));
    }
    let total = residual_wei
        .checked_add(deposited_wei)
        .ok_or_else(|| OutOfRange::new("sync", "an overflowing wei total"))?;
    let (credits, remainder) = total.div_rem(price_wei);
    let credits = u64::try_from(credits)
        .map_err(|_| OutOfRange::new("sync", format!("{credits} credits")))?;
    Ok((ensure_in_range("sync", credits)?, remainder))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRICE: u64 = 10_000_000_000_000;

    #[test]
    fn test_two_eth_buys_two_hundred_thousand_credits() {
        let two_eth = U256::from(2_000_000_000_000_000_000_u128);
        let (credits, residual) =
            wei_to_credits(U256::ZERO, two_eth, U256::from(PRICE)).unwrap();
        assert_eq!(credits, 200_000);
        assert!(residual.is_zero());
    }

    #[test]
    fn test_residual_is_carried() {
        let price = U256::from(PRICE);
        let (first, residual) = wei_to_credits(U256::ZERO, U256::from(PRICE * 3 / 2), price).unwrap();
        assert_eq!(first, 1);
        let (second, residual) = wei_to_credits(residual, U256::from(PRICE / 2), price).unwrap();
        assert_eq!(second, 1);
        assert!(residual.is_zero());
    }

    #[test]
    fn test_zero_price_is_rejected() {
        assert!(wei_to_credits(U256::ZERO, U256::from(1u8), U256::ZERO).is_err());
    }

    #[test]
    fn test_ceiling_is_enforced() {
        assert!(checked_add(MAX_CREDITS, 1).is_err());
        assert_eq!(checked_add(MAX_CREDITS - 1, 1).unwrap(), MAX_CREDITS);
        assert!(checked_add(u64::MAX, 1).is_err());
        let huge = U256::from(MAX_CREDITS) + U256::from(1u8);
        assert!(wei_to_credits(U256::ZERO, huge, U256::from(1u8)).is_err());
    }

    #[test]
    fn test_checked_sub_reports_insufficient() {
        assert_eq!(checked_sub(5, 3), Some(2));
        assert_eq!(checked_sub(2, 3), None);
    }
}
