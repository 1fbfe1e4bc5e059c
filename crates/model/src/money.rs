//! Money arithmetic.
//!
//! Amounts are `Decimal` rupees with two decimal places. Gateways want the
//! smallest currency unit, so [`to_minor_units`] converts on the way out.

use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal_macros::dec;
use thiserror::Error;

/// Tolerance used when reconciling order totals.
pub const MONEY_EPSILON: Decimal = dec!(0.01);

/// Errors raised when an order's figures do not add up.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum MoneyError {
    #[error("total {actual} does not match subtotal - discount + delivery + tax = {expected}")]
    TotalMismatch { expected: Decimal, actual: Decimal },
    #[error("discount {discount} must be between 0 and subtotal {subtotal}")]
    DiscountOutOfRange { discount: Decimal, subtotal: Decimal },
    #[error("{field} must not be negative")]
    Negative { field: &'static str },
    #[error("amount {0} cannot be expressed in minor units")]
    Unrepresentable(Decimal),
}

/// Rounds to paise, half away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// `subtotal - discount + delivery_charge + tax`
pub fn expected_total(
    subtotal: Decimal,
    discount: Decimal,
    delivery_charge: Decimal,
    tax: Decimal,
) -> Decimal {
    subtotal - discount + delivery_charge + tax
}

/// Checks every financial invariant of an order header.
pub fn check_invariants(
    subtotal: Decimal,
    discount: Decimal,
    delivery_charge: Decimal,
    tax: Decimal,
    total: Decimal,
) -> Result<(), MoneyError> {
    for (field, value) in [
        ("subtotal", subtotal),
        ("delivery_charge", delivery_charge),
        ("tax", tax),
        ("total", total),
    ] {
        if value.is_sign_negative() && !value.is_zero() {
            return Err(MoneyError::Negative { field });
        }
    }
    if discount < Decimal::ZERO || discount > subtotal {
        return Err(MoneyError::DiscountOutOfRange { discount, subtotal });
    }
    let expected = expected_total(subtotal, discount, delivery_charge, tax);
    if (total - expected).abs() > MONEY_EPSILON {
        return Err(MoneyError::TotalMismatch {
            expected,
            actual: total,
        });
    }
    Ok(())
}

/// Converts rupees to paise for payment gateways.
pub fn to_minor_units(amount: Decimal) -> Result<i64, MoneyError> {
    (round_money(amount) * Decimal::ONE_HUNDRED)
        .trunc()
        .to_i64()
        .ok_or(MoneyError::Unrepresentable(amount))
}

/// Converts paise back to rupees.
pub fn from_minor_units(minor: i64) -> Decimal {
    Decimal::new(minor, 2)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_checkout_example_reconciles() {
        assert!(check_invariants(dec!(11000), dec!(1100), dec!(100), dec!(1000), dec!(11000)).is_ok());
    }

    #[test]
    fn test_manipulated_total_rejected() {
        let err = check_invariants(dec!(11000), dec!(1100), dec!(100), dec!(1000), dec!(10000)).unwrap_err();
        assert!(matches!(err, MoneyError::TotalMismatch { .. }));
    }

    #[test]
    fn test_discount_above_subtotal_rejected() {
        let err = check_invariants(dec!(100), dec!(150), dec!(0), dec!(0), dec!(-50)).unwrap_err();
        assert!(matches!(err, MoneyError::Negative { field: "total" }));
        let err = check_invariants(dec!(100), dec!(150), dec!(60), dec!(0), dec!(10)).unwrap_err();
        assert!(matches!(err, MoneyError::DiscountOutOfRange { .. }));
    }

    #[test]
    fn test_minor_units() {
        assert_eq!(to_minor_units(dec!(11000)).unwrap(), 1_100_000);
        assert_eq!(to_minor_units(dec!(10.005)).unwrap(), 1001);
        assert_eq!(from_minor_units(1001), dec!(10.01));
    }

    proptest! {
        #[test]
        fn prop_reconciled_totals_pass(
            subtotal in 0i64..10_000_000,
            discount_pct in 0i64..=100,
            delivery in 0i64..100_000,
            tax in 0i64..1_000_000,
        ) {
            let subtotal = Decimal::new(subtotal, 2);
            let discount = round_money(subtotal * Decimal::new(discount_pct, 2));
            let delivery = Decimal::new(delivery, 2);
            let tax = Decimal::new(tax, 2);
            let total = expected_total(subtotal, discount, delivery, tax);
            prop_assert!(check_invariants(subtotal, discount, delivery, tax, total).is_ok());
            prop_assert!(check_invariants(subtotal, discount, delivery, tax, total + dec!(1)).is_err());
        }
    }
}
