//! Coupons and discount arithmetic.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};
use uuid::Uuid;

use crate::money::round_money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DiscountType {
    Percentage,
    Fixed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Coupon {
    pub id: Uuid,
    pub code: String,
    #[serde(default)]
    pub description: Option<String>,
    pub discount_type: DiscountType,
    pub discount_value: Decimal,
    #[serde(default)]
    pub min_order_value: Option<Decimal>,
    #[serde(default)]
    pub max_discount: Option<Decimal>,
    #[serde(default)]
    pub usage_limit: Option<i32>,
    #[serde(default)]
    pub per_user_limit: Option<i32>,
    pub usage_count: i32,
    pub valid_from: DateTime<Utc>,
    /// `None` means the coupon never expires.
    #[serde(default)]
    pub valid_until: Option<DateTime<Utc>>,
    pub is_active: bool,
}

impl Coupon {
    /// Canonical lookup form of a user-typed code.
    pub fn normalize_code(code: &str) -> String {
        code.trim().to_uppercase()
    }

    /// Discount this coupon grants on `subtotal`. Never exceeds `subtotal`.
    pub fn calculate_discount(&self, subtotal: Decimal) -> Decimal {
        if subtotal <= Decimal::ZERO {
            return Decimal::ZERO;
        }
        let raw = match self.discount_type {
            DiscountType::Percentage => {
                let pct = subtotal * self.discount_value / Decimal::ONE_HUNDRED;
                match self.max_discount {
                    Some(cap) => pct.min(cap),
                    None => pct,
                }
            }
            DiscountType::Fixed => self.discount_value,
        };
        round_money(raw.max(Decimal::ZERO).min(subtotal))
    }

    pub fn usage_exhausted(&self) -> bool {
        matches!(self.usage_limit, Some(limit) if self.usage_count >= limit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    pub(crate) fn coupon(discount_type: DiscountType, value: Decimal) -> Coupon {
        Coupon {
            id: Uuid::nil(),
            code: "SAVE10".into(),
            description: None,
            discount_type,
            discount_value: value,
            min_order_value: None,
            max_discount: None,
            usage_limit: None,
            per_user_limit: None,
            usage_count: 0,
            valid_from: Utc::now(),
            valid_until: None,
            is_active: true,
        }
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(Coupon::normalize_code("  save10 "), "SAVE10");
    }

    #[test]
    fn test_percentage_discount() {
        let c = coupon(DiscountType::Percentage, dec!(10));
        assert_eq!(c.calculate_discount(dec!(11000)), dec!(1100));
    }

    #[test]
    fn test_percentage_discount_capped() {
        let mut c = coupon(DiscountType::Percentage, dec!(20));
        c.max_discount = Some(dec!(500));
        assert_eq!(c.calculate_discount(dec!(10000)), dec!(500));
    }

    #[test]
    fn test_fixed_discount_capped_at_subtotal() {
        let c = coupon(DiscountType::Fixed, dec!(200));
        assert_eq!(c.calculate_discount(dec!(100)), dec!(100));
    }

    #[test]
    fn test_usage_exhausted() {
        let mut c = coupon(DiscountType::Fixed, dec!(50));
        assert!(!c.usage_exhausted());
        c.usage_limit = Some(3);
        c.usage_count = 3;
        assert!(c.usage_exhausted());
    }

    proptest! {
        #[test]
        fn prop_discount_never_exceeds_subtotal(
            subtotal in 0i64..100_000_000,
            value in 0i64..10_000_000,
            percentage in any::<bool>(),
        ) {
            let kind = if percentage { DiscountType::Percentage } else { DiscountType::Fixed };
            let c = coupon(kind, Decimal::new(value, 2));
            let subtotal = Decimal::new(subtotal, 2);
            let discount = c.calculate_discount(subtotal);
            prop_assert!(discount <= subtotal);
            prop_assert!(discount >= Decimal::ZERO);
        }
    }
}
