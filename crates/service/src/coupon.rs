//! Coupon engine: eligibility checks, discount calculation and usage accounting.

use std::sync::Arc;

use cache::TtlCache;
use model::{Clock, Coupon};
use repository::{CouponsRepository, RepositoryError};
use rust_decimal::Decimal;
use serde::Serialize;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::ServiceError;

/// Why a coupon cannot be applied.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CouponError {
    #[error("Invalid coupon code")]
    NotFound,
    #[error("This coupon is no longer active")]
    Inactive,
    #[error("This coupon is not yet valid")]
    NotYetValid,
    #[error("This coupon has expired")]
    Expired,
    #[error("Minimum order value of {min} required for this coupon")]
    MinOrderNotMet { min: Decimal },
    #[error("This coupon has reached its usage limit")]
    UsageLimitReached,
    #[error("You have already used this coupon the maximum number of times")]
    UserLimitReached,
}

/// A coupon that passed every check, with the discount it grants.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedCoupon {
    pub coupon: Coupon,
    pub discount: Decimal,
}

pub struct CouponService {
    repo: Arc<dyn CouponsRepository>,
    cache: TtlCache<String, Coupon>,
    clock: Arc<dyn Clock>,
}

impl CouponService {
    pub fn new(repo: Arc<dyn CouponsRepository>, cache_ttl: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            repo,
            cache: TtlCache::new("coupons", cache_ttl, clock.clone()),
            clock,
        }
    }

    async fn lookup(&self, code: &str) -> Result<Option<Coupon>, ServiceError> {
        if let Some(coupon) = self.cache.get(&code.to_string()).await {
            return Ok(Some(coupon));
        }
        let coupon = self.repo.get_by_code(code).await?;
        if let Some(c) = &coupon {
            self.cache.set(code.to_string(), c.clone()).await;
        }
        Ok(coupon)
    }

    /// Checks that `code` applies to an order of `order_subtotal` and
    /// computes its discount. Does not consume a use.
    ///
    /// # Errors
    /// Returns [`ServiceError::Coupon`] naming the first failed check, or
    /// [`ServiceError::Db`] if the lookup itself fails.
    #[instrument(skip(self))]
    pub async fn validate_and_apply(
        &self,
        code: &str,
        order_subtotal: Decimal,
        user_id: Option<Uuid>,
    ) -> Result<AppliedCoupon, ServiceError> {
        let code = Coupon::normalize_code(code);
        let coupon = self.lookup(&code).await?.ok_or(CouponError::NotFound)?;
        let now = self.clock.now();

        if !coupon.is_active {
            return Err(CouponError::Inactive.into());
        }
        if now < coupon.valid_from {
            return Err(CouponError::NotYetValid.into());
        }
        if coupon.valid_until.is_some_and(|until| now > until) {
            return Err(CouponError::Expired.into());
        }
        if let Some(min) = coupon.min_order_value {
            if order_subtotal < min {
                return Err(CouponError::MinOrderNotMet { min }.into());
            }
        }
        if coupon.usage_exhausted() {
            return Err(CouponError::UsageLimitReached.into());
        }
        if let (Some(limit), Some(user_id)) = (coupon.per_user_limit, user_id) {
            let used = self.repo.count_user_usage(coupon.id, user_id).await?;
            if used >= i64::from(limit) {
                return Err(CouponError::UserLimitReached.into());
            }
        }

        let discount = coupon.calculate_discount(order_subtotal);
        Ok(AppliedCoupon { coupon, discount })
    }

    /// Consumes one use of `coupon` for `order_id`. Call only after the order
    /// is durably stored.
    #[instrument(skip(self, coupon), fields(code = %coupon.code))]
    pub async fn increment_usage_count(
        &self,
        coupon: &Coupon,
        user_id: Option<Uuid>,
        order_id: Uuid,
    ) -> Result<(), ServiceError> {
        let result = self.repo.record_usage(coupon.id, user_id, order_id).await;
        self.cache.invalidate(&coupon.code).await;
        match result {
            Ok(()) => {
                info!(%order_id, "Coupon usage recorded");
                Ok(())
            }
            Err(RepositoryError::LimitReached) => {
                warn!(%order_id, "Coupon usage limit reached while recording usage");
                Err(CouponError::UsageLimitReached.into())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Drops expired cache entries.
    pub async fn purge_cache(&self) -> usize {
        self.cache.purge_expired().await
    }
}
