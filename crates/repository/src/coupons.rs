//! Coupons and per-user coupon usage.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use model::Coupon;
use tokio_postgres::Row;
use uuid::Uuid;

use crate::{RepositoryError, decode};

/// # CouponsRepository
///
/// Read-mostly coupon lookups plus the one write checkout performs: recording
/// that an order consumed a coupon.
#[async_trait]
pub trait CouponsRepository: Send + Sync {
    /// Looks up a coupon by its normalized code.
    async fn get_by_code(&self, code: &str) -> Result<Option<Coupon>, RepositoryError>;

    /// How many orders `user_id` has placed with this coupon.
    async fn count_user_usage(&self, coupon_id: Uuid, user_id: Uuid) -> Result<i64, RepositoryError>;

    /// Atomically increments the usage counter and records the usage row.
    ///
    /// Returns [`RepositoryError::LimitReached`] if the global limit is
    /// already met; the counter never exceeds `usage_limit`.
    async fn record_usage(&self, coupon_id: Uuid, user_id: Option<Uuid>, order_id: Uuid) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the CouponsRepository trait.
pub struct PgCouponsRepository {
    pool: Pool,
}

impl PgCouponsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

fn coupon_from_row(row: &Row) -> Result<Coupon, RepositoryError> {
    let discount_type: String = row.get("discount_type");
    Ok(Coupon {
        id: row.get("id"),
        code: row.get("code"),
        description: row.get("description"),
        discount_type: decode("coupons.discount_type", &discount_type)?,
        discount_value: row.get("discount_value"),
        min_order_value: row.get("min_order_value"),
        max_discount: row.get("max_discount"),
        usage_limit: row.get("usage_limit"),
        per_user_limit: row.get("per_user_limit"),
        usage_count: row.get("usage_count"),
        valid_from: row.get("valid_from"),
        valid_until: row.get("valid_until"),
        is_active: row.get("is_active"),
    })
}

#[async_trait]
impl CouponsRepository for PgCouponsRepository {
    async fn get_by_code(&self, code: &str) -> Result<Option<Coupon>, RepositoryError> {
        let query = r#"
            SELECT id, code, description, discount_type, discount_value, min_order_value, max_discount,
                   usage_limit, per_user_limit, usage_count, valid_from, valid_until, is_active
            FROM coupons WHERE code = $1
        "#;
        let client = self.pool.get().await?;
        let row = client.query_opt(query, &[&code]).await?;
        row.as_ref().map(coupon_from_row).transpose()
    }

    async fn count_user_usage(&self, coupon_id: Uuid, user_id: Uuid) -> Result<i64, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                "SELECT COUNT(*) AS n FROM coupon_usages WHERE coupon_id = $1 AND user_id = $2",
                &[&coupon_id, &user_id],
            )
            .await?;
        Ok(row.get("n"))
    }

    async fn record_usage(&self, coupon_id: Uuid, user_id: Option<Uuid>, order_id: Uuid) -> Result<(), RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let updated = tx
            .execute(
                r#"
                UPDATE coupons SET usage_count = usage_count + 1
                WHERE id = $1 AND (usage_limit IS NULL OR usage_count < usage_limit)
                "#,
                &[&coupon_id],
            )
            .await?;
        if updated == 0 {
            let exists = tx.query_opt("SELECT 1 FROM coupons WHERE id = $1", &[&coupon_id]).await?;
            return Err(if exists.is_some() {
                RepositoryError::LimitReached
            } else {
                RepositoryError::NotFound
            });
        }
        tx.execute(
            "INSERT INTO coupon_usages (coupon_id, user_id, order_id) VALUES ($1, $2, $3)",
            &[&coupon_id, &user_id, &order_id],
        )
        .await?;
        tx.commit().await?;
        Ok(())
    }
}
