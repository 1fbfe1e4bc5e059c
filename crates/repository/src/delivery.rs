//! The singleton delivery settings row.

use async_trait::async_trait;
use deadpool_postgres::Pool;
use model::{BusinessOrigin, DeliverySettings};

use crate::RepositoryError;

#[async_trait]
pub trait DeliverySettingsRepository: Send + Sync {
    async fn get(&self) -> Result<DeliverySettings, RepositoryError>;
    async fn update(&self, settings: &DeliverySettings) -> Result<(), RepositoryError>;
}

/// PostgreSQL implementation of the DeliverySettingsRepository trait.
pub struct PgDeliverySettingsRepository {
    pool: Pool,
}

impl PgDeliverySettingsRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeliverySettingsRepository for PgDeliverySettingsRepository {
    async fn get(&self) -> Result<DeliverySettings, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt("SELECT * FROM delivery_settings WHERE id = 1", &[])
            .await?
            .ok_or(RepositoryError::NotFound)?;
        Ok(DeliverySettings {
            origin: BusinessOrigin {
                pincode: row.get("origin_pincode"),
                city: row.get("origin_city"),
                state: row.get("origin_state"),
                latitude: row.get("origin_latitude"),
                longitude: row.get("origin_longitude"),
            },
            local_delivery_charge: row.get("local_delivery_charge"),
            city_delivery_charge: row.get("city_delivery_charge"),
            state_delivery_charge: row.get("state_delivery_charge"),
            national_delivery_charge: row.get("national_delivery_charge"),
            free_shipping_threshold: row.get("free_shipping_threshold"),
            free_shipping_enabled: row.get("free_shipping_enabled"),
            updated_at: row.get("updated_at"),
        })
    }

    async fn update(&self, s: &DeliverySettings) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO delivery_settings (
                id, origin_pincode, origin_city, origin_state, origin_latitude, origin_longitude,
                local_delivery_charge, city_delivery_charge, state_delivery_charge, national_delivery_charge,
                free_shipping_threshold, free_shipping_enabled, updated_at
            )
            VALUES (1, $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (id) DO UPDATE SET
                origin_pincode = EXCLUDED.origin_pincode,
                origin_city = EXCLUDED.origin_city,
                origin_state = EXCLUDED.origin_state,
                origin_latitude = EXCLUDED.origin_latitude,
                origin_longitude = EXCLUDED.origin_longitude,
                local_delivery_charge = EXCLUDED.local_delivery_charge,
                city_delivery_charge = EXCLUDED.city_delivery_charge,
                state_delivery_charge = EXCLUDED.state_delivery_charge,
                national_delivery_charge = EXCLUDED.national_delivery_charge,
                free_shipping_threshold = EXCLUDED.free_shipping_threshold,
                free_shipping_enabled = EXCLUDED.free_shipping_enabled,
                updated_at = EXCLUDED.updated_at
        "#;
        let client = self.pool.get().await?;
        client.execute(query, &[
            &s.origin.pincode,
            &s.origin.city,
            &s.origin.state,
            &s.origin.latitude,
            &s.origin.longitude,
            &s.local_delivery_charge,
            &s.city_delivery_charge,
            &s.state_delivery_charge,
            &s.national_delivery_charge,
            &s.free_shipping_threshold,
            &s.free_shipping_enabled,
            &s.updated_at,
        ]).await?;
        Ok(())
    }
}
