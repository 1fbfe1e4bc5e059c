use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::time::Duration;

/// Runtime settings of the storefront backend.
///
/// Built from the defaults in [`AppConfig::from_defaults`], overridden by
/// environment variables of the same name in upper case (`DB_HOST`,
/// `RAZORPAY_KEY_ID`, ...). A `.env` file in the working directory is read
/// first when present.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct AppConfig {
    // Postgres
    pub db_host: String,
    pub db_port: u16,
    pub db_user: String,
    pub db_password: String,
    pub db_name: String,
    pub db_pool_size: usize,
    /// Run against the in-memory store instead of Postgres (local demos only).
    pub use_in_memory_store: bool,

    pub http_port: u16,
    /// Upper bound on the final notification flush at shutdown, e.g. "5s".
    #[serde(deserialize_with = "deserialize_duration")]
    pub shutdown_timeout: Duration,

    // Payments
    /// Name of the primary payment gateway ("razorpay" or "sandbox").
    pub payment_gateway: String,
    /// Gateway for outbound calls when the primary cannot be built. Empty disables it.
    pub payment_fallback_gateway: String,
    pub razorpay_key_id: String,
    pub razorpay_key_secret: String,
    pub razorpay_api_base: String,
    /// Shared secret of the in-process sandbox gateway. Empty disables it.
    pub sandbox_secret: String,
    /// ISO currency code for all orders.
    pub currency: String,

    // Checkout
    /// Tax rate applied to `subtotal - discount + delivery`, e.g. 0.03.
    pub tax_rate: Decimal,

    // Delivery pricing
    /// Base URL of the Nominatim-compatible geocoder.
    pub geocoder_base_url: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub geocode_timeout: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub geocode_cache_ttl: Duration,
    #[serde(deserialize_with = "deserialize_duration")]
    pub settings_cache_ttl: Duration,
    pub local_radius_km: f64,
    pub city_radius_km: f64,
    pub state_radius_km: f64,

    // Coupons
    #[serde(deserialize_with = "deserialize_duration")]
    pub coupon_cache_ttl: Duration,

    // Notifications
    /// Transactional mail API endpoint. Empty disables sending (log only).
    pub mail_api_url: String,
    pub mail_api_key: String,
    pub mail_from: String,
    pub admin_email: String,
    #[serde(deserialize_with = "deserialize_duration")]
    pub mail_timeout: Duration,
    /// Window during which admin new-order alerts are batched into one digest.
    #[serde(deserialize_with = "deserialize_duration")]
    pub notification_batch_window: Duration,

    // Reports
    /// Estimated row count above which reports run as background jobs.
    pub report_async_threshold: i64,

    // Rate limiting
    #[serde(deserialize_with = "deserialize_duration")]
    pub rate_limit_sweep_interval: Duration,
}

/// Durations are written the humantime way: "90s", "5m", "24h".
fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de::Error;
    let raw = String::deserialize(deserializer)?;
    humantime::parse_duration(raw.trim()).map_err(|e| D::Error::custom(format!("{raw:?} is not a duration: {e}")))
}

impl AppConfig {
    /// Defaults, then `.env`, then the process environment.
    ///
    /// # Errors
    /// Fails when a variable cannot be parsed into its field's type.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let settings = Self::defaults()?
            .add_source(config::Environment::default().try_parsing(true))
            .build()?;

        settings
            .try_deserialize()
            .context("Failed to load configuration")
    }

    /// Configuration built from defaults only, ignoring the environment.
    pub fn from_defaults() -> Result<Self> {
        Self::defaults()?
            .build()?
            .try_deserialize()
            .context("Failed to build default configuration")
    }

    fn defaults() -> Result<config::ConfigBuilder<config::builder::DefaultState>> {
        let builder = config::Config::builder()
            // Database
            .set_default("db_host", "localhost")?
            .set_default("db_port", 5432)?
            .set_default("db_user", "store_user")?
            .set_default("db_password", "securepassword")?
            .set_default("db_name", "store_db")?
            .set_default("db_pool_size", 16)?
            .set_default("use_in_memory_store", false)?
            // HTTP
            .set_default("http_port", 8081)?
            // Shutdown
            .set_default("shutdown_timeout", "5s")?
            // Payments
            .set_default("payment_gateway", "razorpay")?
            .set_default("payment_fallback_gateway", "")?
            .set_default("razorpay_key_id", "")?
            .set_default("razorpay_key_secret", "")?
            .set_default("razorpay_api_base", "https://api.razorpay.com/v1")?
            .set_default("sandbox_secret", "")?
            .set_default("currency", "INR")?
            // Checkout
            .set_default("tax_rate", "0.10")?
            // Delivery
            .set_default("geocoder_base_url", "https://nominatim.openstreetmap.org")?
            .set_default("geocode_timeout", "5s")?
            .set_default("geocode_cache_ttl", "24h")?
            .set_default("settings_cache_ttl", "5m")?
            .set_default("local_radius_km", 10.0)?
            .set_default("city_radius_km", 50.0)?
            .set_default("state_radius_km", 500.0)?
            // Coupons
            .set_default("coupon_cache_ttl", "1m")?
            // Notifications
            .set_default("mail_api_url", "")?
            .set_default("mail_api_key", "")?
            .set_default("mail_from", "orders@example.com")?
            .set_default("admin_email", "admin@example.com")?
            .set_default("mail_timeout", "10s")?
            .set_default("notification_batch_window", "2m")?
            // Reports
            .set_default("report_async_threshold", 1000)?
            // Rate limiting
            .set_default("rate_limit_sweep_interval", "5m")?;
        Ok(builder)
    }
}
