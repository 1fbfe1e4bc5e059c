//! # Data Repository Layer
//!
//! This crate provides repository traits and PostgreSQL implementations
//! for every persisted entity: orders (with items and status history),
//! coupons, delivery settings, report jobs, profiles and the notification log.
//!
//! [`memory::InMemoryStore`] implements every trait over process memory and
//! backs the test suites and local demo runs.

use thiserror::Error;

pub mod coupons;
pub mod delivery;
pub mod memory;
pub mod notifications;
pub mod orders;
pub mod profiles;
pub mod reports;

pub use coupons::{CouponsRepository, PgCouponsRepository};
pub use delivery::{DeliverySettingsRepository, PgDeliverySettingsRepository};
pub use memory::{CouponUsage, InMemoryStore, default_delivery_settings};
pub use notifications::{NotificationLogRepository, PgNotificationLogRepository};
pub use orders::{OrderListFilter, OrdersRepository, PgOrdersRepository};
pub use profiles::{PgProfilesRepository, ProfilesRepository};
pub use reports::{PgReportJobsRepository, ReportJobsRepository};

/// # RepositoryError
///
/// Error types that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database-related errors, wrapping the underlying PostgreSQL error
    #[error("Database error: {0}")]
    Db(#[from] tokio_postgres::Error),
    /// Failed to obtain a connection from the pool.
    #[error("Pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),
    /// No result found.
    #[error("Not found")]
    NotFound,
    /// A conditional update found a different version than the caller read.
    #[error("Version mismatch: expected {expected}, found {actual}")]
    VersionMismatch { expected: i32, actual: i32 },
    /// A unique key (named by the payload) is already taken.
    #[error("Duplicate {0}")]
    Duplicate(String),
    /// A guarded counter is already at its limit.
    #[error("Limit reached")]
    LimitReached,
    /// A stored value could not be mapped back into the domain model.
    #[error("Corrupt row: {0}")]
    Decode(String),
}

pub(crate) fn decode<T: std::str::FromStr>(column: &str, raw: &str) -> Result<T, RepositoryError> {
    raw.parse()
        .map_err(|_| RepositoryError::Decode(format!("{column} has unexpected value '{raw}'")))
}

/// Text form of an enum stored in a `TEXT` column.
pub(crate) fn text<T: AsRef<str>>(value: &T) -> &str {
    value.as_ref()
}
