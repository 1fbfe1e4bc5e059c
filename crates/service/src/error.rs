//! Service-level error type and its closed discriminant.

use model::{MoneyError, OrderStatus};
use repository::RepositoryError;
use strum::{AsRefStr, Display};
use thiserror::Error;
use validation::ValidationError;

use crate::coupon::CouponError;
use crate::payment::PaymentError;

/// What kind of failure a [`ServiceError`] is. Boundaries branch on this,
/// never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    Validation,
    Unauthorized,
    Forbidden,
    NotFound,
    Conflict,
    InvalidTransition,
    BusinessRule,
    InvariantViolation,
    RateLimited,
    Upstream,
    Config,
    Internal,
}

/// The main error type for every operation in this crate.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Malformed or out-of-range input.
    #[error("{0}")]
    Validation(#[from] ValidationError),
    #[error("Authentication required")]
    Unauthorized,
    #[error("{0}")]
    Forbidden(String),
    #[error("{0}")]
    NotFound(String),
    /// The order changed since the caller read it.
    #[error("Order was modified by another request (expected version {expected}, current version {actual}). Refresh and try again")]
    Conflict { expected: i32, actual: i32 },
    /// A unique reference (such as a payment) is already taken.
    #[error("{0}")]
    Duplicate(String),
    #[error("Invalid status transition from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },
    /// An expected, user-recoverable refusal.
    #[error("{0}")]
    BusinessRule(String),
    #[error("{0}")]
    Coupon(#[from] CouponError),
    #[error("Payment verification failed")]
    PaymentNotVerified,
    /// Order figures do not reconcile.
    #[error("Order totals do not reconcile: {0}")]
    InvariantViolation(String),
    #[error("Too many requests, retry in {retry_after_secs}s")]
    RateLimited { retry_after_secs: i64 },
    #[error("{0}")]
    Payment(#[from] PaymentError),
    /// A non-payment external collaborator failed.
    #[error("Upstream service failed: {0}")]
    Upstream(String),
    /// A repository (database) operation failed.
    #[error("Database error: {0}")]
    Db(RepositoryError),
    /// Some unexpected or unhandled error.
    #[error("Unexpected error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ServiceError::Validation(_) => ErrorKind::Validation,
            ServiceError::Unauthorized => ErrorKind::Unauthorized,
            ServiceError::Forbidden(_) => ErrorKind::Forbidden,
            ServiceError::NotFound(_) => ErrorKind::NotFound,
            ServiceError::Conflict { .. } | ServiceError::Duplicate(_) => ErrorKind::Conflict,
            ServiceError::InvalidTransition { .. } => ErrorKind::InvalidTransition,
            ServiceError::BusinessRule(_) | ServiceError::Coupon(_) | ServiceError::PaymentNotVerified => {
                ErrorKind::BusinessRule
            }
            ServiceError::InvariantViolation(_) => ErrorKind::InvariantViolation,
            ServiceError::RateLimited { .. } => ErrorKind::RateLimited,
            ServiceError::Payment(e) => e.kind(),
            ServiceError::Upstream(_) => ErrorKind::Upstream,
            ServiceError::Db(_) | ServiceError::Internal(_) => ErrorKind::Internal,
        }
    }
}

impl From<RepositoryError> for ServiceError {
    fn from(err: RepositoryError) -> Self {
        match err {
            RepositoryError::NotFound => ServiceError::NotFound("Resource not found".into()),
            RepositoryError::VersionMismatch { expected, actual } => ServiceError::Conflict { expected, actual },
            RepositoryError::Duplicate(key) => ServiceError::Duplicate(format!("A record with this {key} already exists")),
            other => ServiceError::Db(other),
        }
    }
}

impl From<MoneyError> for ServiceError {
    fn from(err: MoneyError) -> Self {
        ServiceError::InvariantViolation(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_mismatch_is_conflict() {
        let err = ServiceError::from(RepositoryError::VersionMismatch { expected: 1, actual: 2 });
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    #[test]
    fn test_duplicate_key_is_conflict() {
        let err = ServiceError::from(RepositoryError::Duplicate("payment_id".into()));
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(err.to_string().contains("payment_id"));
    }

    #[test]
    fn test_kind_codes() {
        assert_eq!(ErrorKind::InvalidTransition.as_ref(), "INVALID_TRANSITION");
        assert_eq!(ErrorKind::Config.to_string(), "CONFIG");
    }

    #[test]
    fn test_money_error_is_invariant_violation() {
        let err = ServiceError::from(MoneyError::Negative { field: "tax" });
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }
}
