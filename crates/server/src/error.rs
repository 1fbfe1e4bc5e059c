//! Mapping of service failures onto HTTP responses.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use rate_limiter::RateLimitOutcome;
use serde_json::json;
use service::{ErrorKind, ServiceError};
use tracing::{debug, error, warn};
use validation::ValidationError;

/// Error returned by every handler.
#[derive(Debug)]
pub enum ApiError {
    Service(ServiceError),
    RateLimited(RateLimitOutcome),
}

impl From<ServiceError> for ApiError {
    fn from(err: ServiceError) -> Self {
        ApiError::Service(err)
    }
}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::Service(err.into())
    }
}

pub fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation
        | ErrorKind::InvalidTransition
        | ErrorKind::BusinessRule
        | ErrorKind::InvariantViolation => StatusCode::BAD_REQUEST,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::RateLimited => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Upstream => StatusCode::BAD_GATEWAY,
        ErrorKind::Config | ErrorKind::Internal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn rate_limited(outcome: RateLimitOutcome) -> Response {
    let retry_after = outcome.retry_after_secs.unwrap_or(1);
    let body = Json(json!({
        "error": format!("Too many requests. Please try again in {retry_after} seconds"),
        "code": ErrorKind::RateLimited.as_ref(),
        "retryAfter": retry_after,
    }));
    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    let headers = response.headers_mut();
    headers.insert(header::RETRY_AFTER, HeaderValue::from(retry_after));
    headers.insert("x-ratelimit-limit", HeaderValue::from(outcome.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(outcome.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(outcome.reset_at.timestamp()));
    response
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = match self {
            ApiError::RateLimited(outcome) => return rate_limited(outcome),
            ApiError::Service(err) => err,
        };
        let kind = err.kind();
        let status = status_for(kind);
        let message = if status == StatusCode::BAD_GATEWAY {
            error!(code = %kind, error = %err, "Upstream call failed");
            "An external service is unavailable, please try again later".to_string()
        } else if status.is_server_error() {
            error!(code = %kind, error = %err, "Request failed");
            "Internal server error".to_string()
        } else {
            match kind {
                ErrorKind::Validation => debug!(error = %err, "Rejected invalid input"),
                _ => warn!(code = %kind, error = %err, "Request refused"),
            }
            err.to_string()
        };

        let body = match &err {
            ServiceError::Conflict { actual, .. } => json!({
                "error": message,
                "code": kind.as_ref(),
                "conflict": true,
                "currentVersion": actual,
            }),
            _ => json!({ "error": message, "code": kind.as_ref() }),
        };
        (status, Json(body)).into_response()
    }
}
