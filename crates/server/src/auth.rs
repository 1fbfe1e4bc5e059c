//! Request identity.
//!
//! Sessions are terminated upstream; the gateway forwards the authenticated
//! user id in `x-user-id`. Admin routes additionally check the role stored on
//! the user's profile.

use std::convert::Infallible;

use axum::extract::FromRequestParts;
use axum::http::HeaderMap;
use axum::http::request::Parts;
use model::Role;
use rate_limiter::{RateLimitRule, client_identifier};
use service::ServiceError;
use tracing::warn;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub const USER_ID_HEADER: &str = "x-user-id";

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// An authenticated customer.
#[derive(Debug, Clone, Copy)]
pub struct AuthUser(pub Uuid);

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &AppState) -> Result<Self, Self::Rejection> {
        header(&parts.headers, USER_ID_HEADER)
            .and_then(|raw| Uuid::parse_str(raw.trim()).ok())
            .map(AuthUser)
            .ok_or(ApiError::Service(ServiceError::Unauthorized))
    }
}

/// An authenticated user whose profile role is `admin`.
#[derive(Debug, Clone, Copy)]
pub struct AdminUser(pub Uuid);

impl FromRequestParts<AppState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let AuthUser(user_id) = AuthUser::from_request_parts(parts, state).await?;
        let role = state.profiles.get_role(user_id).await.map_err(ServiceError::from)?;
        if role != Some(Role::Admin) {
            warn!(%user_id, "Non-admin user attempted an admin operation");
            return Err(ServiceError::Forbidden("Admin access required".into()).into());
        }
        Ok(AdminUser(user_id))
    }
}

/// Key the rate limiter counts this request under.
#[derive(Debug, Clone)]
pub struct ClientId(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientId {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let headers = &parts.headers;
        Ok(ClientId(client_identifier(
            header(headers, USER_ID_HEADER),
            header(headers, "x-forwarded-for"),
            header(headers, "x-real-ip"),
        )))
    }
}

impl ClientId {
    /// Counts this request against `rule`, rejecting it once the window's quota is spent.
    pub fn enforce(&self, state: &AppState, rule: &RateLimitRule) -> Result<(), ApiError> {
        let outcome = state.rate_limiter.check(&self.0, rule);
        if outcome.allowed {
            return Ok(());
        }
        state.metrics.record_rate_limited(rule.operation);
        Err(ApiError::RateLimited(outcome))
    }
}
