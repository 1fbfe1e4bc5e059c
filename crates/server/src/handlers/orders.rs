//! Customer-scoped order endpoints.

use axum::Json;
use axum::extract::{Path, State};
use model::Order;
use rate_limiter::RateLimitRule;
use serde::Deserialize;
use service::notification::CustomerEvent;
use service::order::CancelRequest;
use tracing::info;
use validation::{sanitize_optional_text, validate_uuid};

use super::spawn_refund_if_owed;
use crate::AppState;
use crate::auth::{AuthUser, ClientId};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct CancelBody {
    pub reason: Option<String>,
}

pub async fn get_order(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id = validate_uuid(&id, "order_id")?;
    Ok(Json(state.orders.get_order_for_user(order_id, user_id).await?))
}

/// Cancels the caller's order. The customer mail and, for paid orders, the
/// gateway refund run after the response.
pub async fn cancel_order(
    State(state): State<AppState>,
    client: ClientId,
    AuthUser(user_id): AuthUser,
    Path(id): Path<String>,
    body: Option<Json<CancelBody>>,
) -> Result<Json<Order>, ApiError> {
    client.enforce(&state, &RateLimitRule::ORDER_CANCELLATION)?;
    let order_id = validate_uuid(&id, "order_id")?;
    let reason = body.and_then(|Json(b)| b.reason);
    let reason = sanitize_optional_text(reason.as_deref(), "reason", 500)?;

    let order = state
        .orders
        .cancel_order(CancelRequest {
            order_id,
            user_id,
            reason,
        })
        .await?;
    info!(%order_id, refund_status = %order.refund_status, "Order cancelled by customer");

    let notifications = state.notifications.clone();
    let cancelled = order.clone();
    tokio::spawn(async move {
        notifications.notify_customer(CustomerEvent::Cancelled, &cancelled).await;
    });
    spawn_refund_if_owed(&state, &order);
    Ok(Json(order))
}
