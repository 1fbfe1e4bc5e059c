//! HTTP handlers grouped by audience.

pub mod admin;
pub mod checkout;
pub mod orders;

use chrono::{DateTime, Utc};
use model::{Order, OrderStatus, RefundStatus};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::error;
use uuid::Uuid;

use crate::AppState;

/// Upper bound accepted for any client-supplied amount.
pub const MAX_AMOUNT: f64 = 10_000_000.0;

/// Runs the refund of a just-cancelled paid order in the background.
pub(crate) fn spawn_refund_if_owed(state: &AppState, order: &Order) {
    if order.refund_status != RefundStatus::Pending {
        return;
    }
    let orders = state.orders.clone();
    let order_id = order.id;
    tokio::spawn(async move {
        if let Err(e) = orders.process_refund(order_id).await {
            error!(%order_id, error = %e, "Refund follow-up failed");
        }
    });
}

/// Compact view of a freshly placed order.
#[derive(Debug, Serialize)]
pub struct PlacedOrder {
    pub id: Uuid,
    pub order_number: String,
    pub total: Decimal,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
}

impl From<&Order> for PlacedOrder {
    fn from(o: &Order) -> Self {
        Self {
            id: o.id,
            order_number: o.order_number.clone(),
            total: o.total,
            status: o.status,
            created_at: o.created_at,
        }
    }
}
