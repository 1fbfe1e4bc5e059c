//! Admin endpoints. Every handler takes [`AdminUser`], so a request only gets
//! here once the caller's profile role has been checked.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use model::{BusinessOrigin, DeliverySettings, Order, ReportFilters, ReportJobStatus, TrackingInfo};
use rate_limiter::RateLimitRule;
use repository::OrderListFilter;
use serde::Deserialize;
use serde_json::json;
use service::notification::{BatchStatus, CustomerEvent};
use service::order::{OrderPage, StatusUpdate, TrackingUpdate};
use service::report::ReportOutcome;
use tracing::info;
use validation::{
    ValidationResult, sanitize_optional_text, sanitize_text, validate_amount, validate_date_range,
    validate_number, validate_order_status, validate_pagination, validate_payment_status, validate_pincode,
    validate_uuid,
};

use super::{MAX_AMOUNT, spawn_refund_if_owed};
use crate::AppState;
use crate::auth::{AdminUser, ClientId};
use crate::error::ApiError;

#[derive(Debug, Default, Deserialize)]
pub struct OrderListQuery {
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub search: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

pub async fn list_orders(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Query(q): Query<OrderListQuery>,
) -> Result<Json<OrderPage>, ApiError> {
    let (from, to) = validate_date_range(non_empty(&q.from), non_empty(&q.to))?;
    let filter = OrderListFilter {
        status: non_empty(&q.status).map(validate_order_status).transpose()?,
        payment_status: non_empty(&q.payment_status).map(validate_payment_status).transpose()?,
        from,
        to,
        search: sanitize_optional_text(q.search.as_deref(), "search", 100)?,
    };
    let page = validate_pagination(q.page, q.limit)?;
    Ok(Json(state.orders.list_orders(filter, page).await?))
}

pub async fn get_order(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(id): Path<String>,
) -> Result<Json<Order>, ApiError> {
    let order_id = validate_uuid(&id, "order_id")?;
    Ok(Json(state.orders.get_order(order_id).await?))
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdateBody {
    #[serde(default)]
    pub new_status: String,
    pub notes: Option<String>,
    pub tracking_number: Option<String>,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
    pub expected_version: Option<i32>,
}

fn tracking_info(
    number: Option<&str>,
    carrier: Option<&str>,
    url: Option<&str>,
) -> ValidationResult<Option<TrackingInfo>> {
    let Some(tracking_number) = sanitize_optional_text(number, "tracking_number", 100)? else {
        return Ok(None);
    };
    Ok(Some(TrackingInfo {
        tracking_number,
        carrier: sanitize_optional_text(carrier, "carrier", 100)?,
        tracking_url: sanitize_optional_text(url, "tracking_url", 500)?,
    }))
}

/// Moves an order along the state machine and tells the customer.
pub async fn update_status(
    State(state): State<AppState>,
    client: ClientId,
    AdminUser(admin_id): AdminUser,
    Path(id): Path<String>,
    Json(body): Json<StatusUpdateBody>,
) -> Result<Json<Order>, ApiError> {
    client.enforce(&state, &RateLimitRule::ADMIN_STATUS_UPDATE)?;
    let order_id = validate_uuid(&id, "order_id")?;
    let new_status = validate_order_status(&body.new_status)?;
    let order = state
        .orders
        .update_order_status(StatusUpdate {
            order_id,
            new_status,
            updated_by: admin_id.to_string(),
            notes: sanitize_optional_text(body.notes.as_deref(), "notes", 500)?,
            tracking: tracking_info(
                body.tracking_number.as_deref(),
                body.carrier.as_deref(),
                body.tracking_url.as_deref(),
            )?,
            expected_version: body.expected_version,
        })
        .await?;
    info!(%order_id, status = %order.status, version = order.version, %admin_id, "Order status updated");

    let notifications = state.notifications.clone();
    let updated = order.clone();
    tokio::spawn(async move {
        notifications.notify_status_change(&updated).await;
    });
    spawn_refund_if_owed(&state, &order);
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
pub struct TrackingBody {
    #[serde(default)]
    pub tracking_number: String,
    pub carrier: Option<String>,
    pub tracking_url: Option<String>,
    pub expected_version: Option<i32>,
}

pub async fn update_tracking(
    State(state): State<AppState>,
    client: ClientId,
    AdminUser(_): AdminUser,
    Path(id): Path<String>,
    Json(body): Json<TrackingBody>,
) -> Result<Json<Order>, ApiError> {
    client.enforce(&state, &RateLimitRule::ADMIN_STATUS_UPDATE)?;
    let order_id = validate_uuid(&id, "order_id")?;
    let tracking = TrackingInfo {
        tracking_number: sanitize_text(&body.tracking_number, "tracking_number", 100, true)?,
        carrier: sanitize_optional_text(body.carrier.as_deref(), "carrier", 100)?,
        tracking_url: sanitize_optional_text(body.tracking_url.as_deref(), "tracking_url", 500)?,
    };
    let order = state
        .orders
        .update_tracking(TrackingUpdate {
            order_id,
            tracking,
            expected_version: body.expected_version,
        })
        .await?;

    let notifications = state.notifications.clone();
    let updated = order.clone();
    tokio::spawn(async move {
        notifications.notify_customer(CustomerEvent::Shipping, &updated).await;
    });
    Ok(Json(order))
}

pub async fn get_delivery_settings(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
) -> Result<Json<DeliverySettings>, ApiError> {
    Ok(Json(state.delivery.settings().await?))
}

#[derive(Debug, Deserialize)]
pub struct OriginInput {
    #[serde(default)]
    pub pincode: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub state: String,
    pub latitude: f64,
    pub longitude: f64,
}

impl OriginInput {
    fn validate(&self) -> ValidationResult<BusinessOrigin> {
        Ok(BusinessOrigin {
            pincode: validate_pincode(&self.pincode)?,
            city: sanitize_text(&self.city, "city", 100, true)?,
            state: sanitize_text(&self.state, "state", 100, true)?,
            latitude: validate_number(self.latitude, "latitude", -90.0, 90.0)?,
            longitude: validate_number(self.longitude, "longitude", -180.0, 180.0)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct DeliverySettingsBody {
    pub local_delivery_charge: f64,
    pub city_delivery_charge: f64,
    pub state_delivery_charge: f64,
    pub national_delivery_charge: f64,
    pub free_shipping_threshold: f64,
    pub free_shipping_enabled: bool,
    /// Omitted to keep the current origin.
    pub origin: Option<OriginInput>,
}

pub async fn update_delivery_settings(
    State(state): State<AppState>,
    AdminUser(admin_id): AdminUser,
    Json(body): Json<DeliverySettingsBody>,
) -> Result<Json<DeliverySettings>, ApiError> {
    let current = state.delivery.settings().await?;
    let charge = |value: f64, field: &str| validate_amount(value, field, 0.0, MAX_AMOUNT);
    let settings = DeliverySettings {
        origin: match &body.origin {
            Some(origin) => origin.validate()?,
            None => current.origin,
        },
        local_delivery_charge: charge(body.local_delivery_charge, "local_delivery_charge")?,
        city_delivery_charge: charge(body.city_delivery_charge, "city_delivery_charge")?,
        state_delivery_charge: charge(body.state_delivery_charge, "state_delivery_charge")?,
        national_delivery_charge: charge(body.national_delivery_charge, "national_delivery_charge")?,
        free_shipping_threshold: charge(body.free_shipping_threshold, "free_shipping_threshold")?,
        free_shipping_enabled: body.free_shipping_enabled,
        updated_at: current.updated_at,
    };
    let saved = state.delivery.update_settings(settings).await?;
    info!(%admin_id, "Delivery settings replaced");
    Ok(Json(saved))
}

#[derive(Debug, Default, Deserialize)]
pub struct ReportQuery {
    pub from: Option<String>,
    pub to: Option<String>,
    pub status: Option<String>,
    pub payment_status: Option<String>,
}

/// Small reports answer inline; large ones return `202` with a job id to poll.
pub async fn generate_report(
    State(state): State<AppState>,
    client: ClientId,
    AdminUser(admin_id): AdminUser,
    Query(q): Query<ReportQuery>,
) -> Result<Response, ApiError> {
    client.enforce(&state, &RateLimitRule::REPORT_GENERATION)?;
    let (from, to) = validate_date_range(non_empty(&q.from), non_empty(&q.to))?;
    let filters = ReportFilters {
        from,
        to,
        status: non_empty(&q.status).map(validate_order_status).transpose()?,
        payment_status: non_empty(&q.payment_status).map(validate_payment_status).transpose()?,
    };
    let response = match state.reports.generate_report(admin_id, filters).await? {
        ReportOutcome::Ready(metrics) => Json(metrics).into_response(),
        ReportOutcome::Queued(job) => (
            StatusCode::ACCEPTED,
            Json(json!({ "jobId": job.id, "status": ReportJobStatus::Processing })),
        )
            .into_response(),
    };
    Ok(response)
}

pub async fn report_job(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
    Path(job_id): Path<String>,
) -> Result<Response, ApiError> {
    let job_id = validate_uuid(&job_id, "job_id")?;
    let job = state.reports.get_job(job_id).await?;
    let response = match job.status {
        ReportJobStatus::Completed => Json(json!({
            "jobId": job.id,
            "status": job.status,
            "result": job.result,
            "completedAt": job.completed_at,
        }))
        .into_response(),
        ReportJobStatus::Pending | ReportJobStatus::Processing => {
            (StatusCode::ACCEPTED, Json(json!({ "jobId": job.id, "status": job.status }))).into_response()
        }
        ReportJobStatus::Failed => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({
                "jobId": job.id,
                "status": job.status,
                "error": job.error_message.unwrap_or_else(|| "Report generation failed".into()),
            })),
        )
            .into_response(),
    };
    Ok(response)
}

pub async fn notification_batches(
    State(state): State<AppState>,
    AdminUser(_): AdminUser,
) -> Json<Vec<BatchStatus>> {
    Json(state.notifications.batch_status().await)
}
