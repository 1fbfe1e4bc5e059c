//! Checkout endpoints: delivery quotes, coupon checks, payment creation and
//! order placement.

use std::collections::HashMap;

use axum::Json;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use model::Order;
use rate_limiter::RateLimitRule;
use serde::Deserialize;
use serde_json::json;
use service::checkout::{CartItem, CouponQuote, OrderDraft, PaymentProof};
use service::{ErrorKind, ServiceError};
use tracing::info;
use uuid::Uuid;
use validation::{
    AddressInput, ValidationError, ValidationResult, sanitize_optional_text, sanitize_text, validate_address,
    validate_amount, validate_email, validate_number, validate_payment_method, validate_pincode, validate_uuid,
};

use super::{MAX_AMOUNT, PlacedOrder};
use crate::AppState;
use crate::auth::{AuthUser, ClientId};
use crate::error::ApiError;

const MAX_ITEMS: usize = 50;
const MAX_QUANTITY: f64 = 100.0;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryQuoteRequest {
    #[serde(default)]
    pub pincode: String,
    #[serde(default)]
    pub order_subtotal: f64,
}

pub async fn quote_delivery_query(
    state: State<AppState>,
    client: ClientId,
    Query(req): Query<DeliveryQuoteRequest>,
) -> Result<Response, ApiError> {
    quote_delivery(state, client, Json(req)).await
}

pub async fn quote_delivery(
    State(state): State<AppState>,
    client: ClientId,
    Json(req): Json<DeliveryQuoteRequest>,
) -> Result<Response, ApiError> {
    client.enforce(&state, &RateLimitRule::DELIVERY_QUOTE)?;
    let pincode = validate_pincode(&req.pincode)?;
    let subtotal = validate_amount(req.order_subtotal, "orderSubtotal", 0.0, MAX_AMOUNT)?;
    let quote = state.checkout.quote_delivery(&pincode, subtotal).await?;
    Ok(Json(quote).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponRequest {
    #[serde(default)]
    pub coupon_code: String,
    #[serde(default)]
    pub order_subtotal: f64,
    pub user_id: Option<String>,
}

async fn check_coupon(state: &AppState, req: CouponRequest) -> Result<CouponQuote, ServiceError> {
    let code = sanitize_text(&req.coupon_code, "couponCode", 50, true)?;
    let subtotal = validate_amount(req.order_subtotal, "orderSubtotal", 0.0, MAX_AMOUNT)?;
    let user_id = req
        .user_id
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .map(|s| validate_uuid(s, "userId"))
        .transpose()?;
    state.checkout.validate_coupon(&code, subtotal, user_id).await
}

/// Refusals carry `valid: false` so the cart can show them inline.
pub async fn validate_coupon(
    State(state): State<AppState>,
    client: ClientId,
    Json(req): Json<CouponRequest>,
) -> Result<Response, ApiError> {
    client.enforce(&state, &RateLimitRule::COUPON_VALIDATION)?;
    match check_coupon(&state, req).await {
        Ok(quote) => Ok(Json(quote).into_response()),
        Err(e) if matches!(e.kind(), ErrorKind::Validation | ErrorKind::BusinessRule) => {
            info!(error = %e, "Coupon refused");
            Ok((StatusCode::BAD_REQUEST, Json(json!({ "error": e.to_string(), "valid": false }))).into_response())
        }
        Err(e) => Err(e.into()),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePaymentRequest {
    pub amount: f64,
    pub currency: Option<String>,
    pub payment_method: Option<String>,
}

pub async fn create_payment(
    State(state): State<AppState>,
    client: ClientId,
    AuthUser(user_id): AuthUser,
    Json(req): Json<CreatePaymentRequest>,
) -> Result<Response, ApiError> {
    client.enforce(&state, &RateLimitRule::PAYMENT_CREATION)?;
    let amount = validate_amount(req.amount, "amount", 0.0, MAX_AMOUNT)?;
    let method = validate_payment_method(req.payment_method.as_deref().unwrap_or("razorpay"))?;
    let currency = sanitize_optional_text(req.currency.as_deref(), "currency", 3)?;

    let metadata = HashMap::from([
        ("receipt".to_string(), format!("rcpt_{}", Uuid::new_v4().simple())),
        ("user_id".to_string(), user_id.to_string()),
    ]);
    let intent = state.checkout.create_payment(amount, currency, method, metadata).await?;
    Ok(Json(intent).into_response())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CartItemInput {
    #[serde(default)]
    pub product_id: String,
    #[serde(default)]
    pub product_name: String,
    pub price: f64,
    pub quantity: i64,
}

/// Order details as the storefront submits them.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrderDataInput {
    pub customer_email: String,
    pub items: Vec<CartItemInput>,
    pub coupon_code: Option<String>,
    pub shipping_address: AddressInput,
    pub total: Option<f64>,
    pub notes: Option<String>,
}

impl OrderDataInput {
    fn into_draft(self, user_id: Uuid) -> ValidationResult<OrderDraft> {
        if self.items.is_empty() {
            return Err(ValidationError::new("items", "Order must contain at least one item"));
        }
        if self.items.len() > MAX_ITEMS {
            return Err(ValidationError::new("items", format!("An order can hold at most {MAX_ITEMS} items")));
        }
        let items = self
            .items
            .iter()
            .map(|item| {
                let quantity = validate_number(item.quantity as f64, "quantity", 1.0, MAX_QUANTITY)?;
                Ok(CartItem {
                    product_id: validate_uuid(&item.product_id, "productId")?,
                    product_name: sanitize_text(&item.product_name, "productName", 200, true)?,
                    unit_price: validate_amount(item.price, "price", 0.0, MAX_AMOUNT)?,
                    quantity: quantity as i32,
                })
            })
            .collect::<ValidationResult<Vec<_>>>()?;

        Ok(OrderDraft {
            user_id,
            customer_email: validate_email(&self.customer_email)?,
            items,
            coupon_code: sanitize_optional_text(self.coupon_code.as_deref(), "couponCode", 50)?,
            shipping_address: validate_address(&self.shipping_address)?,
            declared_total: self
                .total
                .map(|t| validate_amount(t, "total", 0.0, MAX_AMOUNT))
                .transpose()?,
            notes: sanitize_optional_text(self.notes.as_deref(), "notes", 500)?,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct VerifyPaymentRequest {
    #[serde(default)]
    pub razorpay_payment_id: String,
    #[serde(default)]
    pub razorpay_order_id: String,
    #[serde(default)]
    pub razorpay_signature: String,
    #[serde(rename = "orderData", default)]
    pub order_data: OrderDataInput,
}

fn placed(order: &Order) -> Response {
    Json(json!({ "success": true, "order": PlacedOrder::from(order) })).into_response()
}

pub async fn verify_payment(
    State(state): State<AppState>,
    client: ClientId,
    AuthUser(user_id): AuthUser,
    Json(req): Json<VerifyPaymentRequest>,
) -> Result<Response, ApiError> {
    client.enforce(&state, &RateLimitRule::ORDER_CREATION)?;
    let proof = PaymentProof {
        payment_id: req.razorpay_payment_id,
        gateway_order_id: req.razorpay_order_id,
        signature: req.razorpay_signature,
    };
    let draft = req.order_data.into_draft(user_id)?;
    let order = state.checkout.verify_and_place_order(proof, draft).await?;
    info!(order_id = %order.id, order_number = %order.order_number, "Paid order placed");
    Ok(placed(&order))
}

pub async fn place_cod_order(
    State(state): State<AppState>,
    client: ClientId,
    AuthUser(user_id): AuthUser,
    Json(req): Json<OrderDataInput>,
) -> Result<Response, ApiError> {
    client.enforce(&state, &RateLimitRule::ORDER_CREATION)?;
    let draft = req.into_draft(user_id)?;
    let order = state.checkout.place_cod_order(draft).await?;
    info!(order_id = %order.id, order_number = %order.order_number, "Cash on delivery order placed");
    Ok(placed(&order))
}
