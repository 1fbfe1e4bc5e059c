//! Checkout orchestration.
//!
//! A checkout prices the cart on the server (coupon, delivery, tax), asks the
//! payment gateway for an order, and once the client returns a signed payment
//! proof, verifies it and places the order. Coupon usage and notifications
//! follow the stored order and never undo it.

use std::collections::HashMap;
use std::sync::Arc;

use model::money::{MONEY_EPSILON, expected_total, round_money, to_minor_units};
use model::{Coupon, Order, OrderItem, PaymentMethod, PaymentStatus, ShippingAddress};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validation::ValidationError;

use crate::coupon::{AppliedCoupon, CouponService};
use crate::delivery::{DeliveryPricing, DeliveryQuote};
use crate::error::ServiceError;
use crate::notification::{CustomerEvent, NotificationService};
use crate::order::{NewOrder, OrderService};
use crate::payment::{GatewayOrder, PaymentGatewayFactory};

/// One cart line as submitted by the client.
#[derive(Debug, Clone)]
pub struct CartItem {
    pub product_id: Uuid,
    pub product_name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
}

/// The order a customer wants placed. Figures are recomputed on the server;
/// `declared_total` is only compared against them.
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub user_id: Uuid,
    pub customer_email: String,
    pub items: Vec<CartItem>,
    pub coupon_code: Option<String>,
    pub shipping_address: ShippingAddress,
    pub declared_total: Option<Decimal>,
    pub notes: Option<String>,
}

/// What the client got back from the gateway's checkout widget.
#[derive(Debug, Clone)]
pub struct PaymentProof {
    pub payment_id: String,
    pub gateway_order_id: String,
    pub signature: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CouponQuote {
    pub valid: bool,
    pub discount: Decimal,
    pub coupon_code: String,
    pub description: Option<String>,
    pub updated_total: Decimal,
}

/// Response to a payment request. `order_id` is `None` for cash on delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIntent {
    pub order_id: Option<String>,
    pub amount: Decimal,
    pub amount_minor: Option<i64>,
    pub currency: String,
    pub gateway: Option<String>,
    pub key_id: Option<String>,
    pub payment_method: PaymentMethod,
}

/// Server-side figures for a draft.
#[derive(Debug, Clone)]
pub struct PricedOrder {
    pub items: Vec<OrderItem>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub delivery: DeliveryQuote,
    pub tax: Decimal,
    pub total: Decimal,
    pub coupon: Option<Coupon>,
}

pub struct CheckoutService {
    coupons: Arc<CouponService>,
    delivery: Arc<DeliveryPricing>,
    payments: Arc<PaymentGatewayFactory>,
    orders: Arc<dyn OrderService>,
    notifications: NotificationService,
    tax_rate: Decimal,
    currency: String,
}

impl CheckoutService {
    pub fn new(
        coupons: Arc<CouponService>,
        delivery: Arc<DeliveryPricing>,
        payments: Arc<PaymentGatewayFactory>,
        orders: Arc<dyn OrderService>,
        notifications: NotificationService,
        tax_rate: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            coupons,
            delivery,
            payments,
            orders,
            notifications,
            tax_rate,
            currency: currency.into(),
        }
    }

    pub async fn quote_delivery(&self, pincode: &str, order_subtotal: Decimal) -> Result<DeliveryQuote, ServiceError> {
        self.delivery.quote(pincode, order_subtotal).await
    }

    /// Checks a coupon against a subtotal without consuming it.
    pub async fn validate_coupon(
        &self,
        code: &str,
        order_subtotal: Decimal,
        user_id: Option<Uuid>,
    ) -> Result<CouponQuote, ServiceError> {
        let AppliedCoupon { coupon, discount } = self.coupons.validate_and_apply(code, order_subtotal, user_id).await?;
        Ok(CouponQuote {
            valid: true,
            discount,
            coupon_code: coupon.code,
            description: coupon.description,
            updated_total: order_subtotal - discount,
        })
    }

    /// Opens a payment on the active gateway, or short-circuits for cash on delivery.
    #[instrument(skip(self, metadata))]
    pub async fn create_payment(
        &self,
        amount: Decimal,
        currency: Option<String>,
        method: PaymentMethod,
        metadata: HashMap<String, String>,
    ) -> Result<PaymentIntent, ServiceError> {
        if amount <= Decimal::ZERO {
            return Err(ValidationError::new("amount", "Amount must be greater than zero").into());
        }
        let currency = currency.filter(|c| !c.trim().is_empty()).unwrap_or_else(|| self.currency.clone());
        if method == PaymentMethod::Cod {
            return Ok(PaymentIntent {
                order_id: None,
                amount,
                amount_minor: None,
                currency,
                gateway: None,
                key_id: None,
                payment_method: method,
            });
        }

        let gateway = self.payments.active()?;
        let created = gateway.create_order(round_money(amount), &currency, &metadata).await?;
        info!(gateway = gateway.name(), gateway_order_id = %created.id, "Payment order created");
        Ok(PaymentIntent {
            order_id: Some(created.id),
            amount,
            amount_minor: Some(created.amount),
            currency: created.currency,
            gateway: Some(gateway.name().to_string()),
            key_id: gateway.public_key().map(str::to_string),
            payment_method: method,
        })
    }

    /// Recomputes every figure of `draft` from item snapshots and current settings.
    pub async fn price(&self, draft: &OrderDraft) -> Result<PricedOrder, ServiceError> {
        if draft.items.is_empty() {
            return Err(ValidationError::new("items", "Order must contain at least one item").into());
        }
        let mut items = Vec::with_capacity(draft.items.len());
        for line in &draft.items {
            if line.quantity <= 0 || line.unit_price < Decimal::ZERO {
                return Err(ValidationError::new(
                    "items",
                    format!("Invalid quantity or price for {}", line.product_name),
                )
                .into());
            }
            items.push(OrderItem::new(line.product_id, &line.product_name, line.unit_price, line.quantity));
        }
        let subtotal: Decimal = items.iter().map(|i| i.subtotal).sum();

        let applied = match draft.coupon_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => {
                Some(self.coupons.validate_and_apply(code, subtotal, Some(draft.user_id)).await?)
            }
            _ => None,
        };
        let discount = applied.as_ref().map_or(Decimal::ZERO, |a| a.discount);

        let delivery = self.delivery.quote(&draft.shipping_address.pincode, subtotal).await?;
        let tax = round_money((subtotal - discount + delivery.delivery_charge) * self.tax_rate);
        let total = expected_total(subtotal, discount, delivery.delivery_charge, tax);

        Ok(PricedOrder {
            items,
            subtotal,
            discount,
            delivery,
            tax,
            total,
            coupon: applied.map(|a| a.coupon),
        })
    }

    fn check_declared_total(priced: &PricedOrder, declared: Option<Decimal>) -> Result<(), ServiceError> {
        match declared {
            Some(declared) if (declared - priced.total).abs() > MONEY_EPSILON => {
                warn!(%declared, computed = %priced.total, "Client total does not match server pricing");
                Err(ServiceError::InvariantViolation(format!(
                    "declared total {declared} does not match computed total {}",
                    priced.total
                )))
            }
            _ => Ok(()),
        }
    }

    /// The gateway order must be for exactly the server-computed total.
    fn check_paid_amount(&self, priced: &PricedOrder, paid: &GatewayOrder) -> Result<(), ServiceError> {
        let due = to_minor_units(priced.total)?;
        if paid.amount != due || !paid.currency.eq_ignore_ascii_case(&self.currency) {
            warn!(
                gateway_order_id = %paid.id,
                paid = paid.amount,
                paid_currency = %paid.currency,
                due,
                "Gateway order does not cover the order total"
            );
            return Err(ServiceError::BusinessRule(
                "Payment amount does not match the order total".into(),
            ));
        }
        Ok(())
    }

    /// Verifies a gateway payment and places the paid order.
    ///
    /// Only the primary gateway is trusted here. A proof settles one order:
    /// the payment and gateway order ids are unique across orders.
    ///
    /// # Errors
    /// Returns [`ServiceError::Validation`] when proof fields are missing,
    /// [`ServiceError::PaymentNotVerified`] when the signature does not check
    /// out, [`ServiceError::InvariantViolation`] when the client's total
    /// disagrees with server pricing, [`ServiceError::BusinessRule`] when the
    /// gateway order was opened for another amount, and
    /// [`ServiceError::Duplicate`] when the proof was already used.
    #[instrument(skip(self, proof, draft), fields(user_id = %draft.user_id, gateway_order_id = %proof.gateway_order_id))]
    pub async fn verify_and_place_order(&self, proof: PaymentProof, draft: OrderDraft) -> Result<Order, ServiceError> {
        if [&proof.payment_id, &proof.gateway_order_id, &proof.signature]
            .iter()
            .any(|f| f.trim().is_empty())
        {
            return Err(ValidationError::new("payment", "Missing payment verification fields").into());
        }
        let gateway = self.payments.verifier()?;
        if !gateway.verify_payment(&proof.payment_id, &proof.gateway_order_id, &proof.signature) {
            warn!(gateway = gateway.name(), "Payment signature rejected");
            return Err(ServiceError::PaymentNotVerified);
        }

        let priced = self.price(&draft).await?;
        Self::check_declared_total(&priced, draft.declared_total)?;
        let paid = gateway.fetch_order(&proof.gateway_order_id).await?;
        self.check_paid_amount(&priced, &paid)?;

        self.place(
            draft,
            priced,
            PaymentMethod::Razorpay,
            PaymentStatus::Completed,
            Some(proof.payment_id),
            Some(proof.gateway_order_id),
        )
        .await
        .map_err(|e| match e {
            ServiceError::Duplicate(_) => {
                warn!("Payment proof already settled an order");
                ServiceError::Duplicate("This payment has already been used for an order".into())
            }
            other => other,
        })
    }

    /// Places a cash-on-delivery order; payment stays pending until delivery.
    #[instrument(skip(self, draft), fields(user_id = %draft.user_id))]
    pub async fn place_cod_order(&self, draft: OrderDraft) -> Result<Order, ServiceError> {
        let priced = self.price(&draft).await?;
        Self::check_declared_total(&priced, draft.declared_total)?;
        self.place(draft, priced, PaymentMethod::Cod, PaymentStatus::Pending, None, None).await
    }

    async fn place(
        &self,
        draft: OrderDraft,
        priced: PricedOrder,
        payment_method: PaymentMethod,
        payment_status: PaymentStatus,
        payment_id: Option<String>,
        gateway_order_id: Option<String>,
    ) -> Result<Order, ServiceError> {
        let order = self
            .orders
            .create_order(NewOrder {
                user_id: draft.user_id,
                customer_email: draft.customer_email,
                items: priced.items,
                subtotal: priced.subtotal,
                discount: priced.discount,
                delivery_charge: priced.delivery.delivery_charge,
                tax: priced.tax,
                total: priced.total,
                coupon_code: priced.coupon.as_ref().map(|c| c.code.clone()),
                payment_method,
                payment_status,
                payment_id,
                gateway_order_id,
                shipping_address: draft.shipping_address,
                notes: draft.notes,
            })
            .await?;

        if let Some(coupon) = &priced.coupon {
            if let Err(e) = self.coupons.increment_usage_count(coupon, Some(order.user_id), order.id).await {
                warn!(order_id = %order.id, code = %coupon.code, error = %e, "Could not record coupon usage");
            }
        }

        self.notifications.queue_admin_new_order(&order).await;
        let notifications = self.notifications.clone();
        let placed = order.clone();
        tokio::spawn(async move {
            notifications.notify_customer(CustomerEvent::Confirmation, &placed).await;
        });
        Ok(order)
    }
}
