//! Business logic layer for order management.
//!
//! This module defines the [`OrderService`] trait and its async implementation [`OrderServiceImpl`].
//! The service owns the order aggregate's invariants: money reconciliation on
//! creation, the status state machine, and optimistic concurrency on every
//! mutation. It never sends notifications; callers decide what to announce.

use std::sync::Arc;

use async_trait::async_trait;
use model::{
    Clock, Order, OrderItem, OrderStatus, Pagination, PaymentMethod, PaymentStatus, RefundStatus,
    ShippingAddress, StatusHistoryEntry, TrackingInfo,
};
use model::money::{MONEY_EPSILON, check_invariants};
use repository::{OrderListFilter, OrdersRepository};
use rust_decimal::Decimal;
use serde::Serialize;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validation::ValidationError;

use crate::error::ServiceError;
use crate::payment::PaymentGatewayFactory;

/// `updated_by` for entries written by the system itself.
pub const SYSTEM_ACTOR: &str = "system";

/// Reload-and-write attempts when recording a refund outcome races another writer.
const REFUND_RECORD_ATTEMPTS: usize = 3;

/// Everything needed to persist a new order. Figures are checked, not trusted.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub user_id: Uuid,
    pub customer_email: String,
    pub items: Vec<OrderItem>,
    pub subtotal: Decimal,
    pub discount: Decimal,
    pub delivery_charge: Decimal,
    pub tax: Decimal,
    pub total: Decimal,
    pub coupon_code: Option<String>,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub payment_id: Option<String>,
    pub gateway_order_id: Option<String>,
    pub shipping_address: ShippingAddress,
    pub notes: Option<String>,
}

#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub order_id: Uuid,
    pub new_status: OrderStatus,
    pub updated_by: String,
    pub notes: Option<String>,
    pub tracking: Option<TrackingInfo>,
    /// Version the caller last read. `None` skips the pre-check; the write is
    /// still conditional on the version loaded here.
    pub expected_version: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct CancelRequest {
    pub order_id: Uuid,
    pub user_id: Uuid,
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TrackingUpdate {
    pub order_id: Uuid,
    pub tracking: TrackingInfo,
    pub expected_version: Option<i32>,
}

/// One page of the admin order listing.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    pub total_pages: u64,
}

/// Trait describing business operations for order management.
#[async_trait]
pub trait OrderService: Send + Sync {
    /// Persists a new `pending` order with its items and first history entry.
    ///
    /// # Errors
    /// Returns [`ServiceError::InvariantViolation`] if the figures do not
    /// reconcile, [`ServiceError::Validation`] if there are no items.
    async fn create_order(&self, input: NewOrder) -> Result<Order, ServiceError>;

    /// Moves an order along the state machine.
    ///
    /// # Errors
    /// Returns [`ServiceError::Conflict`] when `expected_version` is stale or a
    /// concurrent writer wins, [`ServiceError::InvalidTransition`] when the
    /// state machine forbids the move.
    async fn update_order_status(&self, input: StatusUpdate) -> Result<Order, ServiceError>;

    /// Cancels a customer's own order while it is still `pending` or `confirmed`.
    async fn cancel_order(&self, input: CancelRequest) -> Result<Order, ServiceError>;

    /// Sets tracking details on an order that is `processing` or `shipped`.
    async fn update_tracking(&self, input: TrackingUpdate) -> Result<Order, ServiceError>;

    /// Executes the refund of a cancelled, paid order through the payment gateway.
    ///
    /// The order is claimed (`refund_status = processing`) before the gateway
    /// is called, and the order id is the refund's idempotency key. A
    /// `failed` refund may be run again.
    async fn process_refund(&self, order_id: Uuid) -> Result<Order, ServiceError>;

    async fn get_order(&self, order_id: Uuid) -> Result<Order, ServiceError>;

    /// Loads an order only if it belongs to `user_id`.
    async fn get_order_for_user(&self, order_id: Uuid, user_id: Uuid) -> Result<Order, ServiceError>;

    async fn list_orders(&self, filter: OrderListFilter, page: Pagination) -> Result<OrderPage, ServiceError>;
}

/// Async implementation of [`OrderService`] over an [`OrdersRepository`].
pub struct OrderServiceImpl {
    orders: Arc<dyn OrdersRepository>,
    payments: Arc<PaymentGatewayFactory>,
    clock: Arc<dyn Clock>,
}

impl OrderServiceImpl {
    pub fn new(orders: Arc<dyn OrdersRepository>, payments: Arc<PaymentGatewayFactory>, clock: Arc<dyn Clock>) -> Self {
        Self {
            orders,
            payments,
            clock,
        }
    }

    fn validate_new_order(input: &NewOrder) -> Result<(), ServiceError> {
        if input.items.is_empty() {
            return Err(ValidationError::new("items", "Order must contain at least one item").into());
        }
        if let Some(bad) = input.items.iter().find(|i| i.quantity <= 0 || i.unit_price < Decimal::ZERO) {
            return Err(ValidationError::new("items", format!("Invalid quantity or price for {}", bad.product_name)).into());
        }
        let items_subtotal: Decimal = input.items.iter().map(|i| i.subtotal).sum();
        if (items_subtotal - input.subtotal).abs() > MONEY_EPSILON {
            return Err(ServiceError::InvariantViolation(format!(
                "subtotal {} does not match item total {items_subtotal}",
                input.subtotal
            )));
        }
        check_invariants(input.subtotal, input.discount, input.delivery_charge, input.tax, input.total)?;
        Ok(())
    }

    /// Writes `next` if the stored order is still at `current.version`.
    async fn commit(
        &self,
        current: &Order,
        mut next: Order,
        history: Option<StatusHistoryEntry>,
    ) -> Result<Order, ServiceError> {
        self.orders
            .update_versioned(&next, current.version, history.as_ref())
            .await
            .inspect_err(|e| warn!(order_id = %current.id, error = %e, "Versioned order update rejected"))?;
        next.version = current.version + 1;
        next.status_history.extend(history);
        Ok(next)
    }

    fn check_expected_version(order: &Order, expected: Option<i32>) -> Result<(), ServiceError> {
        match expected {
            Some(v) if v != order.version => {
                warn!(order_id = %order.id, expected = v, actual = order.version, "Stale order version");
                Err(ServiceError::Conflict {
                    expected: v,
                    actual: order.version,
                })
            }
            _ => Ok(()),
        }
    }

    /// Writes the outcome of a refund onto the freshest copy of the order.
    /// The gateway call already happened, so a version race is retried rather
    /// than reported.
    async fn record_refund(&self, order_id: Uuid, outcome: RefundStatus) -> Result<Order, ServiceError> {
        let mut attempt = 1;
        loop {
            let current = self.orders.get_by_id(order_id).await?;
            let mut next = current.clone();
            next.refund_status = outcome;
            if outcome == RefundStatus::Completed {
                next.payment_status = PaymentStatus::Refunded;
            }
            next.updated_at = self.clock.now();
            match self.commit(&current, next, None).await {
                Err(ServiceError::Conflict { .. }) if attempt < REFUND_RECORD_ATTEMPTS => {
                    warn!(%order_id, attempt, "Order changed while recording refund, retrying");
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    /// Stamps cancellation fields; paid orders are queued for refund.
    fn mark_cancelled(order: &mut Order, reason: Option<String>, now: chrono::DateTime<chrono::Utc>) {
        order.status = OrderStatus::Cancelled;
        order.cancelled_at = Some(now);
        order.cancellation_reason = reason;
        if order.payment_status == PaymentStatus::Completed {
            order.refund_status = RefundStatus::Pending;
        }
    }
}

#[async_trait]
impl OrderService for OrderServiceImpl {
    #[instrument(skip(self, input), fields(user_id = %input.user_id))]
    async fn create_order(&self, input: NewOrder) -> Result<Order, ServiceError> {
        Self::validate_new_order(&input)?;

        let now = self.clock.now();
        let seq = self.orders.next_order_sequence().await?;
        let order = Order {
            id: Uuid::new_v4(),
            order_number: format!("ORD-{}-{seq:06}", now.format("%Y%m%d")),
            user_id: input.user_id,
            customer_email: input.customer_email,
            items: input.items,
            subtotal: input.subtotal,
            discount: input.discount,
            delivery_charge: input.delivery_charge,
            tax: input.tax,
            total: input.total,
            coupon_code: input.coupon_code,
            status: OrderStatus::Pending,
            status_history: vec![StatusHistoryEntry {
                status: OrderStatus::Pending,
                timestamp: now,
                updated_by: SYSTEM_ACTOR.into(),
                notes: Some("Order placed".into()),
            }],
            payment_method: input.payment_method,
            payment_status: input.payment_status,
            refund_status: RefundStatus::NotRequired,
            payment_id: input.payment_id,
            gateway_order_id: input.gateway_order_id,
            shipping_address: input.shipping_address,
            tracking: None,
            notes: input.notes,
            cancelled_at: None,
            cancellation_reason: None,
            version: 1,
            created_at: now,
            updated_at: now,
        };

        self.orders.insert(&order).await.inspect_err(|e| error!(error = %e, "Failed to persist order"))?;
        info!(order_id = %order.id, order_number = %order.order_number, total = %order.total, "Order created");
        Ok(order)
    }

    #[instrument(skip(self, input), fields(order_id = %input.order_id, new_status = %input.new_status))]
    async fn update_order_status(&self, input: StatusUpdate) -> Result<Order, ServiceError> {
        let current = self.orders.get_by_id(input.order_id).await?;
        Self::check_expected_version(&current, input.expected_version)?;
        if !current.status.can_transition_to(input.new_status) {
            return Err(ServiceError::InvalidTransition {
                from: current.status,
                to: input.new_status,
            });
        }

        let now = self.clock.now();
        let mut next = current.clone();
        next.status = input.new_status;
        next.updated_at = now;
        if let Some(tracking) = input.tracking {
            next.tracking = Some(tracking);
        }
        if input.new_status == OrderStatus::Cancelled {
            Self::mark_cancelled(&mut next, input.notes.clone(), now);
        }
        let entry = StatusHistoryEntry {
            status: input.new_status,
            timestamp: now,
            updated_by: input.updated_by,
            notes: input.notes,
        };

        let updated = self.commit(&current, next, Some(entry)).await?;
        info!(from = %current.status, version = updated.version, "Order status updated");
        Ok(updated)
    }

    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    async fn cancel_order(&self, input: CancelRequest) -> Result<Order, ServiceError> {
        let current = self.get_order_for_user(input.order_id, input.user_id).await?;
        if !current.status.is_cancellable() {
            return Err(ServiceError::BusinessRule(format!(
                "Order cannot be cancelled because it is already {}. Please contact support for assistance",
                current.status
            )));
        }

        let now = self.clock.now();
        let mut next = current.clone();
        next.updated_at = now;
        Self::mark_cancelled(&mut next, input.reason.clone(), now);
        let entry = StatusHistoryEntry {
            status: OrderStatus::Cancelled,
            timestamp: now,
            updated_by: input.user_id.to_string(),
            notes: input.reason,
        };

        let updated = self.commit(&current, next, Some(entry)).await?;
        info!(refund_status = %updated.refund_status, "Order cancelled by customer");
        Ok(updated)
    }

    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    async fn update_tracking(&self, input: TrackingUpdate) -> Result<Order, ServiceError> {
        let current = self.orders.get_by_id(input.order_id).await?;
        Self::check_expected_version(&current, input.expected_version)?;
        if !matches!(current.status, OrderStatus::Processing | OrderStatus::Shipped) {
            return Err(ServiceError::BusinessRule(format!(
                "Tracking can only be set on processing or shipped orders, this order is {}",
                current.status
            )));
        }
        if input.tracking.tracking_number.trim().is_empty() {
            return Err(ValidationError::new("tracking_number", "Tracking number is required").into());
        }

        let mut next = current.clone();
        next.tracking = Some(input.tracking);
        next.updated_at = self.clock.now();
        self.commit(&current, next, None).await
    }

    #[instrument(skip(self))]
    async fn process_refund(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        let current = self.orders.get_by_id(order_id).await?;
        if !matches!(current.refund_status, RefundStatus::Pending | RefundStatus::Failed) {
            return Err(ServiceError::BusinessRule(format!(
                "Order has no pending refund (refund status is {})",
                current.refund_status
            )));
        }
        let payment_id = current
            .payment_id
            .clone()
            .ok_or_else(|| ServiceError::BusinessRule("Order has no captured payment to refund".into()))?;

        let mut claim = current.clone();
        claim.refund_status = RefundStatus::Processing;
        claim.updated_at = self.clock.now();
        let claimed = self.commit(&current, claim, None).await?;

        let refund = match self.payments.active() {
            Ok(gateway) => {
                gateway
                    .refund_payment(&payment_id, Some(claimed.total), &claimed.id.to_string())
                    .await
            }
            Err(e) => Err(e),
        };
        match refund {
            Ok(r) => {
                info!(refund_id = %r.id, amount = r.amount, "Refund issued");
                self.record_refund(order_id, RefundStatus::Completed)
                    .await
                    .inspect_err(|e| error!(refund_id = %r.id, error = %e, "Refund issued but not recorded"))
            }
            Err(e) => {
                error!(error = %e, "Refund failed");
                if let Err(write) = self.record_refund(order_id, RefundStatus::Failed).await {
                    error!(error = %write, "Could not record failed refund");
                }
                Err(e.into())
            }
        }
    }

    #[instrument(skip(self))]
    async fn get_order(&self, order_id: Uuid) -> Result<Order, ServiceError> {
        self.orders.get_by_id(order_id).await.map_err(|e| match ServiceError::from(e) {
            ServiceError::NotFound(_) => ServiceError::NotFound("Order not found".into()),
            other => other,
        })
    }

    async fn get_order_for_user(&self, order_id: Uuid, user_id: Uuid) -> Result<Order, ServiceError> {
        let order = self.get_order(order_id).await?;
        if order.user_id != user_id {
            return Err(ServiceError::NotFound("Order not found".into()));
        }
        Ok(order)
    }

    #[instrument(skip(self))]
    async fn list_orders(&self, filter: OrderListFilter, page: Pagination) -> Result<OrderPage, ServiceError> {
        let (orders, total) = self.orders.list(&filter, page).await?;
        Ok(OrderPage {
            orders,
            total,
            page: page.page,
            limit: page.limit,
            total_pages: page.total_pages(total),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use crate::payment::{
        GatewayCredentials, GatewayOrder, PaymentDetails, PaymentError, PaymentGateway, Refund, SANDBOX,
        SandboxGateway,
    };
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use chrono::{TimeZone, Utc};
    use model::ManualClock;
    use repository::InMemoryStore;
    use rust_decimal_macros::dec;
    use strum::IntoEnumIterator;

    pub(crate) fn address() -> ShippingAddress {
        ShippingAddress {
            name: "Asha Rao".into(),
            phone: "9876543210".into(),
            street: "12 Residency Road".into(),
            city: "Bengaluru".into(),
            state: "Karnataka".into(),
            pincode: "560025".into(),
            country: "India".into(),
            latitude: None,
            longitude: None,
        }
    }

    pub(crate) fn new_order(user_id: Uuid) -> NewOrder {
        NewOrder {
            user_id,
            customer_email: "asha@example.com".into(),
            items: vec![
                OrderItem::new(Uuid::new_v4(), "Gold necklace", dec!(9000), 1),
                OrderItem::new(Uuid::new_v4(), "Silver anklet", dec!(1000), 2),
            ],
            subtotal: dec!(11000),
            discount: dec!(1100),
            delivery_charge: dec!(100),
            tax: dec!(1000),
            total: dec!(11000),
            coupon_code: Some("SAVE10".into()),
            payment_method: PaymentMethod::Razorpay,
            payment_status: PaymentStatus::Completed,
            payment_id: Some(format!("pay_{}", Uuid::new_v4().simple())),
            gateway_order_id: Some(format!("order_{}", Uuid::new_v4().simple())),
            shipping_address: address(),
            notes: None,
        }
    }

    pub(crate) fn sandbox_factory() -> Arc<PaymentGatewayFactory> {
        let creds = GatewayCredentials {
            sandbox_secret: "sandbox".into(),
            ..Default::default()
        };
        Arc::new(PaymentGatewayFactory::new(creds, SANDBOX, None))
    }

    fn service() -> (Arc<InMemoryStore>, OrderServiceImpl) {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 14, 10, 30, 0).unwrap()));
        let svc = OrderServiceImpl::new(store.clone(), sandbox_factory(), clock);
        (store, svc)
    }

    fn status(order: &Order, to: OrderStatus, expected_version: Option<i32>) -> StatusUpdate {
        StatusUpdate {
            order_id: order.id,
            new_status: to,
            updated_by: "admin".into(),
            notes: None,
            tracking: None,
            expected_version,
        }
    }

    #[tokio::test]
    async fn test_create_order() {
        let (store, svc) = service();
        let order = svc.create_order(new_order(Uuid::new_v4())).await.unwrap();
        assert_eq!(order.order_number, "ORD-20250214-000001");
        assert_eq!(order.status, OrderStatus::Pending);
        assert_eq!(order.status_history.len(), 1);
        assert_eq!(order.version, 1);
        assert_eq!(order.items.len(), 2);
        assert_eq!(store.get_by_id(order.id).await.unwrap(), order);
    }

    #[tokio::test]
    async fn test_create_order_rejects_manipulated_total() {
        let (store, svc) = service();
        let mut input = new_order(Uuid::new_v4());
        input.total = dec!(10);
        let err = svc.create_order(input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
        assert_eq!(store.order_count().await, 0);
    }

    #[tokio::test]
    async fn test_create_order_rejects_subtotal_not_matching_items() {
        let (_, svc) = service();
        let mut input = new_order(Uuid::new_v4());
        input.subtotal = dec!(12000);
        input.total = dec!(12000);
        let err = svc.create_order(input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvariantViolation);
    }

    #[tokio::test]
    async fn test_status_update_with_stale_version_conflicts() {
        let (store, svc) = service();
        let order = svc.create_order(new_order(Uuid::new_v4())).await.unwrap();

        let updated = svc
            .update_order_status(status(&order, OrderStatus::Confirmed, Some(1)))
            .await
            .unwrap();
        assert_eq!(updated.version, 2);
        assert_eq!(updated.status_history.len(), 2);

        let err = svc
            .update_order_status(status(&order, OrderStatus::Processing, Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Conflict { expected: 1, actual: 2 }));
        assert_eq!(store.get_by_id(order.id).await.unwrap(), updated);
    }

    #[tokio::test]
    async fn test_state_machine_closure() {
        for from in OrderStatus::iter() {
            for to in OrderStatus::iter() {
                let (store, svc) = service();
                let mut order = svc.create_order(new_order(Uuid::new_v4())).await.unwrap();
                order.status = from;
                store.update_versioned(&order, 1, None).await.unwrap();

                let result = svc.update_order_status(status(&order, to, None)).await;
                if from.can_transition_to(to) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                } else {
                    let err = result.unwrap_err();
                    assert_eq!(err.kind(), ErrorKind::InvalidTransition, "{from} -> {to}");
                }
            }
        }
    }

    #[tokio::test]
    async fn test_cancel_from_pending_marks_refund() {
        let (_, svc) = service();
        let user = Uuid::new_v4();
        let order = svc.create_order(new_order(user)).await.unwrap();
        let cancelled = svc
            .cancel_order(CancelRequest {
                order_id: order.id,
                user_id: user,
                reason: Some("Ordered wrong size".into()),
            })
            .await
            .unwrap();
        assert_eq!(cancelled.status, OrderStatus::Cancelled);
        assert!(cancelled.cancelled_at.is_some());
        assert_eq!(cancelled.status_history.len(), 2);
        assert_eq!(cancelled.refund_status, RefundStatus::Pending);
    }

    #[tokio::test]
    async fn test_cancel_after_shipping_names_status() {
        let (store, svc) = service();
        let user = Uuid::new_v4();
        let mut order = svc.create_order(new_order(user)).await.unwrap();
        order.status = OrderStatus::Shipped;
        store.update_versioned(&order, 1, None).await.unwrap();

        let err = svc
            .cancel_order(CancelRequest {
                order_id: order.id,
                user_id: user,
                reason: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert!(err.to_string().contains("shipped"));
    }

    #[tokio::test]
    async fn test_cancel_other_users_order_is_not_found() {
        let (_, svc) = service();
        let order = svc.create_order(new_order(Uuid::new_v4())).await.unwrap();
        let err = svc
            .cancel_order(CancelRequest {
                order_id: order.id,
                user_id: Uuid::new_v4(),
                reason: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_tracking_requires_fulfilment_status() {
        let (_, svc) = service();
        let order = svc.create_order(new_order(Uuid::new_v4())).await.unwrap();
        let tracking = TrackingInfo {
            tracking_number: "BD123".into(),
            carrier: Some("BlueDart".into()),
            tracking_url: None,
        };
        let err = svc
            .update_tracking(TrackingUpdate {
                order_id: order.id,
                tracking: tracking.clone(),
                expected_version: None,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);

        svc.update_order_status(status(&order, OrderStatus::Confirmed, Some(1))).await.unwrap();
        let processing = svc
            .update_order_status(status(&order, OrderStatus::Processing, Some(2)))
            .await
            .unwrap();
        let tracked = svc
            .update_tracking(TrackingUpdate {
                order_id: order.id,
                tracking,
                expected_version: Some(processing.version),
            })
            .await
            .unwrap();
        assert_eq!(tracked.version, 4);
        assert_eq!(tracked.status_history.len(), 3);
        assert_eq!(tracked.tracking.unwrap().tracking_number, "BD123");
    }

    #[tokio::test]
    async fn test_process_refund_completes() {
        let (_, svc) = service();
        let user = Uuid::new_v4();
        let order = svc.create_order(new_order(user)).await.unwrap();
        svc.cancel_order(CancelRequest {
            order_id: order.id,
            user_id: user,
            reason: None,
        })
        .await
        .unwrap();

        let refunded = svc.process_refund(order.id).await.unwrap();
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
        assert_eq!(refunded.refund_status, RefundStatus::Completed);
        assert!(svc.process_refund(order.id).await.is_err());
    }

    /// Gateway whose refund call lets another writer edit the order first.
    struct RacingGateway {
        store: Arc<InMemoryStore>,
        refunds: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl PaymentGateway for RacingGateway {
        fn name(&self) -> &'static str {
            SANDBOX
        }

        async fn create_order(
            &self,
            _amount: Decimal,
            _currency: &str,
            _metadata: &HashMap<String, String>,
        ) -> Result<GatewayOrder, PaymentError> {
            Err(PaymentError::Config("not used".into()))
        }

        async fn fetch_order(&self, _gateway_order_id: &str) -> Result<GatewayOrder, PaymentError> {
            Err(PaymentError::Config("not used".into()))
        }

        fn verify_payment(&self, _payment_id: &str, _gateway_order_id: &str, _signature: &str) -> bool {
            false
        }

        async fn refund_payment(
            &self,
            payment_id: &str,
            _amount: Option<Decimal>,
            idempotency_key: &str,
        ) -> Result<Refund, PaymentError> {
            self.refunds.fetch_add(1, Ordering::SeqCst);
            let order_id: Uuid = idempotency_key.parse().unwrap();
            let mut order = self.store.get_by_id(order_id).await.unwrap();
            order.notes = Some("Customer asked for a callback".into());
            self.store.update_versioned(&order, order.version, None).await.unwrap();
            if self.fail {
                return Err(PaymentError::Gateway {
                    status: 502,
                    body: "gateway unavailable".into(),
                });
            }
            Ok(Refund {
                id: "rfnd_race".into(),
                payment_id: payment_id.into(),
                amount: 0,
                status: "processed".into(),
            })
        }

        async fn get_payment_details(&self, _payment_id: &str) -> Result<PaymentDetails, PaymentError> {
            Err(PaymentError::Config("not used".into()))
        }
    }

    async fn cancelled_paid_order(
        fail: bool,
    ) -> (Arc<InMemoryStore>, Arc<RacingGateway>, Arc<PaymentGatewayFactory>, OrderServiceImpl, Order) {
        let store = Arc::new(InMemoryStore::new());
        let gateway = Arc::new(RacingGateway {
            store: store.clone(),
            refunds: AtomicUsize::new(0),
            fail,
        });
        let payments = sandbox_factory();
        payments.register(SANDBOX, gateway.clone());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 2, 14, 10, 30, 0).unwrap()));
        let svc = OrderServiceImpl::new(store.clone(), payments.clone(), clock);

        let user = Uuid::new_v4();
        let order = svc.create_order(new_order(user)).await.unwrap();
        let cancelled = svc
            .cancel_order(CancelRequest {
                order_id: order.id,
                user_id: user,
                reason: None,
            })
            .await
            .unwrap();
        (store, gateway, payments, svc, cancelled)
    }

    #[tokio::test]
    async fn test_refund_recorded_despite_concurrent_edit() {
        let (store, gateway, _, svc, order) = cancelled_paid_order(false).await;
        assert_eq!(order.version, 2);

        let refunded = svc.process_refund(order.id).await.unwrap();
        assert_eq!(refunded.refund_status, RefundStatus::Completed);
        assert_eq!(refunded.payment_status, PaymentStatus::Refunded);
        assert_eq!(refunded.notes.as_deref(), Some("Customer asked for a callback"));
        // cancel 2, claim 3, concurrent edit 4, outcome 5
        assert_eq!(store.get_by_id(order.id).await.unwrap().version, 5);

        let err = svc.process_refund(order.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert_eq!(gateway.refunds.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refund_claim_blocks_second_run() {
        let (store, _, _, svc, order) = cancelled_paid_order(false).await;
        let mut claimed = store.get_by_id(order.id).await.unwrap();
        claimed.refund_status = RefundStatus::Processing;
        store.update_versioned(&claimed, claimed.version, None).await.unwrap();

        let err = svc.process_refund(order.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert!(err.to_string().contains("processing"));
    }

    #[tokio::test]
    async fn test_failed_refund_reports_gateway_error_and_can_retry() {
        let (store, gateway, payments, svc, order) = cancelled_paid_order(true).await;

        let err = svc.process_refund(order.id).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
        assert!(err.to_string().contains("502"));
        assert_eq!(store.get_by_id(order.id).await.unwrap().refund_status, RefundStatus::Failed);
        assert_eq!(gateway.refunds.load(Ordering::SeqCst), 1);

        payments.register(SANDBOX, Arc::new(SandboxGateway::new("sandbox").unwrap()));
        let refunded = svc.process_refund(order.id).await.unwrap();
        assert_eq!(refunded.refund_status, RefundStatus::Completed);
    }

    #[tokio::test]
    async fn test_list_orders_paginates() {
        let (_, svc) = service();
        for _ in 0..3 {
            svc.create_order(new_order(Uuid::new_v4())).await.unwrap();
        }
        let page = svc
            .list_orders(OrderListFilter::default(), Pagination { page: 1, limit: 2 })
            .await
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.orders.len(), 2);
        assert_eq!(page.total_pages, 2);
    }
}
