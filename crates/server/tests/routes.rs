use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{HeaderMap, Request, StatusCode};
use chrono::Duration;
use model::{Clock, GeoLocation, Role, SystemClock};
use rate_limiter::RateLimiter;
use repository::InMemoryStore;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::{Value, json};
use server::{AppState, Metrics, router};
use service::checkout::CheckoutService;
use service::coupon::CouponService;
use service::delivery::{DeliveryPricing, GeocodeError, Geocoder, ZonePolicy};
use service::notification::{LogMailSender, ManualScheduler, NotificationService};
use service::order::OrderServiceImpl;
use service::payment::{GatewayCredentials, PaymentGatewayFactory, SANDBOX, sign_payment};
use service::report::ReportService;
use tower::ServiceExt;
use uuid::Uuid;

/// Knows one pincode a short drive from the Mumbai origin.
struct FixedGeocoder;

#[async_trait]
impl Geocoder for FixedGeocoder {
    async fn geocode(&self, pincode: &str) -> Result<Option<GeoLocation>, GeocodeError> {
        match pincode {
            "400002" => Ok(Some(GeoLocation {
                latitude: 18.9470,
                longitude: 72.8260,
                city: Some("Mumbai".into()),
                state: Some("Maharashtra".into()),
            })),
            _ => Err(GeocodeError::Status(503)),
        }
    }
}

struct TestApp {
    router: Router,
    store: Arc<InMemoryStore>,
}

fn app() -> TestApp {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = Arc::new(InMemoryStore::seeded(clock.now()));
    let payments = Arc::new(PaymentGatewayFactory::new(
        GatewayCredentials {
            sandbox_secret: "sandbox".into(),
            ..Default::default()
        },
        SANDBOX,
        None,
    ));
    let orders = Arc::new(OrderServiceImpl::new(store.clone(), payments.clone(), clock.clone()));
    let coupons = Arc::new(CouponService::new(store.clone(), Duration::minutes(5), clock.clone()));
    let delivery = Arc::new(DeliveryPricing::new(
        store.clone(),
        Arc::new(FixedGeocoder),
        ZonePolicy::default(),
        Duration::hours(24),
        Duration::minutes(5),
        clock.clone(),
    ));
    let notifications = NotificationService::new(
        Arc::new(LogMailSender),
        store.clone(),
        Arc::new(ManualScheduler::new(clock.clone())),
        clock.clone(),
        Duration::minutes(5),
        "admin@example.com",
    );
    let checkout = Arc::new(CheckoutService::new(
        coupons,
        delivery.clone(),
        payments,
        orders.clone(),
        notifications.clone(),
        dec!(0.10),
        "INR",
    ));
    let state = AppState {
        orders,
        checkout,
        delivery,
        notifications,
        reports: ReportService::new(store.clone(), store.clone(), clock.clone(), 1000),
        profiles: store.clone(),
        rate_limiter: Arc::new(RateLimiter::new(clock)),
        metrics: Arc::new(Metrics::new().unwrap()),
    };
    TestApp {
        router: router(state),
        store,
    }
}

impl TestApp {
    async fn send(&self, req: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.router.clone().oneshot(req).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, headers, body)
    }

    async fn admin(&self) -> Uuid {
        let id = Uuid::new_v4();
        self.store.set_role(id, Role::Admin).await;
        id
    }
}

fn get(uri: &str, user: Option<Uuid>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    builder.body(Body::empty()).unwrap()
}

fn send_json(method: &str, uri: &str, user: Option<Uuid>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("x-forwarded-for", "203.0.113.7");
    if let Some(user) = user {
        builder = builder.header("x-user-id", user.to_string());
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

fn money(v: &Value) -> Decimal {
    Decimal::from_str(v.as_str().unwrap()).unwrap()
}

fn cod_order_body() -> Value {
    json!({
        "customerEmail": "Asha@Example.com",
        "items": [
            { "productId": Uuid::new_v4(), "productName": "Silver anklet", "price": 1000.0, "quantity": 2 }
        ],
        "shippingAddress": {
            "name": "Asha Rao",
            "phone": "9876543210",
            "street": "4 Marine Drive",
            "city": "Mumbai",
            "state": "Maharashtra",
            "pincode": "400002"
        }
    })
}

async fn place_cod_order(app: &TestApp, customer: Uuid) -> Value {
    let (status, _, body) = app
        .send(send_json("POST", "/api/checkout/cod-order", Some(customer), cod_order_body()))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

async fn open_gateway_order(app: &TestApp, customer: Uuid, amount: f64) -> String {
    let (status, _, body) = app
        .send(send_json(
            "POST",
            "/api/checkout/create-payment",
            Some(customer),
            json!({ "amount": amount, "paymentMethod": "razorpay" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["orderId"].as_str().unwrap().to_string()
}

fn verify_body(gateway_order_id: &str, payment_id: &str) -> Value {
    json!({
        "razorpay_payment_id": payment_id,
        "razorpay_order_id": gateway_order_id,
        "razorpay_signature": sign_payment("sandbox", gateway_order_id, payment_id),
        "orderData": cod_order_body(),
    })
}

#[tokio::test]
async fn health_and_metrics() {
    let app = app();
    let response = app.router.clone().oneshot(get("/health", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&bytes[..], b"OK");

    let response = app.router.clone().oneshot(get("/metrics", None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("http_requests_total"));
    assert!(text.contains("endpoint=\"/health\""));
}

#[tokio::test]
async fn delivery_quote_by_zone_and_fallback() {
    let app = app();
    let (status, _, body) = app
        .send(get("/api/checkout/calculate-delivery?pincode=400002&orderSubtotal=500", None))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["zone"], "local");
    assert_eq!(money(&body["deliveryCharge"]), dec!(40));
    assert_eq!(body["isStandardCharge"], false);

    let (status, _, body) = app
        .send(send_json(
            "POST",
            "/api/checkout/calculate-delivery",
            None,
            json!({ "pincode": "110001", "orderSubtotal": 500 }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isStandardCharge"], true);
    assert_eq!(money(&body["deliveryCharge"]), dec!(100));

    let (status, _, body) = app
        .send(get("/api/checkout/calculate-delivery?pincode=0123&orderSubtotal=500", None))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");
}

#[tokio::test]
async fn coupon_refusal_then_rate_limit() {
    let app = app();
    let request = || {
        send_json(
            "POST",
            "/api/checkout/validate-coupon",
            None,
            json!({ "couponCode": "NOPE", "orderSubtotal": 1000 }),
        )
    };
    for _ in 0..5 {
        let (status, _, body) = app.send(request()).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["valid"], false);
        assert!(body["error"].is_string());
    }

    let (status, headers, body) = app.send(request()).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(headers.contains_key("retry-after"));
    assert_eq!(headers["x-ratelimit-limit"], "5");
    assert_eq!(headers["x-ratelimit-remaining"], "0");
    assert_eq!(body["code"], "RATE_LIMITED");
}

#[tokio::test]
async fn admin_routes_require_admin_role() {
    let app = app();
    let (status, _, _) = app.send(get("/api/admin/orders", None)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _, body) = app.send(get("/api/admin/orders", Some(Uuid::new_v4()))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "FORBIDDEN");

    let admin = app.admin().await;
    let (status, _, body) = app.send(get("/api/admin/orders?page=1&limit=10", Some(admin))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total"], 0);
    assert_eq!(body["limit"], 10);
}

#[tokio::test]
async fn cod_order_is_priced_on_the_server() {
    let app = app();
    let customer = Uuid::new_v4();
    let body = place_cod_order(&app, customer).await;
    assert_eq!(body["success"], true);
    // 2000 + 40 local delivery + 10% tax on 2040
    assert_eq!(money(&body["order"]["total"]), dec!(2244));
    assert_eq!(body["order"]["status"], "pending");
    assert!(body["order"]["order_number"].as_str().unwrap().starts_with("ORD-"));
    assert_eq!(app.store.order_count().await, 1);

    let mut tampered = cod_order_body();
    tampered["total"] = json!(10.0);
    let (status, _, body) = app
        .send(send_json("POST", "/api/checkout/cod-order", Some(customer), tampered))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVARIANT_VIOLATION");
    assert_eq!(app.store.order_count().await, 1);
}

#[tokio::test]
async fn create_payment_returns_gateway_order() {
    let app = app();
    let customer = Uuid::new_v4();
    let (status, _, body) = app
        .send(send_json(
            "POST",
            "/api/checkout/create-payment",
            Some(customer),
            json!({ "amount": 2244.0, "paymentMethod": "razorpay" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["amountMinor"], 224_400);
    assert_eq!(body["gateway"], "sandbox");
    assert!(body["orderId"].as_str().unwrap().starts_with("order_sandbox_"));

    let (status, _, body) = app
        .send(send_json(
            "POST",
            "/api/checkout/create-payment",
            Some(customer),
            json!({ "amount": 500.0, "paymentMethod": "cod" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["orderId"].is_null());

    let (status, _, _) = app
        .send(send_json(
            "POST",
            "/api/checkout/create-payment",
            None,
            json!({ "amount": 500.0, "paymentMethod": "razorpay" }),
        ))
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn status_update_with_stale_version_conflicts() {
    let app = app();
    let placed = place_cod_order(&app, Uuid::new_v4()).await;
    let order_id = placed["order"]["id"].as_str().unwrap().to_string();
    let admin = app.admin().await;
    let uri = format!("/api/admin/orders/{order_id}/status");

    let (status, _, body) = app
        .send(send_json(
            "PUT",
            &uri,
            Some(admin),
            json!({ "new_status": "confirmed", "expected_version": 0 }),
        ))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["conflict"], true);
    assert_eq!(body["currentVersion"], 1);

    let (status, _, body) = app
        .send(send_json(
            "PUT",
            &uri,
            Some(admin),
            json!({ "new_status": "confirmed", "expected_version": 1, "notes": "Stock checked" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["version"], 2);

    let (status, _, body) = app
        .send(send_json("PUT", &uri, Some(admin), json!({ "new_status": "delivered" })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "INVALID_TRANSITION");
}

#[tokio::test]
async fn customer_cancels_own_order_only() {
    let app = app();
    let customer = Uuid::new_v4();
    let placed = place_cod_order(&app, customer).await;
    let order_id = placed["order"]["id"].as_str().unwrap().to_string();
    let uri = format!("/api/orders/{order_id}/cancel");

    let (status, _, _) = app
        .send(send_json("POST", &uri, Some(Uuid::new_v4()), json!({ "reason": "mine now" })))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _, body) = app
        .send(send_json("POST", &uri, Some(customer), json!({ "reason": "Ordered twice" })))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");
    assert_eq!(body["refund_status"], "not_required");

    let (status, _, _) = app
        .send(send_json("POST", &uri, Some(customer), json!({})))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn reports_inline_and_unknown_job() {
    let app = app();
    place_cod_order(&app, Uuid::new_v4()).await;
    let admin = app.admin().await;

    let (status, _, body) = app.send(get("/api/admin/reports", Some(admin))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["total_orders"], 1);
    assert_eq!(money(&body["total_revenue"]), dec!(2244));

    let (status, _, body) = app
        .send(get(&format!("/api/admin/reports/{}", Uuid::new_v4()), Some(admin)))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn delivery_settings_round_trip() {
    let app = app();
    let admin = app.admin().await;
    let (status, _, body) = app
        .send(send_json(
            "PUT",
            "/api/admin/delivery-settings",
            Some(admin),
            json!({
                "local_delivery_charge": 30.0,
                "city_delivery_charge": 50.0,
                "state_delivery_charge": 70.0,
                "national_delivery_charge": 90.0,
                "free_shipping_threshold": 20000.0,
                "free_shipping_enabled": true
            }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["origin"]["pincode"], "400001");

    let (_, _, body) = app
        .send(get("/api/checkout/calculate-delivery?pincode=400002&orderSubtotal=500", None))
        .await;
    assert_eq!(money(&body["deliveryCharge"]), dec!(30));

    let (status, _, _) = app
        .send(send_json(
            "PUT",
            "/api/admin/delivery-settings",
            Some(admin),
            json!({
                "local_delivery_charge": -1.0,
                "city_delivery_charge": 50.0,
                "state_delivery_charge": 70.0,
                "national_delivery_charge": 90.0,
                "free_shipping_threshold": 20000.0,
                "free_shipping_enabled": true
            }),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn verify_payment_binds_amount_and_rejects_reuse() {
    let app = app();
    let customer = Uuid::new_v4();

    let short = open_gateway_order(&app, customer, 1000.0).await;
    let (status, _, body) = app
        .send(send_json(
            "POST",
            "/api/checkout/verify-payment",
            Some(customer),
            verify_body(&short, "pay_short"),
        ))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BUSINESS_RULE");
    assert_eq!(app.store.order_count().await, 0);

    let full = open_gateway_order(&app, customer, 2244.0).await;
    let paid = verify_body(&full, "pay_full");
    let (status, _, body) = app
        .send(send_json("POST", "/api/checkout/verify-payment", Some(customer), paid.clone()))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(money(&body["order"]["total"]), dec!(2244));

    let (status, _, body) = app
        .send(send_json("POST", "/api/checkout/verify-payment", Some(customer), paid))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");
    assert_eq!(app.store.order_count().await, 1);
}

#[tokio::test]
async fn admin_cancel_of_paid_order_refunds_it() {
    let app = app();
    let customer = Uuid::new_v4();
    let gateway_order = open_gateway_order(&app, customer, 2244.0).await;
    let (status, _, body) = app
        .send(send_json(
            "POST",
            "/api/checkout/verify-payment",
            Some(customer),
            verify_body(&gateway_order, "pay_admin_cancel"),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let order_id = body["order"]["id"].as_str().unwrap().to_string();

    let admin = app.admin().await;
    let (status, _, body) = app
        .send(send_json(
            "PUT",
            &format!("/api/admin/orders/{order_id}/status"),
            Some(admin),
            json!({ "new_status": "cancelled", "notes": "Out of stock" }),
        ))
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["refund_status"], "pending");

    let uri = format!("/api/admin/orders/{order_id}");
    let mut order = Value::Null;
    for _ in 0..50 {
        let (status, _, body) = app.send(get(&uri, Some(admin))).await;
        assert_eq!(status, StatusCode::OK);
        order = body;
        if order["refund_status"] == "completed" {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(order["refund_status"], "completed");
    assert_eq!(order["payment_status"], "refunded");
    assert_eq!(order["status"], "cancelled");
}
