//! Server crate provides the HTTP surface of the storefront backend.
//!
//! It routes checkout, customer order and admin requests to the service
//! layer, maps [`service::ServiceError`] onto status codes, enforces rate
//! limits and exposes Prometheus metrics.

pub mod auth;
pub mod error;
pub mod handlers;
pub mod metrics;

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Router, middleware};
use prometheus::Encoder;
use rate_limiter::RateLimiter;
use repository::ProfilesRepository;
use service::checkout::CheckoutService;
use service::delivery::DeliveryPricing;
use service::notification::NotificationService;
use service::order::OrderService;
use service::report::ReportService;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::Notify;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

pub use metrics::Metrics;

use handlers::{admin, checkout, orders};

/// Application state shared between request handlers.
#[derive(Clone)]
pub struct AppState {
    pub orders: Arc<dyn OrderService>,
    pub checkout: Arc<CheckoutService>,
    pub delivery: Arc<DeliveryPricing>,
    pub notifications: NotificationService,
    pub reports: ReportService,
    pub profiles: Arc<dyn ProfilesRepository>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
}

/// Builds the full route table over `state`.
pub fn router(state: AppState) -> Router {
    let metrics = state.metrics.clone();
    Router::new()
        .route(
            "/api/checkout/calculate-delivery",
            get(checkout::quote_delivery_query).post(checkout::quote_delivery),
        )
        .route("/api/checkout/validate-coupon", post(checkout::validate_coupon))
        .route("/api/checkout/create-payment", post(checkout::create_payment))
        .route("/api/checkout/verify-payment", post(checkout::verify_payment))
        .route("/api/checkout/cod-order", post(checkout::place_cod_order))
        .route("/api/orders/{id}", get(orders::get_order))
        .route("/api/orders/{id}/cancel", post(orders::cancel_order))
        .route("/api/admin/orders", get(admin::list_orders))
        .route("/api/admin/orders/{id}", get(admin::get_order))
        .route("/api/admin/orders/{id}/status", put(admin::update_status))
        .route("/api/admin/orders/{id}/tracking", put(admin::update_tracking))
        .route(
            "/api/admin/delivery-settings",
            get(admin::get_delivery_settings).put(admin::update_delivery_settings),
        )
        .route("/api/admin/reports", get(admin::generate_report))
        .route("/api/admin/reports/{job_id}", get(admin::report_job))
        .route("/api/admin/notifications/batches", get(admin::notification_batches))
        .route("/health", get(handle_health))
        .route("/metrics", get(handle_metrics))
        .layer(middleware::from_fn_with_state(metrics, metrics::track))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Server represents the HTTP listener and its routes.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(port: u16, state: AppState) -> Self {
        info!(port, "Initializing HTTP server");
        Self { port, state }
    }

    /// Serves until `shutdown` is notified, then drains in-flight requests.
    pub async fn start(&self, shutdown: Arc<Notify>) -> Result<()> {
        let stop = shutdown.notified_owned();
        let app = router(self.state.clone());
        let listener = TcpListener::bind(("0.0.0.0", self.port))
            .await
            .with_context(|| format!("Failed to bind to port {}", self.port))?;

        info!(port = self.port, "HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(stop)
            .await
            .context("Server error")?;

        info!("HTTP server shut down gracefully");
        Ok(())
    }
}

async fn handle_health() -> &'static str {
    "OK"
}

async fn handle_metrics(State(state): State<AppState>) -> Response {
    let encoder = prometheus::TextEncoder::new();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&state.metrics.registry().gather(), &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to encode metrics").into_response();
    }

    match String::from_utf8(buffer) {
        Ok(metrics_text) => (StatusCode::OK, metrics_text).into_response(),
        Err(e) => {
            error!(error = %e, "Failed to convert metrics to UTF-8");
            (StatusCode::INTERNAL_SERVER_ERROR, "Invalid metrics data").into_response()
        }
    }
}

/// Resolves on Ctrl+C or, on unix, SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
