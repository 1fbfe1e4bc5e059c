//! # Service Layer
//!
//! Business logic for checkout and the order lifecycle. Each service holds
//! its collaborators behind `Arc<dyn Trait>` so the binary wires Postgres
//! repositories and real HTTP adapters while tests wire the in-memory store,
//! a manual clock and table-driven fakes.
//!
//! - [`coupon::CouponService`]: coupon validation and usage accounting
//! - [`delivery::DeliveryPricing`]: zone resolution and delivery charges
//! - [`payment::PaymentGatewayFactory`]: gateway adapters with a fallback
//! - [`order::OrderServiceImpl`]: the order aggregate and its state machine
//! - [`checkout::CheckoutService`]: server-side pricing and order placement
//! - [`notification::NotificationService`]: customer mail and admin digests
//! - [`report::ReportService`]: order metrics, inline or as background jobs

pub mod checkout;
pub mod coupon;
pub mod delivery;
pub mod error;
pub mod notification;
pub mod order;
pub mod payment;
pub mod report;

pub use error::{ErrorKind, ServiceError};
