//! Domain model for the jewellery storefront backend.
//!
//! Every other crate in the workspace speaks in these types: orders and their
//! audit trail, coupons, delivery settings, report jobs and the small value
//! helpers (money rounding, clocks) they share.

pub mod clock;
pub mod coupon;
pub mod delivery;
pub mod money;
pub mod notification;
pub mod order;
pub mod pagination;
pub mod report;
pub mod user;

pub use clock::{Clock, ManualClock, SystemClock};
pub use coupon::{Coupon, DiscountType};
pub use delivery::{BusinessOrigin, DeliverySettings, DeliveryZone, GeoLocation};
pub use money::{MONEY_EPSILON, MoneyError};
pub use notification::{NotificationLogEntry, NotificationOutcome};
pub use order::{
    Order, OrderItem, OrderStatus, PaymentMethod, PaymentStatus, RefundStatus, ShippingAddress,
    StatusHistoryEntry, TrackingInfo,
};
pub use report::{JobTransitionError, OrderFigures, ReportFilters, ReportJob, ReportJobStatus, ReportMetrics, StatusBreakdown};
pub use pagination::Pagination;
pub use user::Role;
