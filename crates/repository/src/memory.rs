//! Process-local implementation of every repository trait.
//!
//! Writes follow the same rules as the PostgreSQL implementations: order
//! updates are compare-and-swap on `version`, coupon usage is a guarded
//! increment. Nothing survives a restart.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use model::{
    BusinessOrigin, Coupon, DeliverySettings, NotificationLogEntry, Order, OrderFigures, Pagination, ReportJob, Role,
    StatusHistoryEntry,
};
use rust_decimal::Decimal;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::{
    CouponsRepository, DeliverySettingsRepository, NotificationLogRepository, OrderListFilter, OrdersRepository,
    ProfilesRepository, ReportJobsRepository, RepositoryError,
};

#[derive(Debug, Clone, PartialEq)]
pub struct CouponUsage {
    pub coupon_id: Uuid,
    pub user_id: Option<Uuid>,
    pub order_id: Uuid,
}

#[derive(Debug, Default)]
struct State {
    order_seq: i64,
    orders: HashMap<Uuid, Order>,
    coupons: HashMap<Uuid, Coupon>,
    coupon_usages: Vec<CouponUsage>,
    settings: Option<DeliverySettings>,
    report_jobs: HashMap<Uuid, ReportJob>,
    roles: HashMap<Uuid, Role>,
    notification_log: Vec<NotificationLogEntry>,
}

/// In-memory store used by the test suites and by demo runs without a database.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<State>,
}

/// Settings matching the seed row of the SQL migrations: a Mumbai origin
/// charging 40/60/80/100 with free shipping from 25000.
pub fn default_delivery_settings(now: DateTime<Utc>) -> DeliverySettings {
    DeliverySettings {
        origin: BusinessOrigin {
            pincode: "400001".into(),
            city: "Mumbai".into(),
            state: "Maharashtra".into(),
            latitude: 18.9388,
            longitude: 72.8354,
        },
        local_delivery_charge: Decimal::from(40),
        city_delivery_charge: Decimal::from(60),
        state_delivery_charge: Decimal::from(80),
        national_delivery_charge: Decimal::from(100),
        free_shipping_threshold: Decimal::from(25000),
        free_shipping_enabled: true,
        updated_at: now,
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store pre-seeded with [`default_delivery_settings`].
    pub fn seeded(now: DateTime<Utc>) -> Self {
        Self {
            state: Mutex::new(State {
                settings: Some(default_delivery_settings(now)),
                ..State::default()
            }),
        }
    }

    pub async fn insert_coupon(&self, coupon: Coupon) {
        self.state.lock().await.coupons.insert(coupon.id, coupon);
    }

    pub async fn coupon(&self, id: Uuid) -> Option<Coupon> {
        self.state.lock().await.coupons.get(&id).cloned()
    }

    pub async fn coupon_usages(&self) -> Vec<CouponUsage> {
        self.state.lock().await.coupon_usages.clone()
    }

    pub async fn set_settings(&self, settings: DeliverySettings) {
        self.state.lock().await.settings = Some(settings);
    }

    pub async fn set_role(&self, user_id: Uuid, role: Role) {
        self.state.lock().await.roles.insert(user_id, role);
    }

    pub async fn notification_log(&self) -> Vec<NotificationLogEntry> {
        self.state.lock().await.notification_log.clone()
    }

    pub async fn order_count(&self) -> usize {
        self.state.lock().await.orders.len()
    }
}

fn matching_newest_first<'a>(state: &'a State, filter: &OrderListFilter) -> Vec<&'a Order> {
    let mut orders: Vec<&Order> = state.orders.values().filter(|o| filter.matches(o)).collect();
    orders.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.order_number.cmp(&a.order_number)));
    orders
}

#[async_trait]
impl OrdersRepository for InMemoryStore {
    async fn next_order_sequence(&self) -> Result<i64, RepositoryError> {
        let mut state = self.state.lock().await;
        state.order_seq += 1;
        Ok(state.order_seq)
    }

    async fn insert(&self, order: &Order) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.id) {
            return Err(RepositoryError::Duplicate("order id".into()));
        }
        let taken = |key: fn(&Order) -> Option<&str>| {
            key(order).is_some_and(|k| state.orders.values().any(|o| key(o) == Some(k)))
        };
        if taken(|o| o.payment_id.as_deref()) {
            return Err(RepositoryError::Duplicate("payment_id".into()));
        }
        if taken(|o| o.gateway_order_id.as_deref()) {
            return Err(RepositoryError::Duplicate("gateway_order_id".into()));
        }
        state.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Order, RepositoryError> {
        self.state.lock().await.orders.get(&id).cloned().ok_or(RepositoryError::NotFound)
    }

    async fn update_versioned(
        &self,
        order: &Order,
        expected_version: i32,
        history: Option<&StatusHistoryEntry>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let stored = state.orders.get_mut(&order.id).ok_or(RepositoryError::NotFound)?;
        if stored.version != expected_version {
            return Err(RepositoryError::VersionMismatch {
                expected: expected_version,
                actual: stored.version,
            });
        }
        let mut history_log = std::mem::take(&mut stored.status_history);
        if let Some(entry) = history {
            history_log.push(entry.clone());
        }
        *stored = Order {
            status_history: history_log,
            items: std::mem::take(&mut stored.items),
            version: expected_version + 1,
            ..order.clone()
        };
        Ok(())
    }

    async fn list(&self, filter: &OrderListFilter, page: Pagination) -> Result<(Vec<Order>, u64), RepositoryError> {
        let state = self.state.lock().await;
        let matching = matching_newest_first(&state, filter);
        let total = matching.len() as u64;
        let orders = matching
            .into_iter()
            .skip(usize::try_from(page.offset()).unwrap_or(usize::MAX))
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok((orders, total))
    }

    async fn count(&self, filter: &OrderListFilter) -> Result<u64, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.orders.values().filter(|o| filter.matches(o)).count() as u64)
    }

    async fn figures(&self, filter: &OrderListFilter) -> Result<Vec<OrderFigures>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(matching_newest_first(&state, filter).into_iter().map(OrderFigures::from).collect())
    }
}

#[async_trait]
impl CouponsRepository for InMemoryStore {
    async fn get_by_code(&self, code: &str) -> Result<Option<Coupon>, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state.coupons.values().find(|c| c.code == code).cloned())
    }

    async fn count_user_usage(&self, coupon_id: Uuid, user_id: Uuid) -> Result<i64, RepositoryError> {
        let state = self.state.lock().await;
        Ok(state
            .coupon_usages
            .iter()
            .filter(|u| u.coupon_id == coupon_id && u.user_id == Some(user_id))
            .count() as i64)
    }

    async fn record_usage(&self, coupon_id: Uuid, user_id: Option<Uuid>, order_id: Uuid) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let coupon = state.coupons.get_mut(&coupon_id).ok_or(RepositoryError::NotFound)?;
        if coupon.usage_exhausted() {
            return Err(RepositoryError::LimitReached);
        }
        coupon.usage_count += 1;
        state.coupon_usages.push(CouponUsage {
            coupon_id,
            user_id,
            order_id,
        });
        Ok(())
    }
}

#[async_trait]
impl DeliverySettingsRepository for InMemoryStore {
    async fn get(&self) -> Result<DeliverySettings, RepositoryError> {
        self.state.lock().await.settings.clone().ok_or(RepositoryError::NotFound)
    }

    async fn update(&self, settings: &DeliverySettings) -> Result<(), RepositoryError> {
        self.state.lock().await.settings = Some(settings.clone());
        Ok(())
    }
}

#[async_trait]
impl ReportJobsRepository for InMemoryStore {
    async fn insert(&self, job: &ReportJob) -> Result<(), RepositoryError> {
        self.state.lock().await.report_jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ReportJob>, RepositoryError> {
        Ok(self.state.lock().await.report_jobs.get(&id).cloned())
    }

    async fn update(&self, job: &ReportJob) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().await;
        let stored = state.report_jobs.get_mut(&job.id).ok_or(RepositoryError::NotFound)?;
        *stored = job.clone();
        Ok(())
    }
}

#[async_trait]
impl ProfilesRepository for InMemoryStore {
    async fn get_role(&self, user_id: Uuid) -> Result<Option<Role>, RepositoryError> {
        Ok(self.state.lock().await.roles.get(&user_id).copied())
    }
}

#[async_trait]
impl NotificationLogRepository for InMemoryStore {
    async fn insert(&self, entry: &NotificationLogEntry) -> Result<(), RepositoryError> {
        self.state.lock().await.notification_log.push(entry.clone());
        Ok(())
    }
}
