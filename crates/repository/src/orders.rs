//! Orders, their line items and their status history.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::Pool;
use model::{
    Order, OrderFigures, OrderItem, OrderStatus, Pagination, PaymentStatus, ReportFilters, ShippingAddress,
    StatusHistoryEntry, TrackingInfo,
};
use postgres_types::{Json, ToSql};
use rust_decimal::Decimal;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Row, Transaction};
use uuid::Uuid;

use crate::{RepositoryError, decode, text};

/// Filters for the admin order listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OrderListFilter {
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Matched against order number, customer email, name and phone.
    pub search: Option<String>,
}

impl From<&ReportFilters> for OrderListFilter {
    fn from(f: &ReportFilters) -> Self {
        Self {
            status: f.status,
            payment_status: f.payment_status,
            from: f.from,
            to: f.to,
            search: None,
        }
    }
}

impl OrderListFilter {
    pub fn matches(&self, order: &Order) -> bool {
        let base = ReportFilters {
            from: self.from,
            to: self.to,
            status: self.status,
            payment_status: self.payment_status,
        };
        if !base.matches(order) {
            return false;
        }
        match self.search.as_deref().map(str::to_lowercase) {
            None => true,
            Some(needle) => [
                order.order_number.as_str(),
                order.customer_email.as_str(),
                order.shipping_address.name.as_str(),
                order.shipping_address.phone.as_str(),
            ]
            .iter()
            .any(|hay| hay.to_lowercase().contains(&needle)),
        }
    }
}

/// # OrdersRepository
///
/// Persistence for the order aggregate. Every write is atomic: an order is
/// stored together with its items and history, and every update is
/// conditional on the version the caller read.
#[async_trait]
pub trait OrdersRepository: Send + Sync {
    /// Next value of the order-number sequence.
    async fn next_order_sequence(&self) -> Result<i64, RepositoryError>;

    /// Stores a new order with its items and initial history in one transaction.
    async fn insert(&self, order: &Order) -> Result<(), RepositoryError>;

    /// Loads a fully hydrated order.
    async fn get_by_id(&self, id: Uuid) -> Result<Order, RepositoryError>;

    /// Writes the mutable fields of `order` if and only if the stored version
    /// equals `expected_version`; the stored version becomes
    /// `expected_version + 1`. `history` is appended in the same transaction.
    ///
    /// Returns [`RepositoryError::VersionMismatch`] when another writer got there first.
    async fn update_versioned(
        &self,
        order: &Order,
        expected_version: i32,
        history: Option<&StatusHistoryEntry>,
    ) -> Result<(), RepositoryError>;

    /// One page of orders, newest first, plus the total match count.
    async fn list(&self, filter: &OrderListFilter, page: Pagination) -> Result<(Vec<Order>, u64), RepositoryError>;

    async fn count(&self, filter: &OrderListFilter) -> Result<u64, RepositoryError>;

    /// Figures of every matching order, for report aggregation.
    async fn figures(&self, filter: &OrderListFilter) -> Result<Vec<OrderFigures>, RepositoryError>;
}

/// PostgreSQL implementation of the OrdersRepository trait.
pub struct PgOrdersRepository {
    pool: Pool,
}

impl PgOrdersRepository {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    async fn insert_tx(tx: &Transaction<'_>, order: &Order) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO orders (
                id, order_number, user_id, customer_email, subtotal, discount, delivery_charge, tax, total,
                coupon_code, status, payment_method, payment_status, refund_status, payment_id, gateway_order_id,
                shipping_address, tracking_number, tracking_carrier, tracking_url, notes, cancelled_at,
                cancellation_reason, version, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20,
                    $21, $22, $23, $24, $25, $26)
        "#;
        let tracking = order.tracking.as_ref();
        tx.execute(query, &[
            &order.id,
            &order.order_number,
            &order.user_id,
            &order.customer_email,
            &order.subtotal,
            &order.discount,
            &order.delivery_charge,
            &order.tax,
            &order.total,
            &order.coupon_code,
            &text(&order.status),
            &text(&order.payment_method),
            &text(&order.payment_status),
            &text(&order.refund_status),
            &order.payment_id,
            &order.gateway_order_id,
            &Json(&order.shipping_address),
            &tracking.map(|t| t.tracking_number.as_str()),
            &tracking.and_then(|t| t.carrier.as_deref()),
            &tracking.and_then(|t| t.tracking_url.as_deref()),
            &order.notes,
            &order.cancelled_at,
            &order.cancellation_reason,
            &order.version,
            &order.created_at,
            &order.updated_at,
        ]).await?;
        Self::insert_items_tx(tx, order.id, &order.items).await?;
        for entry in &order.status_history {
            Self::insert_history_tx(tx, order.id, entry).await?;
        }
        Ok(())
    }

    async fn insert_items_tx(tx: &Transaction<'_>, order_id: Uuid, items: &[OrderItem]) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO order_items (order_id, position, product_id, product_name, unit_price, quantity, subtotal)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#;
        for (position, it) in items.iter().enumerate() {
            let position = position as i32;
            tx.execute(query, &[
                &order_id, &position, &it.product_id, &it.product_name, &it.unit_price, &it.quantity, &it.subtotal,
            ]).await?;
        }
        Ok(())
    }

    async fn insert_history_tx(
        tx: &Transaction<'_>,
        order_id: Uuid,
        entry: &StatusHistoryEntry,
    ) -> Result<(), RepositoryError> {
        let query = r#"
            INSERT INTO order_status_history (order_id, status, updated_by, notes, created_at)
            VALUES ($1, $2, $3, $4, $5)
        "#;
        tx.execute(query, &[
            &order_id,
            &text(&entry.status),
            &entry.updated_by,
            &entry.notes,
            &entry.timestamp,
        ]).await?;
        Ok(())
    }

    /// Attaches items and history to bare order headers with two batched queries.
    async fn hydrate(&self, mut orders: Vec<Order>) -> Result<Vec<Order>, RepositoryError> {
        if orders.is_empty() {
            return Ok(orders);
        }
        let ids: Vec<Uuid> = orders.iter().map(|o| o.id).collect();
        let client = self.pool.get().await?;

        let item_rows = client.query(
            r#"
            SELECT order_id, product_id, product_name, unit_price, quantity, subtotal
            FROM order_items WHERE order_id = ANY($1) ORDER BY order_id, position
            "#,
            &[&ids],
        ).await?;
        let history_rows = client.query(
            r#"
            SELECT order_id, status, updated_by, notes, created_at
            FROM order_status_history WHERE order_id = ANY($1) ORDER BY order_id, id
            "#,
            &[&ids],
        ).await?;

        for row in item_rows {
            let order_id: Uuid = row.get("order_id");
            if let Some(order) = orders.iter_mut().find(|o| o.id == order_id) {
                order.items.push(OrderItem {
                    product_id: row.get("product_id"),
                    product_name: row.get("product_name"),
                    unit_price: row.get("unit_price"),
                    quantity: row.get("quantity"),
                    subtotal: row.get("subtotal"),
                });
            }
        }
        for row in history_rows {
            let order_id: Uuid = row.get("order_id");
            if let Some(order) = orders.iter_mut().find(|o| o.id == order_id) {
                let status: String = row.get("status");
                order.status_history.push(StatusHistoryEntry {
                    status: decode("order_status_history.status", &status)?,
                    timestamp: row.get("created_at"),
                    updated_by: row.get("updated_by"),
                    notes: row.get("notes"),
                });
            }
        }
        Ok(orders)
    }
}

/// Maps an `orders` row to an order without items or history.
fn order_header_from_row(row: &Row) -> Result<Order, RepositoryError> {
    let status: String = row.get("status");
    let payment_method: String = row.get("payment_method");
    let payment_status: String = row.get("payment_status");
    let refund_status: String = row.get("refund_status");
    let Json(shipping_address): Json<ShippingAddress> = row.get("shipping_address");
    let tracking_number: Option<String> = row.get("tracking_number");

    Ok(Order {
        id: row.get("id"),
        order_number: row.get("order_number"),
        user_id: row.get("user_id"),
        customer_email: row.get("customer_email"),
        items: Vec::new(),
        subtotal: row.get("subtotal"),
        discount: row.get("discount"),
        delivery_charge: row.get("delivery_charge"),
        tax: row.get("tax"),
        total: row.get("total"),
        coupon_code: row.get("coupon_code"),
        status: decode("orders.status", &status)?,
        status_history: Vec::new(),
        payment_method: decode("orders.payment_method", &payment_method)?,
        payment_status: decode("orders.payment_status", &payment_status)?,
        refund_status: decode("orders.refund_status", &refund_status)?,
        payment_id: row.get("payment_id"),
        gateway_order_id: row.get("gateway_order_id"),
        shipping_address,
        tracking: tracking_number.map(|tracking_number| TrackingInfo {
            tracking_number,
            carrier: row.get("tracking_carrier"),
            tracking_url: row.get("tracking_url"),
        }),
        notes: row.get("notes"),
        cancelled_at: row.get("cancelled_at"),
        cancellation_reason: row.get("cancellation_reason"),
        version: row.get("version"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

type SqlParam = Box<dyn ToSql + Sync + Send>;

/// Renders `filter` as a `WHERE` clause with positional parameters.
fn where_clause(filter: &OrderListFilter) -> (String, Vec<SqlParam>) {
    let mut clauses: Vec<String> = Vec::new();
    let mut params: Vec<SqlParam> = Vec::new();

    if let Some(status) = filter.status {
        params.push(Box::new(status.to_string()));
        clauses.push(format!("status = ${}", params.len()));
    }
    if let Some(payment_status) = filter.payment_status {
        params.push(Box::new(payment_status.to_string()));
        clauses.push(format!("payment_status = ${}", params.len()));
    }
    if let Some(from) = filter.from {
        params.push(Box::new(from));
        clauses.push(format!("created_at >= ${}", params.len()));
    }
    if let Some(to) = filter.to {
        params.push(Box::new(to));
        clauses.push(format!("created_at <= ${}", params.len()));
    }
    if let Some(search) = filter.search.as_deref().filter(|s| !s.is_empty()) {
        let escaped = search.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_");
        params.push(Box::new(format!("%{escaped}%")));
        let n = params.len();
        clauses.push(format!(
            "(order_number ILIKE ${n} OR customer_email ILIKE ${n} \
             OR shipping_address->>'name' ILIKE ${n} OR shipping_address->>'phone' ILIKE ${n})"
        ));
    }

    let sql = if clauses.is_empty() {
        String::new()
    } else {
        format!("WHERE {}", clauses.join(" AND "))
    };
    (sql, params)
}

/// Turns a unique-key violation into [`RepositoryError::Duplicate`] naming the constraint.
fn unique_violation(err: RepositoryError) -> RepositoryError {
    match err {
        RepositoryError::Db(e) if e.code() == Some(&SqlState::UNIQUE_VIOLATION) => {
            let constraint = e.as_db_error().and_then(|db| db.constraint()).unwrap_or("key");
            RepositoryError::Duplicate(constraint.to_string())
        }
        other => other,
    }
}

fn param_refs(params: &[SqlParam]) -> Vec<&(dyn ToSql + Sync)> {
    params.iter().map(|p| p.as_ref() as &(dyn ToSql + Sync)).collect()
}

#[async_trait]
impl OrdersRepository for PgOrdersRepository {
    async fn next_order_sequence(&self) -> Result<i64, RepositoryError> {
        let client = self.pool.get().await?;
        let row = client.query_one("SELECT nextval('order_number_seq') AS seq", &[]).await?;
        Ok(row.get("seq"))
    }

    async fn insert(&self, order: &Order) -> Result<(), RepositoryError> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        Self::insert_tx(&tx, order).await.map_err(unique_violation)?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_by_id(&self, id: Uuid) -> Result<Order, RepositoryError> {
        let row = {
            let client = self.pool.get().await?;
            client.query_opt("SELECT * FROM orders WHERE id = $1", &[&id]).await?
        };
        let header = match row {
            Some(row) => order_header_from_row(&row)?,
            None => return Err(RepositoryError::NotFound),
        };
        self.hydrate(vec![header])
            .await?
            .pop()
            .ok_or(RepositoryError::NotFound)
    }

    async fn update_versioned(
        &self,
        order: &Order,
        expected_version: i32,
        history: Option<&StatusHistoryEntry>,
    ) -> Result<(), RepositoryError> {
        let query = r#"
            UPDATE orders SET
                status = $3, payment_status = $4, refund_status = $5, tracking_number = $6,
                tracking_carrier = $7, tracking_url = $8, notes = $9, cancelled_at = $10,
                cancellation_reason = $11, updated_at = $12, version = version + 1
            WHERE id = $1 AND version = $2
        "#;
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let tracking = order.tracking.as_ref();
        let updated = tx.execute(query, &[
            &order.id,
            &expected_version,
            &text(&order.status),
            &text(&order.payment_status),
            &text(&order.refund_status),
            &tracking.map(|t| t.tracking_number.as_str()),
            &tracking.and_then(|t| t.carrier.as_deref()),
            &tracking.and_then(|t| t.tracking_url.as_deref()),
            &order.notes,
            &order.cancelled_at,
            &order.cancellation_reason,
            &order.updated_at,
        ]).await?;

        if updated == 0 {
            let current = tx
                .query_opt("SELECT version FROM orders WHERE id = $1", &[&order.id])
                .await?;
            // dropping the transaction rolls it back
            return Err(match current {
                Some(row) => RepositoryError::VersionMismatch {
                    expected: expected_version,
                    actual: row.get("version"),
                },
                None => RepositoryError::NotFound,
            });
        }

        if let Some(entry) = history {
            Self::insert_history_tx(&tx, order.id, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn list(&self, filter: &OrderListFilter, page: Pagination) -> Result<(Vec<Order>, u64), RepositoryError> {
        let (clause, mut params) = where_clause(filter);
        let total = self.count(filter).await?;

        params.push(Box::new(i64::from(page.limit)));
        let limit_idx = params.len();
        params.push(Box::new(page.offset() as i64));
        let offset_idx = params.len();

        let query = format!(
            "SELECT * FROM orders {clause} ORDER BY created_at DESC LIMIT ${limit_idx} OFFSET ${offset_idx}"
        );
        let rows = {
            let client = self.pool.get().await?;
            client.query(query.as_str(), &param_refs(&params)).await?
        };
        let headers = rows
            .iter()
            .map(order_header_from_row)
            .collect::<Result<Vec<_>, _>>()?;
        Ok((self.hydrate(headers).await?, total))
    }

    async fn count(&self, filter: &OrderListFilter) -> Result<u64, RepositoryError> {
        let (clause, params) = where_clause(filter);
        let query = format!("SELECT COUNT(*) AS n FROM orders {clause}");
        let client = self.pool.get().await?;
        let row = client.query_one(query.as_str(), &param_refs(&params)).await?;
        let n: i64 = row.get("n");
        Ok(n.max(0) as u64)
    }

    async fn figures(&self, filter: &OrderListFilter) -> Result<Vec<OrderFigures>, RepositoryError> {
        let (clause, params) = where_clause(filter);
        let query = format!("SELECT status, total, discount, delivery_charge FROM orders {clause}");
        let client = self.pool.get().await?;
        let rows = client.query(query.as_str(), &param_refs(&params)).await?;
        rows.iter()
            .map(|row| {
                let status: String = row.get("status");
                Ok(OrderFigures {
                    status: decode("orders.status", &status)?,
                    total: row.get::<_, Decimal>("total"),
                    discount: row.get("discount"),
                    delivery_charge: row.get("delivery_charge"),
                })
            })
            .collect()
    }
}
