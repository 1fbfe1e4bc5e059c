//! Report aggregation and the async report job ticket.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString, IntoEnumIterator};
use thiserror::Error;
use uuid::Uuid;

use crate::money::round_money;
use crate::order::{Order, OrderStatus, PaymentStatus};

/// Filters accepted by reports; also snapshotted into [`ReportJob`].
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReportFilters {
    #[serde(default)]
    pub from: Option<DateTime<Utc>>,
    #[serde(default)]
    pub to: Option<DateTime<Utc>>,
    #[serde(default)]
    pub status: Option<OrderStatus>,
    #[serde(default)]
    pub payment_status: Option<PaymentStatus>,
}

impl ReportFilters {
    pub fn matches(&self, order: &Order) -> bool {
        self.from.is_none_or(|from| order.created_at >= from)
            && self.to.is_none_or(|to| order.created_at <= to)
            && self.status.is_none_or(|s| order.status == s)
            && self.payment_status.is_none_or(|p| order.payment_status == p)
    }
}

/// The slice of an order that reports need.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderFigures {
    pub status: OrderStatus,
    pub total: Decimal,
    pub discount: Decimal,
    pub delivery_charge: Decimal,
}

impl From<&Order> for OrderFigures {
    fn from(o: &Order) -> Self {
        Self {
            status: o.status,
            total: o.total,
            discount: o.discount,
            delivery_charge: o.delivery_charge,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusBreakdown {
    pub status: OrderStatus,
    pub count: i64,
    pub total_revenue: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportMetrics {
    pub total_orders: i64,
    pub total_revenue: Decimal,
    pub average_order_value: Decimal,
    pub total_discount: Decimal,
    pub total_delivery_charges: Decimal,
    pub status_breakdown: Vec<StatusBreakdown>,
    pub generated_at: DateTime<Utc>,
}

impl ReportMetrics {
    /// Folds order figures into metrics. Statuses with no orders are omitted
    /// from the breakdown.
    pub fn aggregate<'a, I>(orders: I, generated_at: DateTime<Utc>) -> Self
    where
        I: IntoIterator<Item = &'a OrderFigures>,
    {
        let mut breakdown: Vec<StatusBreakdown> = OrderStatus::iter()
            .map(|status| StatusBreakdown {
                status,
                count: 0,
                total_revenue: Decimal::ZERO,
            })
            .collect();
        let mut total_orders = 0i64;
        let mut total_revenue = Decimal::ZERO;
        let mut total_discount = Decimal::ZERO;
        let mut total_delivery_charges = Decimal::ZERO;

        for o in orders {
            total_orders += 1;
            total_revenue += o.total;
            total_discount += o.discount;
            total_delivery_charges += o.delivery_charge;
            if let Some(row) = breakdown.iter_mut().find(|b| b.status == o.status) {
                row.count += 1;
                row.total_revenue += o.total;
            }
        }
        breakdown.retain(|b| b.count > 0);

        let average_order_value = if total_orders == 0 {
            Decimal::ZERO
        } else {
            round_money(total_revenue / Decimal::from(total_orders))
        };

        Self {
            total_orders,
            total_revenue,
            average_order_value,
            total_discount,
            total_delivery_charges,
            status_breakdown: breakdown,
            generated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReportJobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Error, PartialEq)]
#[error("report job cannot move from {from} to {to}")]
pub struct JobTransitionError {
    pub from: ReportJobStatus,
    pub to: ReportJobStatus,
}

/// Async report work ticket.
///
/// `pending → processing → completed | failed`, each step taken exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReportJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub status: ReportJobStatus,
    pub filters: ReportFilters,
    pub result: Option<ReportMetrics>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ReportJob {
    pub fn new(user_id: Uuid, filters: ReportFilters, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            status: ReportJobStatus::Pending,
            filters,
            result: None,
            error_message: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        self.advance(ReportJobStatus::Pending, ReportJobStatus::Processing, now)
    }

    pub fn complete(&mut self, metrics: ReportMetrics, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        self.advance(ReportJobStatus::Processing, ReportJobStatus::Completed, now)?;
        self.result = Some(metrics);
        self.completed_at = Some(now);
        Ok(())
    }

    pub fn fail(&mut self, message: impl Into<String>, now: DateTime<Utc>) -> Result<(), JobTransitionError> {
        self.advance(ReportJobStatus::Processing, ReportJobStatus::Failed, now)?;
        self.error_message = Some(message.into());
        self.completed_at = Some(now);
        Ok(())
    }

    fn advance(
        &mut self,
        expected: ReportJobStatus,
        to: ReportJobStatus,
        now: DateTime<Utc>,
    ) -> Result<(), JobTransitionError> {
        if self.status != expected {
            return Err(JobTransitionError { from: self.status, to });
        }
        self.status = to;
        self.updated_at = now;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn fig(status: OrderStatus, total: Decimal) -> OrderFigures {
        OrderFigures {
            status,
            total,
            discount: Decimal::ZERO,
            delivery_charge: dec!(100),
        }
    }

    #[test]
    fn test_empty_report() {
        let m = ReportMetrics::aggregate(&[], Utc::now());
        assert_eq!(m.total_orders, 0);
        assert_eq!(m.average_order_value, Decimal::ZERO);
        assert!(m.status_breakdown.is_empty());
    }

    #[test]
    fn test_breakdown_by_status() {
        let orders = vec![
            fig(OrderStatus::Pending, dec!(100)),
            fig(OrderStatus::Pending, dec!(300)),
            fig(OrderStatus::Delivered, dec!(500)),
        ];
        let m = ReportMetrics::aggregate(&orders, Utc::now());
        assert_eq!(m.total_orders, 3);
        assert_eq!(m.total_revenue, dec!(900));
        assert_eq!(m.average_order_value, dec!(300));
        assert_eq!(m.total_delivery_charges, dec!(300));
        let pending = m.status_breakdown.iter().find(|b| b.status == OrderStatus::Pending).unwrap();
        assert_eq!(pending.count, 2);
        assert_eq!(pending.total_revenue, dec!(400));
    }

    #[test]
    fn test_job_transitions_once() {
        let now = Utc::now();
        let mut job = ReportJob::new(Uuid::new_v4(), ReportFilters::default(), now);
        assert!(job.complete(ReportMetrics::aggregate(&[], now), now).is_err());
        job.start(now).unwrap();
        job.fail("boom", now).unwrap();
        assert_eq!(job.status, ReportJobStatus::Failed);
        assert!(job.start(now).is_err());
        assert!(job.complete(ReportMetrics::aggregate(&[], now), now).is_err());
    }

    proptest! {
        #[test]
        fn prop_breakdown_sums_to_totals(raw in proptest::collection::vec((0usize..6, 0i64..10_000_000), 0..50)) {
            let statuses: Vec<OrderStatus> = OrderStatus::iter().collect();
            let orders: Vec<OrderFigures> = raw
                .into_iter()
                .map(|(s, t)| fig(statuses[s], Decimal::new(t, 2)))
                .collect();
            let m = ReportMetrics::aggregate(&orders, Utc::now());
            let count: i64 = m.status_breakdown.iter().map(|b| b.count).sum();
            let revenue: Decimal = m.status_breakdown.iter().map(|b| b.total_revenue).sum();
            prop_assert_eq!(count, m.total_orders);
            prop_assert_eq!(revenue, m.total_revenue);
        }
    }
}
