//! # Notifications
//!
//! Customer-facing messages go out immediately and their failures are only
//! logged. Admin "new order" alerts are batched per key: the first alert in a
//! window arms a flush timer, later alerts join the same batch, and the flush
//! sends one digest. Each batch carries a generation number so a timer armed
//! for an already-flushed batch never flushes its successor.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use model::{Clock, NotificationLogEntry, NotificationOutcome, Order, OrderStatus};
use repository::NotificationLogRepository;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Mail request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Mail API rejected message with {status}: {body}")]
    Rejected { status: u16, body: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MailMessage {
    pub to: String,
    pub subject: String,
    pub text: String,
}

/// Where outgoing mail ends up.
#[async_trait]
pub trait MailSender: Send + Sync {
    async fn send(&self, message: &MailMessage) -> Result<(), NotificationError>;
}

/// Posts messages as JSON to a transactional-mail HTTP API.
pub struct HttpMailSender {
    client: reqwest::Client,
    url: String,
    api_key: String,
    from: String,
}

impl HttpMailSender {
    /// `timeout` bounds each request, so a stalled mail API cannot hold a
    /// notification task open.
    pub fn new(
        url: impl Into<String>,
        api_key: impl Into<String>,
        from: impl Into<String>,
        timeout: StdDuration,
    ) -> Result<Self, NotificationError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
            api_key: api_key.into(),
            from: from.into(),
        })
    }
}

#[async_trait]
impl MailSender for HttpMailSender {
    async fn send(&self, message: &MailMessage) -> Result<(), NotificationError> {
        let response = self
            .client
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(&json!({
                "from": self.from,
                "to": [message.to],
                "subject": message.subject,
                "text": message.text,
            }))
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(NotificationError::Rejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }
}

/// Writes messages to the log instead of sending them.
#[derive(Debug, Default)]
pub struct LogMailSender;

#[async_trait]
impl MailSender for LogMailSender {
    async fn send(&self, message: &MailMessage) -> Result<(), NotificationError> {
        info!(to = %message.to, subject = %message.subject, "Mail (not sent, no mail API configured)");
        Ok(())
    }
}

/// Runs a task after a delay.
pub trait Scheduler: Send + Sync {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>);
}

/// Schedules on the tokio runtime.
#[derive(Debug, Default)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        let delay = delay.to_std().unwrap_or_default();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });
    }
}

/// Holds tasks until [`ManualScheduler::run_due`] is called; due-ness is
/// judged against the injected clock.
pub struct ManualScheduler {
    clock: Arc<dyn Clock>,
    tasks: StdMutex<Vec<(DateTime<Utc>, BoxFuture<'static, ()>)>>,
}

impl ManualScheduler {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            tasks: StdMutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Runs every task whose time has come, in due order. Returns how many ran.
    pub async fn run_due(&self) -> usize {
        let now = self.clock.now();
        let mut due = {
            let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
            let (ready, waiting): (Vec<_>, Vec<_>) = tasks.drain(..).partition(|(at, _)| *at <= now);
            *tasks = waiting;
            ready
        };
        due.sort_by_key(|(at, _)| *at);
        let ran = due.len();
        for (_, task) in due {
            task.await;
        }
        ran
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: BoxFuture<'static, ()>) {
        let at = self.clock.now() + delay;
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner).push((at, task));
    }
}

/// Customer-facing events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CustomerEvent {
    Confirmation,
    Shipping,
    Delivered,
    Cancelled,
    StatusUpdate,
}

impl CustomerEvent {
    /// The event announcing that an order reached `status`.
    pub fn for_status(status: OrderStatus) -> Self {
        match status {
            OrderStatus::Shipped => CustomerEvent::Shipping,
            OrderStatus::Delivered => CustomerEvent::Delivered,
            OrderStatus::Cancelled => CustomerEvent::Cancelled,
            _ => CustomerEvent::StatusUpdate,
        }
    }

    fn kind(self) -> &'static str {
        match self {
            CustomerEvent::Confirmation => "order_confirmation",
            CustomerEvent::Shipping => "order_shipped",
            CustomerEvent::Delivered => "order_delivered",
            CustomerEvent::Cancelled => "order_cancelled",
            CustomerEvent::StatusUpdate => "order_status_update",
        }
    }

    fn render(self, order: &Order) -> MailMessage {
        let number = &order.order_number;
        let (subject, text) = match self {
            CustomerEvent::Confirmation => (
                format!("Order {number} confirmed"),
                format!(
                    "Thank you for your order, {}. Your order {number} for {} has been placed.",
                    order.shipping_address.name, order.total
                ),
            ),
            CustomerEvent::Shipping => {
                let tracking = order
                    .tracking
                    .as_ref()
                    .map(|t| {
                        let carrier = t.carrier.as_deref().unwrap_or("our courier partner");
                        format!(" Tracking number {} via {carrier}.", t.tracking_number)
                    })
                    .unwrap_or_default();
                (format!("Order {number} shipped"), format!("Your order {number} is on its way.{tracking}"))
            }
            CustomerEvent::Delivered => (
                format!("Order {number} delivered"),
                format!("Your order {number} has been delivered. We hope you love it."),
            ),
            CustomerEvent::Cancelled => {
                let refund = if order.refund_status == model::RefundStatus::Pending {
                    " A refund has been initiated to your original payment method."
                } else {
                    ""
                };
                (
                    format!("Order {number} cancelled"),
                    format!("Your order {number} has been cancelled.{refund}"),
                )
            }
            CustomerEvent::StatusUpdate => (
                format!("Order {number} update"),
                format!("Your order {number} is now {}.", order.status),
            ),
        };
        MailMessage {
            to: order.customer_email.clone(),
            subject,
            text,
        }
    }
}

/// Batch key for admin new-order alerts.
pub const ADMIN_NEW_ORDER: &str = "admin_new_order";

#[derive(Debug, Clone, PartialEq, Serialize)]
struct AdminAlert {
    order_id: Uuid,
    order_number: String,
    customer_email: String,
    total: Decimal,
}

struct Batch {
    generation: u64,
    flush_at: DateTime<Utc>,
    alerts: Vec<AdminAlert>,
}

/// Snapshot of one pending batch.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchStatus {
    pub key: String,
    pub count: usize,
    pub flush_at: DateTime<Utc>,
}

struct Inner {
    mailer: Arc<dyn MailSender>,
    log: Arc<dyn NotificationLogRepository>,
    scheduler: Arc<dyn Scheduler>,
    clock: Arc<dyn Clock>,
    window: Duration,
    admin_email: String,
    batches: Mutex<HashMap<String, Batch>>,
    generations: AtomicU64,
}

/// Cheap to clone; clones share batches.
#[derive(Clone)]
pub struct NotificationService {
    inner: Arc<Inner>,
}

impl NotificationService {
    pub fn new(
        mailer: Arc<dyn MailSender>,
        log: Arc<dyn NotificationLogRepository>,
        scheduler: Arc<dyn Scheduler>,
        clock: Arc<dyn Clock>,
        window: Duration,
        admin_email: impl Into<String>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                mailer,
                log,
                scheduler,
                clock,
                window,
                admin_email: admin_email.into(),
                batches: Mutex::new(HashMap::new()),
                generations: AtomicU64::new(0),
            }),
        }
    }

    /// Sends a customer-facing message now. Never fails the caller.
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    pub async fn notify_customer(&self, event: CustomerEvent, order: &Order) {
        let message = event.render(order);
        self.inner.deliver(Some(order.id), event.kind(), &message).await;
    }

    /// Announces the order's current status to its customer.
    pub async fn notify_status_change(&self, order: &Order) {
        self.notify_customer(CustomerEvent::for_status(order.status), order).await;
    }

    /// Adds a new-order alert to the admin batch, arming the flush timer if
    /// this is the first alert of the window.
    #[instrument(skip(self, order), fields(order_number = %order.order_number))]
    pub async fn queue_admin_new_order(&self, order: &Order) {
        let alert = AdminAlert {
            order_id: order.id,
            order_number: order.order_number.clone(),
            customer_email: order.customer_email.clone(),
            total: order.total,
        };
        let mut batches = self.inner.batches.lock().await;
        if let Some(batch) = batches.get_mut(ADMIN_NEW_ORDER) {
            batch.alerts.push(alert);
            debug!(count = batch.alerts.len(), "Alert appended to open batch");
            return;
        }

        let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed) + 1;
        batches.insert(
            ADMIN_NEW_ORDER.to_string(),
            Batch {
                generation,
                flush_at: self.inner.clock.now() + self.inner.window,
                alerts: vec![alert],
            },
        );
        let inner = self.inner.clone();
        self.inner.scheduler.schedule(
            self.inner.window,
            Box::pin(async move {
                inner.flush_generation(ADMIN_NEW_ORDER, generation).await;
            }),
        );
    }

    pub async fn batch_status(&self) -> Vec<BatchStatus> {
        let batches = self.inner.batches.lock().await;
        let mut status: Vec<BatchStatus> = batches
            .iter()
            .map(|(key, b)| BatchStatus {
                key: key.clone(),
                count: b.alerts.len(),
                flush_at: b.flush_at,
            })
            .collect();
        status.sort_by(|a, b| a.key.cmp(&b.key));
        status
    }

    /// Sends every pending batch now. Returns how many digests went out.
    pub async fn flush_all(&self) -> usize {
        let drained: Vec<(String, Batch)> = self.inner.batches.lock().await.drain().collect();
        let count = drained.len();
        for (key, batch) in drained {
            self.inner.send_digest(&key, batch.alerts).await;
        }
        count
    }
}

impl Inner {
    async fn flush_generation(&self, key: &str, generation: u64) {
        let batch = {
            let mut batches = self.batches.lock().await;
            match batches.get(key) {
                Some(b) if b.generation == generation => batches.remove(key),
                _ => None,
            }
        };
        match batch {
            Some(b) => self.send_digest(key, b.alerts).await,
            None => debug!(key, generation, "Batch already flushed"),
        }
    }

    async fn send_digest(&self, key: &str, alerts: Vec<AdminAlert>) {
        if alerts.is_empty() {
            return;
        }
        let revenue: Decimal = alerts.iter().map(|a| a.total).sum();
        let lines: Vec<String> = alerts
            .iter()
            .map(|a| format!("{}  {}  {}", a.order_number, a.customer_email, a.total))
            .collect();
        let subject = if alerts.len() == 1 {
            format!("New order {}", alerts[0].order_number)
        } else {
            format!("{} new orders", alerts.len())
        };
        let message = MailMessage {
            to: self.admin_email.clone(),
            subject,
            text: format!("{}\n\nTotal value: {revenue}", lines.join("\n")),
        };
        info!(key, count = alerts.len(), "Flushing notification batch");
        self.deliver(None, key, &message).await;
    }

    async fn deliver(&self, order_id: Option<Uuid>, kind: &str, message: &MailMessage) {
        let result = self.mailer.send(message).await;
        if let Err(e) = &result {
            warn!(kind, to = %message.to, error = %e, "Notification send failed");
        }
        let entry = NotificationLogEntry {
            id: Uuid::new_v4(),
            order_id,
            kind: kind.to_string(),
            recipient: message.to.clone(),
            outcome: if result.is_ok() {
                NotificationOutcome::Sent
            } else {
                NotificationOutcome::Failed
            },
            error: result.err().map(|e| e.to_string()),
            created_at: self.clock.now(),
        };
        if let Err(e) = self.log.insert(&entry).await {
            warn!(kind, error = %e, "Failed to record notification attempt");
        }
    }
}
