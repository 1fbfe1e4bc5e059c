//! Storefront backend binary.
//!
//! Wires configuration, persistence, the service layer and the HTTP server
//! together, runs the background maintenance tasks and shuts everything down
//! on Ctrl+C or SIGTERM.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use app_config::AppConfig;
use deadpool_postgres::Pool;
use model::{Clock, SystemClock};
use rate_limiter::RateLimiter;
use repository::{
    CouponsRepository, DeliverySettingsRepository, InMemoryStore, NotificationLogRepository, OrdersRepository,
    PgCouponsRepository, PgDeliverySettingsRepository, PgNotificationLogRepository, PgOrdersRepository,
    PgProfilesRepository, PgReportJobsRepository, ProfilesRepository, ReportJobsRepository,
};
use server::{AppState, Metrics, Server};
use service::checkout::CheckoutService;
use service::coupon::CouponService;
use service::delivery::{DeliveryPricing, HttpGeocoder, ZonePolicy};
use service::notification::{HttpMailSender, LogMailSender, MailSender, NotificationService, TokioScheduler};
use service::order::OrderServiceImpl;
use service::payment::PaymentGatewayFactory;
use service::report::ReportService;
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const CACHE_PURGE_INTERVAL: StdDuration = StdDuration::from_secs(60);

/// Initialize the tracing subscriber for logging. `RUST_LOG` overrides the
/// default `info` level.
fn init_logger() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// One handle per persisted aggregate.
struct Stores {
    orders: Arc<dyn OrdersRepository>,
    coupons: Arc<dyn CouponsRepository>,
    delivery: Arc<dyn DeliverySettingsRepository>,
    reports: Arc<dyn ReportJobsRepository>,
    profiles: Arc<dyn ProfilesRepository>,
    notifications: Arc<dyn NotificationLogRepository>,
}

impl Stores {
    fn postgres(pool: &Pool) -> Self {
        Self {
            orders: Arc::new(PgOrdersRepository::new(pool.clone())),
            coupons: Arc::new(PgCouponsRepository::new(pool.clone())),
            delivery: Arc::new(PgDeliverySettingsRepository::new(pool.clone())),
            reports: Arc::new(PgReportJobsRepository::new(pool.clone())),
            profiles: Arc::new(PgProfilesRepository::new(pool.clone())),
            notifications: Arc::new(PgNotificationLogRepository::new(pool.clone())),
        }
    }

    fn in_memory(store: Arc<InMemoryStore>) -> Self {
        Self {
            orders: store.clone(),
            coupons: store.clone(),
            delivery: store.clone(),
            reports: store.clone(),
            profiles: store.clone(),
            notifications: store,
        }
    }
}

fn chrono_duration(d: StdDuration, name: &str) -> Result<chrono::Duration> {
    chrono::Duration::from_std(d).with_context(|| format!("{name} is out of range"))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logger();
    info!("Storefront backend starting...");

    let config = AppConfig::load().context("Failed to load configuration")?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let stores = if config.use_in_memory_store {
        warn!("Using the in-memory store; data is lost on restart");
        Stores::in_memory(Arc::new(InMemoryStore::seeded(clock.now())))
    } else {
        let pool = db::init_db_pool(&config).await.context("Failed to initialize database")?;
        db::check_connection(&pool).await?;
        Stores::postgres(&pool)
    };

    let mailer: Arc<dyn MailSender> = if config.mail_api_url.trim().is_empty() {
        warn!("MAIL_API_URL not set; notifications are logged, not sent");
        Arc::new(LogMailSender)
    } else {
        Arc::new(HttpMailSender::new(
            config.mail_api_url.clone(),
            config.mail_api_key.clone(),
            config.mail_from.clone(),
            config.mail_timeout,
        )
        .context("Failed to build mail client")?)
    };
    let notifications = NotificationService::new(
        mailer,
        stores.notifications.clone(),
        Arc::new(TokioScheduler),
        clock.clone(),
        chrono_duration(config.notification_batch_window, "notification_batch_window")?,
        config.admin_email.clone(),
    );

    let payments = Arc::new(PaymentGatewayFactory::from_config(&config));
    payments
        .verifier()
        .with_context(|| format!("Payment gateway '{}' is not configured", config.payment_gateway))?;
    let orders = Arc::new(OrderServiceImpl::new(stores.orders.clone(), payments.clone(), clock.clone()));
    let coupons = Arc::new(CouponService::new(
        stores.coupons.clone(),
        chrono_duration(config.coupon_cache_ttl, "coupon_cache_ttl")?,
        clock.clone(),
    ));
    let geocoder = HttpGeocoder::new(config.geocoder_base_url.clone(), config.geocode_timeout)
        .context("Failed to build geocoder client")?;
    let delivery = Arc::new(DeliveryPricing::new(
        stores.delivery.clone(),
        Arc::new(geocoder),
        ZonePolicy {
            local_radius_km: config.local_radius_km,
            city_radius_km: config.city_radius_km,
            state_radius_km: config.state_radius_km,
        },
        chrono_duration(config.geocode_cache_ttl, "geocode_cache_ttl")?,
        chrono_duration(config.settings_cache_ttl, "settings_cache_ttl")?,
        clock.clone(),
    ));
    let checkout = Arc::new(CheckoutService::new(
        coupons.clone(),
        delivery.clone(),
        payments,
        orders.clone(),
        notifications.clone(),
        config.tax_rate,
        config.currency.clone(),
    ));
    let reports = ReportService::new(
        stores.orders.clone(),
        stores.reports.clone(),
        clock.clone(),
        u64::try_from(config.report_async_threshold).context("report_async_threshold must not be negative")?,
    );
    let rate_limiter = Arc::new(RateLimiter::new(clock));
    let metrics = Arc::new(Metrics::new().context("Failed to register metrics")?);

    let state = AppState {
        orders,
        checkout,
        delivery: delivery.clone(),
        notifications: notifications.clone(),
        reports,
        profiles: stores.profiles.clone(),
        rate_limiter: rate_limiter.clone(),
        metrics,
    };

    let shutdown = Arc::new(Notify::new());
    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        server::shutdown_signal().await;
        signal_shutdown.notify_waiters();
    });

    let mut tasks = JoinSet::new();

    let sweeper = rate_limiter.spawn_sweeper(config.rate_limit_sweep_interval, shutdown.clone());

    let purge_stop = shutdown.clone().notified_owned();
    tasks.spawn(async move {
        let mut ticker = tokio::time::interval(CACHE_PURGE_INTERVAL);
        tokio::pin!(purge_stop);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let purged = coupons.purge_cache().await + delivery.purge_caches().await;
                    if purged > 0 {
                        info!(purged, "Expired cache entries purged");
                    }
                }
                _ = &mut purge_stop => break,
            }
        }
        Ok::<(), anyhow::Error>(())
    });

    let http_server = Server::new(config.http_port, state);
    let server_shutdown = shutdown.clone();
    tasks.spawn(async move {
        let result = http_server.start(server_shutdown.clone()).await;
        // Stop the background tasks too if the listener died on its own.
        server_shutdown.notify_waiters();
        result
    });

    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(err)) => error!(error = %err, "HTTP server error"),
            Err(err) => error!(error = %err, "Task error"),
        }
    }
    if let Err(err) = sweeper.await {
        error!(error = %err, "Rate limit sweeper panicked");
    }

    match tokio::time::timeout(config.shutdown_timeout, notifications.flush_all()).await {
        Ok(flushed) => info!(flushed, "Pending notification batches flushed"),
        Err(_) => warn!("Timed out flushing notification batches"),
    }

    info!("Application stopped");
    Ok(())
}
