//! Prometheus request metrics and the middleware that records them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{MatchedPath, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};

/// Metrics collects and exposes HTTP server metrics.
pub struct Metrics {
    registry: Registry,
    http_requests_total: CounterVec,
    http_request_duration_seconds: HistogramVec,
    errors_total: CounterVec,
    rate_limited_total: CounterVec,
}

impl Metrics {
    /// # Errors
    /// Fails if a collector cannot be created or registered.
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new("http_requests_total", "Total number of HTTP requests"),
            &["method", "endpoint", "status"],
        )?;
        let http_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new("http_request_duration_seconds", "HTTP request duration in seconds"),
            &["method", "endpoint"],
        )?;
        let errors_total = CounterVec::new(
            Opts::new("errors_total", "Total number of error responses"),
            &["kind", "endpoint"],
        )?;
        let rate_limited_total = CounterVec::new(
            Opts::new("rate_limited_total", "Requests rejected by the rate limiter"),
            &["operation"],
        )?;

        registry.register(Box::new(http_requests_total.clone()))?;
        registry.register(Box::new(http_request_duration_seconds.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;

        Ok(Self {
            registry,
            http_requests_total,
            http_request_duration_seconds,
            errors_total,
            rate_limited_total,
        })
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn record_request(&self, method: &str, endpoint: &str, status: u16, duration: Duration) {
        self.http_requests_total
            .with_label_values(&[method, endpoint, &status.to_string()])
            .inc();
        self.http_request_duration_seconds
            .with_label_values(&[method, endpoint])
            .observe(duration.as_secs_f64());
    }

    fn record_error(&self, kind: &str, endpoint: &str) {
        self.errors_total.with_label_values(&[kind, endpoint]).inc();
    }

    pub fn record_rate_limited(&self, operation: &str) {
        self.rate_limited_total.with_label_values(&[operation]).inc();
    }
}

/// Records count, latency and error class of every routed request.
pub async fn track(State(metrics): State<Arc<Metrics>>, req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    // Route templates keep label cardinality bounded.
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16();
    metrics.record_request(&method, &endpoint, status, start.elapsed());

    if status >= 500 {
        metrics.record_error("server", &endpoint);
    } else if status >= 400 {
        metrics.record_error("client", &endpoint);
    }
    response
}
