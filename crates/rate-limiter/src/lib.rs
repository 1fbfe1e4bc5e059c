//! # Rate limiting
//!
//! Fixed-window counters keyed by `identifier:operation`, held in process
//! memory. Counters are not shared between instances and do not survive a
//! restart: a redeploy resets every window. A multi-instance deployment needs
//! a shared store (e.g. Redis) in front of this for the limits to hold.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use model::Clock;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Quota for one named operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitRule {
    pub operation: &'static str,
    pub max_requests: u32,
    pub window_secs: i64,
}

impl RateLimitRule {
    pub const COUPON_VALIDATION: Self = Self::per_minute("coupon_validation", 5);
    pub const DELIVERY_QUOTE: Self = Self::per_minute("delivery_quote", 30);
    pub const PAYMENT_CREATION: Self = Self::per_minute("payment_creation", 10);
    pub const ORDER_CREATION: Self = Self::per_minute("order_creation", 10);
    pub const ORDER_CANCELLATION: Self = Self::per_minute("order_cancellation", 5);
    pub const ADMIN_STATUS_UPDATE: Self = Self::per_minute("admin_status_update", 30);
    pub const REPORT_GENERATION: Self = Self::per_minute("report_generation", 10);

    pub const fn per_minute(operation: &'static str, max_requests: u32) -> Self {
        Self {
            operation,
            max_requests,
            window_secs: 60,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::seconds(self.window_secs)
    }
}

#[derive(Debug, Clone, Copy)]
struct RateLimitEntry {
    count: u32,
    reset_at: DateTime<Utc>,
}

/// Result of a [`RateLimiter::check`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitOutcome {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub reset_at: DateTime<Utc>,
    /// Whole seconds until the window resets; set only when rejected.
    pub retry_after_secs: Option<i64>,
}

/// In-memory request throttle.
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<String, RateLimitEntry>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
        }
    }

    /// Counts one request for `identifier` against `rule`.
    pub fn check(&self, identifier: &str, rule: &RateLimitRule) -> RateLimitOutcome {
        let now = self.clock.now();
        let key = format!("{identifier}:{}", rule.operation);

        match self.entries.entry(key) {
            Entry::Occupied(mut occupied) if now < occupied.get().reset_at => {
                let entry = occupied.get_mut();
                if entry.count >= rule.max_requests {
                    let wait = entry.reset_at - now;
                    // round up so clients never retry a moment too early
                    let secs = (wait.num_milliseconds() + 999) / 1000;
                    warn!(identifier, operation = rule.operation, "Rate limit exceeded");
                    return RateLimitOutcome {
                        allowed: false,
                        limit: rule.max_requests,
                        remaining: 0,
                        reset_at: entry.reset_at,
                        retry_after_secs: Some(secs.max(1)),
                    };
                }
                entry.count += 1;
                RateLimitOutcome {
                    allowed: true,
                    limit: rule.max_requests,
                    remaining: rule.max_requests - entry.count,
                    reset_at: entry.reset_at,
                    retry_after_secs: None,
                }
            }
            entry => {
                let fresh = RateLimitEntry {
                    count: 1,
                    reset_at: now + rule.window(),
                };
                entry.insert(fresh);
                RateLimitOutcome {
                    allowed: true,
                    limit: rule.max_requests,
                    remaining: rule.max_requests.saturating_sub(1),
                    reset_at: fresh.reset_at,
                    retry_after_secs: None,
                }
            }
        }
    }

    /// Drops every entry whose window has ended. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.reset_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!(removed, "Swept expired rate limit entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Runs [`sweep`](Self::sweep) every `interval` until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, interval: std::time::Duration, shutdown: Arc<Notify>) -> JoinHandle<()> {
        let stop = shutdown.notified_owned();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            tokio::pin!(stop);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                    _ = &mut stop => {
                        info!("Rate limit sweeper stopped");
                        break;
                    }
                }
            }
        })
    }
}

/// Picks the key a request is throttled under: the authenticated user if
/// known, else the first `X-Forwarded-For` hop, else `X-Real-IP`.
pub fn client_identifier(user_id: Option<&str>, forwarded_for: Option<&str>, real_ip: Option<&str>) -> String {
    if let Some(user) = user_id.map(str::trim).filter(|u| !u.is_empty()) {
        return format!("user:{user}");
    }
    let ip = forwarded_for
        .and_then(|chain| chain.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .or_else(|| real_ip.map(str::trim).filter(|ip| !ip.is_empty()))
        .unwrap_or("unknown");
    format!("ip:{ip}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use model::ManualClock;

    fn limiter() -> (Arc<ManualClock>, RateLimiter) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap()));
        (clock.clone(), RateLimiter::new(clock))
    }

    #[test]
    fn test_sixth_call_rejected_then_window_resets() {
        let (clock, rl) = limiter();
        let rule = RateLimitRule::COUPON_VALIDATION;
        for i in 0..5 {
            let out = rl.check("user:1", &rule);
            assert!(out.allowed, "call {i}");
            assert_eq!(out.remaining, 4 - i);
        }
        let denied = rl.check("user:1", &rule);
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after_secs, Some(60));

        clock.advance(Duration::seconds(60));
        let fresh = rl.check("user:1", &rule);
        assert!(fresh.allowed);
        assert_eq!(fresh.remaining, 4);
    }

    #[test]
    fn test_keys_are_per_identifier_and_operation() {
        let (_, rl) = limiter();
        for _ in 0..5 {
            rl.check("user:1", &RateLimitRule::COUPON_VALIDATION);
        }
        assert!(!rl.check("user:1", &RateLimitRule::COUPON_VALIDATION).allowed);
        assert!(rl.check("user:2", &RateLimitRule::COUPON_VALIDATION).allowed);
        assert!(rl.check("user:1", &RateLimitRule::ORDER_CREATION).allowed);
    }

    #[test]
    fn test_retry_after_counts_down() {
        let (clock, rl) = limiter();
        let rule = RateLimitRule::per_minute("x", 1);
        rl.check("a", &rule);
        clock.advance(Duration::milliseconds(45_500));
        assert_eq!(rl.check("a", &rule).retry_after_secs, Some(15));
    }

    #[test]
    fn test_sweep_removes_expired() {
        let (clock, rl) = limiter();
        rl.check("a", &RateLimitRule::COUPON_VALIDATION);
        rl.check("b", &RateLimitRule::REPORT_GENERATION);
        assert_eq!(rl.sweep(), 0);
        clock.advance(Duration::seconds(61));
        assert_eq!(rl.sweep(), 2);
        assert!(rl.is_empty());
    }

    #[test]
    fn test_client_identifier() {
        assert_eq!(client_identifier(Some("u1"), Some("1.1.1.1"), None), "user:u1");
        assert_eq!(client_identifier(None, Some(" 1.1.1.1 , 10.0.0.1"), Some("2.2.2.2")), "ip:1.1.1.1");
        assert_eq!(client_identifier(None, None, Some("2.2.2.2")), "ip:2.2.2.2");
        assert_eq!(client_identifier(Some(""), None, None), "ip:unknown");
    }

    #[tokio::test]
    async fn test_sweeper_stops_on_shutdown() {
        let (_, rl) = limiter();
        let shutdown = Arc::new(Notify::new());
        let handle = Arc::new(rl).spawn_sweeper(std::time::Duration::from_millis(5), shutdown.clone());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown.notify_one();
        handle.await.unwrap();
    }
}
