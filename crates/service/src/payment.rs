//! # Payment gateway adapter
//!
//! [`PaymentGateway`] is the capability set checkout needs from a gateway:
//! create an order, verify a payment signature, refund and fetch details.
//! [`RazorpayGateway`] talks to the Razorpay REST API; [`SandboxGateway`]
//! is an in-process stand-in with the same signature scheme, used as the
//! fallback gateway and in tests.
//!
//! [`PaymentGatewayFactory`] hands out one shared instance per gateway name.
//! Outbound calls may use the fallback gateway; payment proofs are only ever
//! checked by the primary.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration as StdDuration;

use app_config::AppConfig;
use async_trait::async_trait;
use dashmap::DashMap;
use hmac::{Hmac, Mac};
use model::MoneyError;
use model::money::to_minor_units;
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::Sha256;
use thiserror::Error;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::error::ErrorKind;

type HmacSha256 = Hmac<Sha256>;

pub const RAZORPAY: &str = "razorpay";
pub const SANDBOX: &str = "sandbox";

const GATEWAY_TIMEOUT: StdDuration = StdDuration::from_secs(30);
const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Debug, Error)]
pub enum PaymentError {
    /// Credentials are missing or the gateway name is unknown.
    #[error("Payment gateway configuration error: {0}")]
    Config(String),
    #[error("Invalid payment amount: {0}")]
    Amount(#[from] MoneyError),
    #[error("Payment gateway request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Payment gateway returned {status}: {body}")]
    Gateway { status: u16, body: String },
}

impl PaymentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PaymentError::Config(_) => ErrorKind::Config,
            PaymentError::Amount(_) => ErrorKind::Validation,
            PaymentError::Http(_) | PaymentError::Gateway { .. } => ErrorKind::Upstream,
        }
    }
}

/// An order created on the gateway side. `amount` is in paise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayOrder {
    pub id: String,
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub receipt: Option<String>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub id: String,
    pub payment_id: String,
    pub amount: i64,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentDetails {
    pub id: String,
    #[serde(default)]
    pub order_id: Option<String>,
    pub amount: i64,
    pub currency: String,
    pub status: String,
    #[serde(default)]
    pub method: Option<String>,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &'static str;

    /// Public key the client-side checkout widget needs, if any.
    fn public_key(&self) -> Option<&str> {
        None
    }

    async fn create_order(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<GatewayOrder, PaymentError>;

    /// The gateway's record of an order created by [`create_order`](Self::create_order).
    async fn fetch_order(&self, gateway_order_id: &str) -> Result<GatewayOrder, PaymentError>;

    /// `true` only when `signature` authenticates the payment. Malformed input is `false`.
    fn verify_payment(&self, payment_id: &str, gateway_order_id: &str, signature: &str) -> bool;

    /// Refunds `amount`, or the full captured amount when `None`. Repeating a
    /// call with the same `idempotency_key` must not refund twice.
    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
        idempotency_key: &str,
    ) -> Result<Refund, PaymentError>;

    async fn get_payment_details(&self, payment_id: &str) -> Result<PaymentDetails, PaymentError>;
}

/// Hex HMAC-SHA256 of `"{gateway_order_id}|{payment_id}"`.
pub fn sign_payment(secret: &str, gateway_order_id: &str, payment_id: &str) -> String {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return String::new();
    };
    mac.update(format!("{gateway_order_id}|{payment_id}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature produced by [`sign_payment`].
pub fn verify_signature(secret: &str, gateway_order_id: &str, payment_id: &str, signature: &str) -> bool {
    if secret.is_empty() || gateway_order_id.is_empty() || payment_id.is_empty() {
        return false;
    }
    let Ok(expected) = hex::decode(signature.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(format!("{gateway_order_id}|{payment_id}").as_bytes());
    mac.verify_slice(&expected).is_ok()
}

fn require(value: &str, what: &str) -> Result<String, PaymentError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(PaymentError::Config(format!("{what} is not set")));
    }
    Ok(value.to_string())
}

pub struct RazorpayGateway {
    client: reqwest::Client,
    api_base: String,
    key_id: String,
    key_secret: String,
}

impl RazorpayGateway {
    /// # Errors
    /// Returns [`PaymentError::Config`] if either credential is empty.
    pub fn new(key_id: &str, key_secret: &str, api_base: &str, timeout: StdDuration) -> Result<Self, PaymentError> {
        let key_id = require(key_id, "razorpay_key_id")?;
        let key_secret = require(key_secret, "razorpay_key_secret")?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            key_id,
            key_secret,
        })
    }

    async fn read<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, PaymentError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::Gateway {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json().await?)
    }
}

#[async_trait]
impl PaymentGateway for RazorpayGateway {
    fn name(&self) -> &'static str {
        RAZORPAY
    }

    fn public_key(&self) -> Option<&str> {
        Some(self.key_id.as_str())
    }

    #[instrument(skip(self, metadata))]
    async fn create_order(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<GatewayOrder, PaymentError> {
        let body = json!({
            "amount": to_minor_units(amount)?,
            "currency": currency,
            "receipt": metadata.get("receipt"),
            "notes": metadata,
        });
        let response = self
            .client
            .post(format!("{}/orders", self.api_base))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .json(&body)
            .send()
            .await?;
        let order: GatewayOrder = Self::read(response).await?;
        info!(gateway_order_id = %order.id, "Razorpay order created");
        Ok(order)
    }

    async fn fetch_order(&self, gateway_order_id: &str) -> Result<GatewayOrder, PaymentError> {
        let response = self
            .client
            .get(format!("{}/orders/{gateway_order_id}", self.api_base))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await?;
        Self::read(response).await
    }

    fn verify_payment(&self, payment_id: &str, gateway_order_id: &str, signature: &str) -> bool {
        verify_signature(&self.key_secret, gateway_order_id, payment_id, signature)
    }

    #[instrument(skip(self))]
    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
        idempotency_key: &str,
    ) -> Result<Refund, PaymentError> {
        let mut body = json!({
            "receipt": idempotency_key,
            "notes": { "idempotency_key": idempotency_key },
        });
        if let Some(a) = amount {
            body["amount"] = json!(to_minor_units(a)?);
        }
        let response = self
            .client
            .post(format!("{}/payments/{payment_id}/refund", self.api_base))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .header(IDEMPOTENCY_HEADER, idempotency_key)
            .json(&body)
            .send()
            .await?;
        Self::read(response).await
    }

    async fn get_payment_details(&self, payment_id: &str) -> Result<PaymentDetails, PaymentError> {
        let response = self
            .client
            .get(format!("{}/payments/{payment_id}", self.api_base))
            .basic_auth(&self.key_id, Some(&self.key_secret))
            .send()
            .await?;
        Self::read(response).await
    }
}

/// In-process gateway that accepts every well-signed payment.
pub struct SandboxGateway {
    secret: String,
    orders: DashMap<String, GatewayOrder>,
    refunds: DashMap<String, Refund>,
}

impl SandboxGateway {
    pub fn new(secret: &str) -> Result<Self, PaymentError> {
        Ok(Self {
            secret: require(secret, "sandbox_secret")?,
            orders: DashMap::new(),
            refunds: DashMap::new(),
        })
    }

    /// Signature a client would receive for this payment.
    pub fn sign(&self, gateway_order_id: &str, payment_id: &str) -> String {
        sign_payment(&self.secret, gateway_order_id, payment_id)
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn name(&self) -> &'static str {
        SANDBOX
    }

    async fn create_order(
        &self,
        amount: Decimal,
        currency: &str,
        metadata: &HashMap<String, String>,
    ) -> Result<GatewayOrder, PaymentError> {
        let order = GatewayOrder {
            id: format!("order_sandbox_{}", Uuid::new_v4().simple()),
            amount: to_minor_units(amount)?,
            currency: currency.to_string(),
            receipt: metadata.get("receipt").cloned(),
            status: "created".into(),
        };
        self.orders.insert(order.id.clone(), order.clone());
        Ok(order)
    }

    async fn fetch_order(&self, gateway_order_id: &str) -> Result<GatewayOrder, PaymentError> {
        self.orders
            .get(gateway_order_id)
            .map(|o| o.clone())
            .ok_or_else(|| PaymentError::Gateway {
                status: 404,
                body: format!("no sandbox order {gateway_order_id}"),
            })
    }

    fn verify_payment(&self, payment_id: &str, gateway_order_id: &str, signature: &str) -> bool {
        verify_signature(&self.secret, gateway_order_id, payment_id, signature)
    }

    async fn refund_payment(
        &self,
        payment_id: &str,
        amount: Option<Decimal>,
        idempotency_key: &str,
    ) -> Result<Refund, PaymentError> {
        let amount = amount.map(to_minor_units).transpose()?.unwrap_or_default();
        let refund = self
            .refunds
            .entry(idempotency_key.to_string())
            .or_insert_with(|| Refund {
                id: format!("rfnd_sandbox_{}", Uuid::new_v4().simple()),
                payment_id: payment_id.to_string(),
                amount,
                status: "processed".into(),
            });
        Ok(refund.clone())
    }

    async fn get_payment_details(&self, payment_id: &str) -> Result<PaymentDetails, PaymentError> {
        Ok(PaymentDetails {
            id: payment_id.to_string(),
            order_id: None,
            amount: 0,
            currency: "INR".into(),
            status: "captured".into(),
            method: Some("sandbox".into()),
        })
    }
}

/// Credentials for every gateway the factory can build.
#[derive(Debug, Clone, Default)]
pub struct GatewayCredentials {
    pub razorpay_key_id: String,
    pub razorpay_key_secret: String,
    pub razorpay_api_base: String,
    pub sandbox_secret: String,
    pub timeout: StdDuration,
}

impl From<&AppConfig> for GatewayCredentials {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            razorpay_key_id: cfg.razorpay_key_id.clone(),
            razorpay_key_secret: cfg.razorpay_key_secret.clone(),
            razorpay_api_base: cfg.razorpay_api_base.clone(),
            sandbox_secret: cfg.sandbox_secret.clone(),
            timeout: GATEWAY_TIMEOUT,
        }
    }
}

/// Builds gateways on first use and keeps one instance per name.
pub struct PaymentGatewayFactory {
    credentials: GatewayCredentials,
    primary: String,
    fallback: RwLock<Option<String>>,
    instances: DashMap<String, Arc<dyn PaymentGateway>>,
}

impl PaymentGatewayFactory {
    pub fn new(credentials: GatewayCredentials, primary: impl Into<String>, fallback: Option<String>) -> Self {
        Self {
            credentials,
            primary: primary.into(),
            fallback: RwLock::new(fallback.filter(|f| !f.is_empty())),
            instances: DashMap::new(),
        }
    }

    pub fn from_config(cfg: &AppConfig) -> Self {
        Self::new(
            GatewayCredentials::from(cfg),
            cfg.payment_gateway.clone(),
            Some(cfg.payment_fallback_gateway.clone()),
        )
    }

    fn build(&self, name: &str) -> Result<Arc<dyn PaymentGateway>, PaymentError> {
        let c = &self.credentials;
        let gateway: Arc<dyn PaymentGateway> = match name {
            RAZORPAY => Arc::new(RazorpayGateway::new(
                &c.razorpay_key_id,
                &c.razorpay_key_secret,
                &c.razorpay_api_base,
                c.timeout,
            )?),
            SANDBOX => Arc::new(SandboxGateway::new(&c.sandbox_secret)?),
            other => return Err(PaymentError::Config(format!("unknown payment gateway '{other}'"))),
        };
        Ok(gateway)
    }

    /// The shared instance for `name`, built on first call.
    pub fn get(&self, name: &str) -> Result<Arc<dyn PaymentGateway>, PaymentError> {
        if let Some(existing) = self.instances.get(name) {
            return Ok(existing.clone());
        }
        let gateway = self.build(name)?;
        Ok(self.instances.entry(name.to_string()).or_insert(gateway).clone())
    }

    /// Installs `gateway` under `name`, replacing any existing instance.
    pub fn register(&self, name: impl Into<String>, gateway: Arc<dyn PaymentGateway>) {
        self.instances.insert(name.into(), gateway);
    }

    pub fn primary(&self) -> Result<Arc<dyn PaymentGateway>, PaymentError> {
        self.get(&self.primary)
    }

    /// The gateway whose signatures and order records are trusted: the
    /// primary, never the fallback.
    ///
    /// # Errors
    /// Returns [`PaymentError::Config`] when the primary is not configured.
    pub fn verifier(&self) -> Result<Arc<dyn PaymentGateway>, PaymentError> {
        self.primary()
    }

    pub fn fallback(&self) -> Option<Arc<dyn PaymentGateway>> {
        let name = self.fallback.read().unwrap_or_else(PoisonError::into_inner).clone()?;
        match self.get(&name) {
            Ok(gateway) => Some(gateway),
            Err(e) => {
                warn!(gateway = %name, error = %e, "Fallback payment gateway unavailable");
                None
            }
        }
    }

    /// Points the fallback at another gateway name. The primary is untouched.
    pub fn set_fallback(&self, name: Option<String>) {
        *self.fallback.write().unwrap_or_else(PoisonError::into_inner) = name;
    }

    /// Gateway for outbound calls (create, refund): the primary, or the
    /// fallback if the primary cannot be built.
    pub fn active(&self) -> Result<Arc<dyn PaymentGateway>, PaymentError> {
        match self.primary() {
            Ok(gateway) => Ok(gateway),
            Err(PaymentError::Config(reason)) => {
                let fallback = self.fallback().ok_or_else(|| PaymentError::Config(reason.clone()))?;
                warn!(%reason, fallback = fallback.name(), "Primary payment gateway not configured, using fallback");
                Ok(fallback)
            }
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn creds() -> GatewayCredentials {
        GatewayCredentials {
            razorpay_key_id: "rzp_test_key".into(),
            razorpay_key_secret: "rzp_secret".into(),
            razorpay_api_base: "http://localhost:9".into(),
            sandbox_secret: "sandbox".into(),
            timeout: StdDuration::from_secs(1),
        }
    }

    #[test]
    fn test_signature_round_trip() {
        let sig = sign_payment("secret", "order_1", "pay_1");
        assert!(verify_signature("secret", "order_1", "pay_1", &sig));
        assert!(!verify_signature("secret", "order_1", "pay_2", &sig));
        assert!(!verify_signature("other", "order_1", "pay_1", &sig));
    }

    #[test]
    fn test_malformed_signature_is_false() {
        assert!(!verify_signature("secret", "order_1", "pay_1", "not-hex"));
        assert!(!verify_signature("secret", "order_1", "pay_1", ""));
        assert!(!verify_signature("secret", "", "pay_1", "abcd"));
        assert!(!verify_signature("", "order_1", "pay_1", "abcd"));
    }

    #[test]
    fn test_missing_credentials_fail_fast() {
        let err = RazorpayGateway::new("", "secret", "http://x", StdDuration::from_secs(1)).err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(SandboxGateway::new("  ").is_err());
    }

    #[test]
    fn test_factory_returns_singleton() {
        let factory = PaymentGatewayFactory::new(creds(), RAZORPAY, Some(SANDBOX.into()));
        let a = factory.get(RAZORPAY).unwrap();
        let b = factory.get(RAZORPAY).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(factory.get("paypal").is_err());
    }

    #[test]
    fn test_factory_falls_back_when_primary_unconfigured() {
        let mut c = creds();
        c.razorpay_key_secret.clear();
        let factory = PaymentGatewayFactory::new(c, RAZORPAY, Some(SANDBOX.into()));
        assert_eq!(factory.active().unwrap().name(), SANDBOX);
        assert!(matches!(factory.verifier(), Err(PaymentError::Config(_))));

        factory.set_fallback(None);
        assert!(matches!(factory.active(), Err(PaymentError::Config(_))));
    }

    #[test]
    fn test_default_config_has_no_usable_gateway() {
        let cfg = AppConfig::from_defaults().unwrap();
        let factory = PaymentGatewayFactory::from_config(&cfg);
        assert_eq!(factory.verifier().err().unwrap().kind(), ErrorKind::Config);
        assert!(factory.fallback().is_none());
        assert!(factory.active().is_err());
        assert!(SandboxGateway::new(&cfg.sandbox_secret).is_err());
    }

    #[test]
    fn test_swapping_fallback_keeps_primary() {
        let factory = PaymentGatewayFactory::new(creds(), RAZORPAY, Some(SANDBOX.into()));
        let primary = factory.primary().unwrap();
        factory.set_fallback(None);
        assert!(factory.fallback().is_none());
        assert!(Arc::ptr_eq(&primary, &factory.primary().unwrap()));
    }

    #[tokio::test]
    async fn test_sandbox_order_in_paise() {
        let sandbox = SandboxGateway::new("s").unwrap();
        let order = sandbox.create_order(dec!(11000), "INR", &HashMap::new()).await.unwrap();
        assert_eq!(order.amount, 1_100_000);
        let sig = sandbox.sign(&order.id, "pay_1");
        assert!(sandbox.verify_payment("pay_1", &order.id, &sig));

        assert_eq!(sandbox.fetch_order(&order.id).await.unwrap(), order);
        let err = sandbox.fetch_order("order_unknown").await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Upstream);
    }

    #[tokio::test]
    async fn test_sandbox_refund_is_idempotent() {
        let sandbox = SandboxGateway::new("s").unwrap();
        let first = sandbox.refund_payment("pay_1", Some(dec!(250)), "order-a").await.unwrap();
        let again = sandbox.refund_payment("pay_1", Some(dec!(250)), "order-a").await.unwrap();
        assert_eq!(first, again);
        assert_eq!(first.amount, 25_000);

        let other = sandbox.refund_payment("pay_2", None, "order-b").await.unwrap();
        assert_ne!(other.id, first.id);
    }
}
