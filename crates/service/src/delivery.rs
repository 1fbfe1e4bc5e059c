//! Delivery pricing: pincode geocoding, zone classification and the
//! standard-charge fallback.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use cache::TtlCache;
use chrono::{DateTime, Utc};
use model::delivery::haversine_km;
use model::{BusinessOrigin, Clock, DeliverySettings, DeliveryZone, GeoLocation};
use repository::DeliverySettingsRepository;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use validation::ValidationError;

use crate::error::ServiceError;

#[derive(Debug, Error)]
pub enum GeocodeError {
    #[error("Geocoder request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Geocoder returned status {0}")]
    Status(u16),
    #[error("Geocoder returned malformed data: {0}")]
    Malformed(String),
}

/// Resolves an Indian postal code to coordinates.
#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the geocoder has no match for `pincode`.
    async fn geocode(&self, pincode: &str) -> Result<Option<GeoLocation>, GeocodeError>;
}

/// Nominatim-compatible geocoder.
pub struct HttpGeocoder {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    state_district: Option<String>,
    state: Option<String>,
}

impl HttpGeocoder {
    pub fn new(base_url: impl Into<String>, timeout: StdDuration) -> Result<Self, GeocodeError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("storefront-backend/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for HttpGeocoder {
    async fn geocode(&self, pincode: &str) -> Result<Option<GeoLocation>, GeocodeError> {
        let response = self
            .client
            .get(format!("{}/search", self.base_url))
            .query(&[
                ("postalcode", pincode),
                ("country", "India"),
                ("format", "json"),
                ("addressdetails", "1"),
                ("limit", "1"),
            ])
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(GeocodeError::Status(response.status().as_u16()));
        }
        let places: Vec<NominatimPlace> = response.json().await?;
        let Some(place) = places.into_iter().next() else {
            return Ok(None);
        };
        let parse = |raw: &str| {
            raw.parse::<f64>()
                .map_err(|_| GeocodeError::Malformed(format!("coordinate '{raw}'")))
        };
        let address = place.address;
        Ok(Some(GeoLocation {
            latitude: parse(&place.lat)?,
            longitude: parse(&place.lon)?,
            city: address.city.or(address.town).or(address.state_district),
            state: address.state,
        }))
    }
}

/// Distance thresholds for zone classification.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ZonePolicy {
    pub local_radius_km: f64,
    pub city_radius_km: f64,
    pub state_radius_km: f64,
}

impl Default for ZonePolicy {
    fn default() -> Self {
        Self {
            local_radius_km: 10.0,
            city_radius_km: 50.0,
            state_radius_km: 500.0,
        }
    }
}

fn same_name(a: Option<&str>, b: &str) -> bool {
    a.is_some_and(|a| a.trim().eq_ignore_ascii_case(b.trim()))
}

impl ZonePolicy {
    /// Picks the tightest zone that either the administrative match or the
    /// distance rule allows.
    pub fn classify(&self, origin: &BusinessOrigin, pincode: &str, destination: &GeoLocation) -> DeliveryZone {
        let distance = haversine_km(
            origin.latitude,
            origin.longitude,
            destination.latitude,
            destination.longitude,
        );
        if pincode == origin.pincode || distance <= self.local_radius_km {
            DeliveryZone::Local
        } else if same_name(destination.city.as_deref(), &origin.city) || distance <= self.city_radius_km {
            DeliveryZone::City
        } else if same_name(destination.state.as_deref(), &origin.state) || distance <= self.state_radius_km {
            DeliveryZone::State
        } else {
            DeliveryZone::National
        }
    }
}

/// Delivery price for one destination.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryQuote {
    pub delivery_charge: Decimal,
    pub is_free_shipping: bool,
    pub zone: DeliveryZone,
    pub estimated_delivery_date: DateTime<Utc>,
    /// The zone could not be resolved and the national charge was applied.
    pub is_standard_charge: bool,
}

const SETTINGS_KEY: &str = "delivery_settings";

pub struct DeliveryPricing {
    settings_repo: Arc<dyn DeliverySettingsRepository>,
    geocoder: Arc<dyn Geocoder>,
    geocode_cache: TtlCache<String, GeoLocation>,
    settings_cache: TtlCache<&'static str, DeliverySettings>,
    policy: ZonePolicy,
    clock: Arc<dyn Clock>,
}

impl DeliveryPricing {
    pub fn new(
        settings_repo: Arc<dyn DeliverySettingsRepository>,
        geocoder: Arc<dyn Geocoder>,
        policy: ZonePolicy,
        geocode_ttl: chrono::Duration,
        settings_ttl: chrono::Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            settings_repo,
            geocoder,
            geocode_cache: TtlCache::new("geocode", geocode_ttl, clock.clone()),
            settings_cache: TtlCache::new("delivery_settings", settings_ttl, clock.clone()),
            policy,
            clock,
        }
    }

    pub async fn settings(&self) -> Result<DeliverySettings, ServiceError> {
        if let Some(settings) = self.settings_cache.get(&SETTINGS_KEY).await {
            return Ok(settings);
        }
        let settings = self.settings_repo.get().await?;
        self.settings_cache.set(SETTINGS_KEY, settings.clone()).await;
        Ok(settings)
    }

    /// Replaces the singleton settings and drops every cached value derived from them.
    #[instrument(skip(self, settings))]
    pub async fn update_settings(&self, mut settings: DeliverySettings) -> Result<DeliverySettings, ServiceError> {
        if let Some(field) = settings.negative_field() {
            return Err(ValidationError::new(field, format!("{field} must not be negative")).into());
        }
        settings.updated_at = self.clock.now();
        self.settings_repo.update(&settings).await?;
        self.settings_cache.invalidate(&SETTINGS_KEY).await;
        info!(origin = %settings.origin.pincode, "Delivery settings updated");
        Ok(settings)
    }

    async fn locate(&self, pincode: &str) -> Result<GeoLocation, ServiceError> {
        if let Some(hit) = self.geocode_cache.get(&pincode.to_string()).await {
            debug!(pincode, "Geocode cache hit");
            return Ok(hit);
        }
        let location = self
            .geocoder
            .geocode(pincode)
            .await
            .map_err(|e| ServiceError::Upstream(e.to_string()))?
            .ok_or_else(|| ServiceError::Upstream(format!("no location found for pincode {pincode}")))?;
        self.geocode_cache.set(pincode.to_string(), location.clone()).await;
        Ok(location)
    }

    /// Prices delivery to `pincode`. Fails if the destination cannot be resolved.
    #[instrument(skip(self))]
    pub async fn calculate_delivery_charge(
        &self,
        pincode: &str,
        order_subtotal: Decimal,
    ) -> Result<DeliveryQuote, ServiceError> {
        let settings = self.settings().await?;
        let now = self.clock.now();
        if settings.qualifies_for_free_shipping(order_subtotal) {
            return Ok(DeliveryQuote {
                delivery_charge: Decimal::ZERO,
                is_free_shipping: true,
                zone: DeliveryZone::FreeShipping,
                estimated_delivery_date: DeliveryZone::FreeShipping.estimated_delivery(now),
                is_standard_charge: false,
            });
        }
        let destination = self.locate(pincode).await?;
        let zone = self.policy.classify(&settings.origin, pincode, &destination);
        Ok(DeliveryQuote {
            delivery_charge: settings.charge_for(zone),
            is_free_shipping: false,
            zone,
            estimated_delivery_date: zone.estimated_delivery(now),
            is_standard_charge: false,
        })
    }

    /// Like [`Self::calculate_delivery_charge`] but degrades to the national
    /// charge when the destination cannot be resolved.
    pub async fn quote(&self, pincode: &str, order_subtotal: Decimal) -> Result<DeliveryQuote, ServiceError> {
        match self.calculate_delivery_charge(pincode, order_subtotal).await {
            Ok(quote) => Ok(quote),
            Err(ServiceError::Upstream(reason)) => {
                warn!(pincode, %reason, "Zone resolution failed, applying standard delivery charge");
                let settings = self.settings().await?;
                let zone = DeliveryZone::Unknown;
                Ok(DeliveryQuote {
                    delivery_charge: settings.charge_for(zone),
                    is_free_shipping: false,
                    zone,
                    estimated_delivery_date: zone.estimated_delivery(self.clock.now()),
                    is_standard_charge: true,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Drops expired geocode and settings entries.
    pub async fn purge_caches(&self) -> usize {
        self.geocode_cache.purge_expired().await + self.settings_cache.purge_expired().await
    }
}
