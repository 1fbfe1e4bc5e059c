//! Delivery settings, zones and lead times.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

/// Delivery-pricing tier derived from destination-to-origin proximity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeliveryZone {
    Local,
    City,
    State,
    National,
    FreeShipping,
    /// Zone could not be resolved; the standard charge applies.
    Unknown,
}

impl DeliveryZone {
    /// Lead time in days used for the delivery estimate.
    pub fn lead_time_days(self) -> i64 {
        match self {
            DeliveryZone::Local => 1,
            DeliveryZone::City => 2,
            DeliveryZone::State => 3,
            DeliveryZone::National => 5,
            DeliveryZone::FreeShipping => 2,
            DeliveryZone::Unknown => 3,
        }
    }

    pub fn estimated_delivery(self, now: DateTime<Utc>) -> DateTime<Utc> {
        now + Duration::days(self.lead_time_days())
    }
}

/// Where parcels are dispatched from.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BusinessOrigin {
    pub pincode: String,
    pub city: String,
    pub state: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// DeliverySettings: singleton pricing configuration maintained by admins.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliverySettings {
    pub origin: BusinessOrigin,
    pub local_delivery_charge: Decimal,
    pub city_delivery_charge: Decimal,
    pub state_delivery_charge: Decimal,
    pub national_delivery_charge: Decimal,
    pub free_shipping_threshold: Decimal,
    pub free_shipping_enabled: bool,
    pub updated_at: DateTime<Utc>,
}

impl DeliverySettings {
    /// Configured charge for a zone. Unresolved zones pay the national rate.
    pub fn charge_for(&self, zone: DeliveryZone) -> Decimal {
        match zone {
            DeliveryZone::Local => self.local_delivery_charge,
            DeliveryZone::City => self.city_delivery_charge,
            DeliveryZone::State => self.state_delivery_charge,
            DeliveryZone::National | DeliveryZone::Unknown => self.national_delivery_charge,
            DeliveryZone::FreeShipping => Decimal::ZERO,
        }
    }

    pub fn qualifies_for_free_shipping(&self, order_subtotal: Decimal) -> bool {
        self.free_shipping_enabled && order_subtotal >= self.free_shipping_threshold
    }

    /// Returns the name of the first negative monetary field, if any.
    pub fn negative_field(&self) -> Option<&'static str> {
        [
            ("local_delivery_charge", self.local_delivery_charge),
            ("city_delivery_charge", self.city_delivery_charge),
            ("state_delivery_charge", self.state_delivery_charge),
            ("national_delivery_charge", self.national_delivery_charge),
            ("free_shipping_threshold", self.free_shipping_threshold),
        ]
        .into_iter()
        .find(|(_, v)| *v < Decimal::ZERO)
        .map(|(name, _)| name)
    }
}

/// Resolved location of a postal code.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GeoLocation {
    pub latitude: f64,
    pub longitude: f64,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance between two points in kilometres.
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let (phi1, phi2) = (lat1.to_radians(), lat2.to_radians());
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().asin()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn settings() -> DeliverySettings {
        DeliverySettings {
            origin: BusinessOrigin {
                pincode: "400001".into(),
                city: "Mumbai".into(),
                state: "Maharashtra".into(),
                latitude: 18.9388,
                longitude: 72.8354,
            },
            local_delivery_charge: dec!(40),
            city_delivery_charge: dec!(60),
            state_delivery_charge: dec!(80),
            national_delivery_charge: dec!(100),
            free_shipping_threshold: dec!(25000),
            free_shipping_enabled: true,
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_lead_times() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        assert_eq!(DeliveryZone::National.estimated_delivery(now), now + Duration::days(5));
        assert_eq!(DeliveryZone::Unknown.lead_time_days(), 3);
        assert_eq!(DeliveryZone::FreeShipping.lead_time_days(), 2);
    }

    #[test]
    fn test_charges() {
        let s = settings();
        assert_eq!(s.charge_for(DeliveryZone::City), dec!(60));
        assert_eq!(s.charge_for(DeliveryZone::Unknown), dec!(100));
        assert!(s.qualifies_for_free_shipping(dec!(25000)));
        assert!(!s.qualifies_for_free_shipping(dec!(24999.99)));
        assert_eq!(s.negative_field(), None);
    }

    #[test]
    fn test_haversine_mumbai_delhi() {
        let d = haversine_km(18.9388, 72.8354, 28.6139, 77.2090);
        assert!((1100.0..1200.0).contains(&d), "{d}");
    }
}
