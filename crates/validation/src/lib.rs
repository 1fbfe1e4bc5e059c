//! # Input validation
//!
//! Pure validators for every externally supplied value. Each returns the
//! sanitized value on success or a [`ValidationError`] naming the field;
//! nothing here panics and nothing is half-sanitized on failure.

use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use model::{OrderStatus, Pagination, PaymentMethod, PaymentStatus, ShippingAddress};
use model::pagination::{DEFAULT_LIMIT, DEFAULT_PAGE, MAX_LIMIT};
use regex::Regex;
use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// A rejected input value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub type ValidationResult<T> = Result<T, ValidationError>;

static EMAIL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?(?:\.[a-z0-9](?:[a-z0-9-]{0,61}[a-z0-9])?)+$",
    )
    .expect("email regex")
});
static PHONE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[6-9][0-9]{9}$").expect("phone regex"));
static PINCODE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[1-9][0-9]{5}$").expect("pincode regex"));
static UUID_V4_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-4[0-9a-f]{3}-[89ab][0-9a-f]{3}-[0-9a-f]{12}$").expect("uuid regex")
});
static TAG_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<[^>]*>").expect("tag regex"));

const MAX_EMAIL_LEN: usize = 254;

pub fn validate_email(input: &str) -> ValidationResult<String> {
    let email = input.trim().to_lowercase();
    if email.is_empty() {
        return Err(ValidationError::new("email", "Email is required"));
    }
    if email.len() > MAX_EMAIL_LEN || !EMAIL_RE.is_match(&email) {
        return Err(ValidationError::new("email", "Invalid email address"));
    }
    Ok(email)
}

/// Indian mobile number: ten digits starting with 6-9. A `+91`, `91` or `0`
/// prefix and common separators are accepted and stripped.
pub fn validate_phone(input: &str) -> ValidationResult<String> {
    let digits: String = input
        .trim()
        .chars()
        .filter(|c| !matches!(c, ' ' | '-' | '(' | ')' | '+'))
        .collect();
    if digits.is_empty() {
        return Err(ValidationError::new("phone", "Phone number is required"));
    }
    let national = match digits.len() {
        12 if digits.starts_with("91") => &digits[2..],
        11 if digits.starts_with('0') => &digits[1..],
        _ => digits.as_str(),
    };
    if !PHONE_RE.is_match(national) {
        return Err(ValidationError::new(
            "phone",
            "Phone number must be a valid 10-digit mobile number",
        ));
    }
    Ok(national.to_string())
}

pub fn validate_pincode(input: &str) -> ValidationResult<String> {
    let pincode = input.trim();
    if pincode.is_empty() {
        return Err(ValidationError::new("pincode", "Pincode is required"));
    }
    if !PINCODE_RE.is_match(pincode) {
        return Err(ValidationError::new(
            "pincode",
            "Pincode must be exactly 6 digits and cannot start with 0",
        ));
    }
    Ok(pincode.to_string())
}

/// Strips markup and control characters, trims, and caps length.
pub fn sanitize_text(input: &str, field: &str, max_len: usize, required: bool) -> ValidationResult<String> {
    let stripped = TAG_RE.replace_all(input, "");
    let cleaned: String = stripped
        .chars()
        .filter(|c| !c.is_control() || *c == '\n')
        .collect();
    let trimmed = cleaned.trim();
    if trimmed.is_empty() && required {
        return Err(ValidationError::new(field, format!("{field} is required")));
    }
    Ok(trimmed.chars().take(max_len).collect())
}

/// Optional variant of [`sanitize_text`]; blank input becomes `None`.
pub fn sanitize_optional_text(input: Option<&str>, field: &str, max_len: usize) -> ValidationResult<Option<String>> {
    match input {
        None => Ok(None),
        Some(raw) => {
            let text = sanitize_text(raw, field, max_len, false)?;
            Ok((!text.is_empty()).then_some(text))
        }
    }
}

pub fn validate_uuid(input: &str, field: &str) -> ValidationResult<Uuid> {
    let lowered = input.trim().to_lowercase();
    if !UUID_V4_RE.is_match(&lowered) {
        return Err(ValidationError::new(field, format!("{field} must be a valid UUID")));
    }
    Uuid::parse_str(&lowered).map_err(|_| ValidationError::new(field, format!("{field} must be a valid UUID")))
}

fn parse_enum<T: FromStr>(input: &str, field: &str, allowed: &str) -> ValidationResult<T> {
    input
        .trim()
        .to_lowercase()
        .parse()
        .map_err(|_| ValidationError::new(field, format!("Invalid {field}. Must be one of: {allowed}")))
}

pub fn validate_order_status(input: &str) -> ValidationResult<OrderStatus> {
    parse_enum(input, "status", "pending, confirmed, processing, shipped, delivered, cancelled")
}

pub fn validate_payment_method(input: &str) -> ValidationResult<PaymentMethod> {
    parse_enum(input, "payment_method", "razorpay, cod")
}

pub fn validate_payment_status(input: &str) -> ValidationResult<PaymentStatus> {
    parse_enum(input, "payment_status", "pending, completed, failed, refunded")
}

/// A finite number within `[min, max]`.
pub fn validate_number(value: f64, field: &str, min: f64, max: f64) -> ValidationResult<f64> {
    if !value.is_finite() {
        return Err(ValidationError::new(field, format!("{field} must be a finite number")));
    }
    if value < min || value > max {
        return Err(ValidationError::new(field, format!("{field} must be between {min} and {max}")));
    }
    Ok(value)
}

/// A monetary amount within `[min, max]`, rounded to paise.
pub fn validate_amount(value: f64, field: &str, min: f64, max: f64) -> ValidationResult<Decimal> {
    let value = validate_number(value, field, min, max)?;
    Decimal::from_f64(value)
        .map(model::money::round_money)
        .ok_or_else(|| ValidationError::new(field, format!("{field} is not a valid amount")))
}

pub fn validate_pagination(page: Option<i64>, limit: Option<i64>) -> ValidationResult<Pagination> {
    let page = page.unwrap_or(i64::from(DEFAULT_PAGE));
    let limit = limit.unwrap_or(i64::from(DEFAULT_LIMIT));
    if page < 1 || page > i64::from(u32::MAX) {
        return Err(ValidationError::new("page", "page must be at least 1"));
    }
    if !(1..=i64::from(MAX_LIMIT)).contains(&limit) {
        return Err(ValidationError::new("limit", format!("limit must be between 1 and {MAX_LIMIT}")));
    }
    Ok(Pagination {
        page: page as u32,
        limit: limit as u32,
    })
}

/// Accepts RFC 3339 timestamps or bare `YYYY-MM-DD` dates. A bare `to` date
/// covers the whole day.
pub fn validate_date_range(
    from: Option<&str>,
    to: Option<&str>,
) -> ValidationResult<(Option<DateTime<Utc>>, Option<DateTime<Utc>>)> {
    let from = from.map(|s| parse_date(s, "from", false)).transpose()?;
    let to = to.map(|s| parse_date(s, "to", true)).transpose()?;
    if let (Some(f), Some(t)) = (from, to) {
        if f > t {
            return Err(ValidationError::new("date_range", "from date must not be after to date"));
        }
    }
    Ok((from, to))
}

fn parse_date(input: &str, field: &str, end_of_day: bool) -> ValidationResult<DateTime<Utc>> {
    let input = input.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(input) {
        return Ok(ts.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(input, "%Y-%m-%d")
        .map_err(|_| ValidationError::new(field, format!("{field} must be a date (YYYY-MM-DD) or RFC 3339 timestamp")))?;
    let time = if end_of_day {
        NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
    } else {
        Some(NaiveTime::MIN)
    };
    let time = time.ok_or_else(|| ValidationError::new(field, "invalid time of day"))?;
    Ok(date.and_time(time).and_utc())
}

/// Raw address fields as received from a client.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AddressInput {
    pub name: Option<String>,
    pub phone: Option<String>,
    pub street: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub pincode: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Validates every address field and reports all problems in one message.
pub fn validate_address(input: &AddressInput) -> ValidationResult<ShippingAddress> {
    let mut errors: Vec<ValidationError> = Vec::new();
    let mut keep = |r: ValidationResult<String>| match r {
        Ok(v) => v,
        Err(e) => {
            errors.push(e);
            String::new()
        }
    };

    let name = keep(sanitize_text(input.name.as_deref().unwrap_or(""), "name", 100, true));
    let phone = keep(validate_phone(input.phone.as_deref().unwrap_or("")));
    let street = keep(sanitize_text(input.street.as_deref().unwrap_or(""), "street", 255, true));
    let city = keep(sanitize_text(input.city.as_deref().unwrap_or(""), "city", 100, true));
    let state = keep(sanitize_text(input.state.as_deref().unwrap_or(""), "state", 100, true));
    let pincode = keep(validate_pincode(input.pincode.as_deref().unwrap_or("")));
    let country = keep(sanitize_text(input.country.as_deref().unwrap_or("India"), "country", 60, true));
    let mut coordinate = |value: Option<f64>, field: &str, bound: f64| {
        value.and_then(|v| match validate_number(v, field, -bound, bound) {
            Ok(v) => Some(v),
            Err(e) => {
                errors.push(e);
                None
            }
        })
    };
    let latitude = coordinate(input.latitude, "latitude", 90.0);
    let longitude = coordinate(input.longitude, "longitude", 180.0);

    if !errors.is_empty() {
        let message = errors.iter().map(|e| e.message.as_str()).collect::<Vec<_>>().join(", ");
        return Err(ValidationError::new("address", message));
    }

    Ok(ShippingAddress {
        name,
        phone,
        street,
        city,
        state,
        pincode,
        country,
        latitude,
        longitude,
    })
}
