//! Schema and domain checks on one raw message.
//!
//! Checks never throw and never partially validate: a payload either becomes a
//! [`Reading`] or is rejected with a tagged [`InvalidReason`].

use std::time;

use chrono::{DateTime, Utc};
use serde_json::{Map, Number, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::reading::Reading;

/// Physiological bounds applied to every reading, whatever the configured domain range.
pub const HARD_MIN_HEART_RATE: i32 = 0;
pub const HARD_MAX_HEART_RATE: i32 = 250;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidReason {
    /// Missing or mistyped fields, or a payload that is not a JSON object at all.
    #[error("schema invalid: {0}")]
    SchemaInvalid(String),
    /// Well-formed, but a value is outside the accepted range.
    #[error("domain invalid: {0}")]
    DomainInvalid(String),
}

impl InvalidReason {
    /// Metric label for this reason.
    pub fn kind(&self) -> &'static str {
        match self {
            InvalidReason::SchemaInvalid(_) => "schema",
            InvalidReason::DomainInvalid(_) => "domain",
        }
    }
}

fn schema(detail: impl Into<String>) -> InvalidReason {
    InvalidReason::SchemaInvalid(detail.into())
}

fn domain(detail: impl Into<String>) -> InvalidReason {
    InvalidReason::DomainInvalid(detail.into())
}

/// Inclusive heart-rate range accepted for persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartRateBounds {
    min: i32,
    max: i32,
}

impl HeartRateBounds {
    /// Returns None for an empty range or one reaching outside the physiological bounds.
    pub fn new(min: i32, max: i32) -> Option<Self> {
        if min > max || min < HARD_MIN_HEART_RATE || max > HARD_MAX_HEART_RATE {
            return None;
        }
        Some(Self { min, max })
    }

    pub fn contains(&self, heart_rate: i32) -> bool {
        (self.min..=self.max).contains(&heart_rate)
    }

    pub fn min(&self) -> i32 {
        self.min
    }

    pub fn max(&self) -> i32 {
        self.max
    }
}

/// Decode a raw payload into a [`Reading`], applying schema checks and the
/// physiological bounds only. Used directly by anomaly detection, which
/// classifies every well-formed reading.
pub fn decode(payload: Option<&[u8]>) -> Result<Reading, InvalidReason> {
    let bytes = payload.ok_or_else(|| schema("empty payload"))?;
    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| schema(format!("malformed json: {e}")))?;
    let Value::Object(fields) = value else {
        return Err(schema("payload is not a JSON object"));
    };

    let event_id = required_str(&fields, "event_id")?;
    let event_id = Uuid::parse_str(event_id)
        .map_err(|e| schema(format!("event_id is not a valid UUID: {e}")))?;

    let customer_id = required_str(&fields, "customer_id")?.trim();
    if customer_id.is_empty() {
        return Err(schema("customer_id cannot be empty or whitespace"));
    }

    let event_time = match fields
        .get("timestamp")
        .filter(|v| !v.is_null())
        .or_else(|| fields.get("event_time"))
    {
        None | Some(Value::Null) => return Err(schema("missing field timestamp")),
        Some(Value::String(raw)) => DateTime::parse_from_rfc3339(raw)
            .map_err(|e| schema(format!("timestamp is not RFC 3339: {e}")))?
            .with_timezone(&Utc),
        Some(_) => return Err(schema("timestamp must be a string")),
    };

    let heart_rate = match fields.get("heart_rate") {
        None | Some(Value::Null) => return Err(schema("missing field heart_rate")),
        Some(Value::Number(n)) => integral(n)
            .ok_or_else(|| schema(format!("heart_rate must be an integer, got {n}")))?,
        Some(_) => return Err(schema("heart_rate must be an integer")),
    };
    if !(HARD_MIN_HEART_RATE as i64..=HARD_MAX_HEART_RATE as i64).contains(&heart_rate) {
        return Err(domain(format!(
            "heart_rate {heart_rate} is outside hard physiological bounds [{HARD_MIN_HEART_RATE}, {HARD_MAX_HEART_RATE}]"
        )));
    }

    Ok(Reading {
        event_id,
        customer_id: customer_id.to_owned(),
        event_time,
        heart_rate: heart_rate as i32,
        payload: fields,
    })
}

/// Integers, or floats with no fractional part such as `72.0`.
fn integral(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        let f = n.as_f64()?;
        let in_range = (f64::from(i32::MIN)..=f64::from(i32::MAX)).contains(&f);
        (in_range && f.fract() == 0.0).then_some(f as i64)
    })
}

fn required_str<'a>(fields: &'a Map<String, Value>, name: &str) -> Result<&'a str, InvalidReason> {
    match fields.get(name) {
        None | Some(Value::Null) => Err(schema(format!("missing field {name}"))),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(schema(format!("{name} must be a string"))),
    }
}

/// Validates raw messages for persistence: schema, configured domain range and event time skew.
#[derive(Debug, Clone)]
pub struct Validator {
    bounds: HeartRateBounds,
    /// How far ahead of the wall clock an event_time may be. Past readings are always accepted,
    /// since replays legitimately carry old timestamps.
    max_future_skew: Option<time::Duration>,
}

impl Validator {
    pub fn new(bounds: HeartRateBounds, max_future_skew: Option<time::Duration>) -> Self {
        Self {
            bounds,
            max_future_skew,
        }
    }

    pub fn validate(&self, payload: Option<&[u8]>) -> Result<Reading, InvalidReason> {
        self.validate_at(payload, Utc::now())
    }

    pub fn validate_at(
        &self,
        payload: Option<&[u8]>,
        now: DateTime<Utc>,
    ) -> Result<Reading, InvalidReason> {
        let reading = decode(payload)?;

        if !self.bounds.contains(reading.heart_rate) {
            return Err(domain(format!(
                "heart_rate {} is outside the configured domain bounds [{}, {}]",
                reading.heart_rate,
                self.bounds.min(),
                self.bounds.max()
            )));
        }

        if let Some(skew) = self.max_future_skew {
            let limit = chrono::Duration::from_std(skew)
                .ok()
                .and_then(|skew| now.checked_add_signed(skew));
            if limit.is_some_and(|limit| reading.event_time > limit) {
                return Err(domain(format!(
                    "timestamp {} is more than {}s ahead of now",
                    reading.event_time.to_rfc3339(),
                    skew.as_secs()
                )));
            }
        }

        Ok(reading)
    }
}
