use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A heart-rate reading that passed schema validation.
///
/// Uniqueness is defined by `(customer_id, event_id)`, not `event_id` alone.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub event_id: Uuid,
    /// Partition key of the source stream, trimmed.
    pub customer_id: String,
    pub event_time: DateTime<Utc>,
    /// Beats per minute.
    pub heart_rate: i32,
    /// The original JSON object, extra fields included, kept for forward schema compatibility.
    pub payload: Map<String, Value>,
}

/// Where a persisted event was read from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityFlag {
    Valid,
}

impl QualityFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityFlag::Valid => "valid",
        }
    }
}

impl fmt::Display for QualityFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A validated reading as written to the event store. Never mutated once written.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEvent {
    pub reading: Reading,
    pub provenance: Provenance,
    pub quality_flag: QualityFlag,
}

impl PersistedEvent {
    pub fn valid(reading: Reading, provenance: Provenance) -> Self {
        Self {
            reading,
            provenance,
            quality_flag: QualityFlag::Valid,
        }
    }

    pub fn payload(&self) -> Value {
        Value::Object(self.reading.payload.clone())
    }
}

