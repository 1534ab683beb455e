//! Per-key stateful anomaly rules.
//!
//! Rules are evaluated in a fixed priority order and the first match wins:
//!
//! 1. `LOW_HEART_RATE`  when `heart_rate <= low`, severity high
//! 2. `HIGH_HEART_RATE` when `heart_rate >= high`, severity high
//! 3. `SPIKE` when a previous reading exists for the key and
//!    `|heart_rate - previous| >= spike_delta`, severity medium
//!
//! Absolute threshold breaches outrank relative spikes. The first reading seen
//! for a key can never be a spike.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::reading::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Thresholds {
    pub low: i32,
    pub high: i32,
    pub spike_delta: i32,
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: 50,
            high: 140,
            spike_delta: 30,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnomalyType {
    LowHeartRate,
    HighHeartRate,
    Spike,
}

impl AnomalyType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnomalyType::LowHeartRate => "LOW_HEART_RATE",
            AnomalyType::HighHeartRate => "HIGH_HEART_RATE",
            AnomalyType::Spike => "SPIKE",
        }
    }
}

impl fmt::Display for AnomalyType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    High,
    Medium,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::High => "high",
            Severity::Medium => "medium",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a rule fired. The shape depends on the anomaly type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AnomalyDetails {
    Spike {
        delta: i32,
        threshold: i32,
        previous: i32,
        measured: i32,
    },
    Threshold {
        threshold: i32,
        measured: i32,
    },
}

/// Outcome of the rule set for one heart rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub details: AnomalyDetails,
}

/// An anomalous reading, as stored and published downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyRecord {
    pub event_id: Uuid,
    pub customer_id: String,
    #[serde(rename = "timestamp")]
    pub event_time: DateTime<Utc>,
    pub heart_rate: i32,
    pub anomaly_type: AnomalyType,
    pub severity: Severity,
    pub details: AnomalyDetails,
}

impl AnomalyRecord {
    pub fn new(reading: &Reading, classification: Classification) -> Self {
        Self {
            event_id: reading.event_id,
            customer_id: reading.customer_id.clone(),
            event_time: reading.event_time,
            heart_rate: reading.heart_rate,
            anomaly_type: classification.anomaly_type,
            severity: classification.severity,
            details: classification.details,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalyRules {
    thresholds: Thresholds,
}

impl AnomalyRules {
    pub fn new(thresholds: Thresholds) -> Self {
        Self { thresholds }
    }

    pub fn thresholds(&self) -> &Thresholds {
        &self.thresholds
    }

    /// Apply the rules to a heart rate, given the previous heart rate seen for the same key.
    pub fn classify(&self, heart_rate: i32, previous: Option<i32>) -> Option<Classification> {
        let Thresholds {
            low,
            high,
            spike_delta,
        } = self.thresholds;

        if heart_rate <= low {
            return Some(Classification {
                anomaly_type: AnomalyType::LowHeartRate,
                severity: Severity::High,
                details: AnomalyDetails::Threshold {
                    threshold: low,
                    measured: heart_rate,
                },
            });
        }

        if heart_rate >= high {
            return Some(Classification {
                anomaly_type: AnomalyType::HighHeartRate,
                severity: Severity::High,
                details: AnomalyDetails::Threshold {
                    threshold: high,
                    measured: heart_rate,
                },
            });
        }

        let previous = previous?;
        let delta = (heart_rate - previous).abs();
        (delta >= spike_delta).then_some(Classification {
            anomaly_type: AnomalyType::Spike,
            severity: Severity::Medium,
            details: AnomalyDetails::Spike {
                delta,
                threshold: spike_delta,
                previous,
                measured: heart_rate,
            },
        })
    }

    /// Evaluate a reading against the prior state for its key.
    ///
    /// Returns at most one anomaly, and the new state for the key, which is always
    /// the reading's heart rate whether or not a rule fired.
    pub fn evaluate(&self, reading: &Reading, prior: Option<i32>) -> (Option<AnomalyRecord>, i32) {
        let anomaly = self
            .classify(reading.heart_rate, prior)
            .map(|classification| AnomalyRecord::new(reading, classification));
        (anomaly, reading.heart_rate)
    }
}
