use std::str::FromStr;
use std::time;

use envconfig::Envconfig;
use thiserror::Error;

use crate::retry::RetryPolicy;
use crate::rules::Thresholds;
use crate::validation::{HeartRateBounds, Validator};

/// Configuration that would let a coordinator start in a broken state.
/// Surfaced at startup, the process does not start.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("heart rate bounds [{min}, {max}] are empty or outside the physiological range [0, 250]")]
    InvalidHeartRateBounds { min: i32, max: i32 },
    #[error("anomaly thresholds must satisfy low < high, got low={low} high={high}")]
    InvalidThresholds { low: i32, high: i32 },
    #[error("anomaly spike delta must be at least 1, got {0}")]
    InvalidSpikeDelta(i32),
    #[error("retry policy must allow at least one attempt")]
    InvalidRetryAttempts,
}

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "5")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "400")]
    pub kafka_producer_queue_mib: u32, // Size of the in-memory producer queue in mebibytes

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "lz4")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd

    #[envconfig(default = "true")]
    pub kafka_enable_idempotence: bool,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    pub kafka_consumer_group: String,

    #[envconfig(default = "events.raw.v1")]
    pub kafka_consumer_topic: String,

    // New consumer groups start from the beginning of the raw stream so nothing is missed
    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    #[envconfig(default = "45000")]
    pub kafka_session_timeout_ms: u32,

    #[envconfig(default = "15000")]
    pub kafka_heartbeat_interval_ms: u32,

    // Slow store writes under back-pressure must not trigger a rebalance
    #[envconfig(default = "300000")]
    pub kafka_max_poll_interval_ms: u32,
}

impl ConsumerConfig {
    /// The consumer group is specific to each coordinator, so each binary sets
    /// its default here before init'ing its main config struct.
    pub fn set_defaults(consumer_group: &str) {
        if std::env::var("KAFKA_CONSUMER_GROUP").is_err() {
            std::env::set_var("KAFKA_CONSUMER_GROUP", consumer_group);
        };
    }
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_MAX_ATTEMPTS", default = "5")]
    pub max_attempts: u32,

    #[envconfig(from = "RETRY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_INITIAL_INTERVAL", default = "500")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_MAXIMUM_INTERVAL", default = "10000")]
    pub maximum_interval: EnvMsDuration,
}

impl RetryPolicyConfig {
    pub fn policy(&self) -> Result<RetryPolicy, ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryAttempts);
        }
        Ok(RetryPolicy::new(
            self.max_attempts,
            self.backoff_coefficient,
            self.initial_interval.0,
            Some(self.maximum_interval.0),
        ))
    }
}

#[derive(Envconfig, Clone)]
pub struct ValidationConfig {
    #[envconfig(from = "HEART_RATE_MIN", default = "45")]
    pub heart_rate_min: i32,

    #[envconfig(from = "HEART_RATE_MAX", default = "185")]
    pub heart_rate_max: i32,

    // 0 disables the bound
    #[envconfig(from = "MAX_EVENT_TIME_SKEW_SECS", default = "300")]
    pub max_event_time_skew_secs: u64,
}

impl ValidationConfig {
    pub fn validator(&self) -> Result<Validator, ConfigError> {
        let bounds = HeartRateBounds::new(self.heart_rate_min, self.heart_rate_max).ok_or(
            ConfigError::InvalidHeartRateBounds {
                min: self.heart_rate_min,
                max: self.heart_rate_max,
            },
        )?;
        let skew = match self.max_event_time_skew_secs {
            0 => None,
            secs => Some(time::Duration::from_secs(secs)),
        };
        Ok(Validator::new(bounds, skew))
    }
}

#[derive(Envconfig, Clone)]
pub struct ThresholdConfig {
    #[envconfig(from = "ANOMALY_LOW_THRESHOLD", default = "50")]
    pub low: i32,

    #[envconfig(from = "ANOMALY_HIGH_THRESHOLD", default = "140")]
    pub high: i32,

    #[envconfig(from = "ANOMALY_SPIKE_DELTA", default = "30")]
    pub spike_delta: i32,
}

impl ThresholdConfig {
    pub fn thresholds(&self) -> Result<Thresholds, ConfigError> {
        if self.low >= self.high {
            return Err(ConfigError::InvalidThresholds {
                low: self.low,
                high: self.high,
            });
        }
        if self.spike_delta < 1 {
            return Err(ConfigError::InvalidSpikeDelta(self.spike_delta));
        }
        Ok(Thresholds {
            low: self.low,
            high: self.high,
            spike_delta: self.spike_delta,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}
