use async_trait::async_trait;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::error;

use crate::kafka::SourceMessage;
use crate::rules::AnomalyRecord;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to serialize: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("failed to produce to kafka: {0}")]
    Produce(KafkaError),
    #[error("failed to produce to kafka (timeout)")]
    Canceled,
}

impl SinkError {
    /// Broker errors are worth retrying, unless the message can never fit.
    pub fn is_transient(&self) -> bool {
        match self {
            SinkError::Serialization(_) => false,
            SinkError::Produce(e) => !matches!(
                e.rdkafka_error_code(),
                Some(RDKafkaErrorCode::MessageSizeTooLarge)
            ),
            SinkError::Canceled => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorType {
    /// The message failed validation, sent to the invalid topic
    Validation,
    /// Handling failed after retries, sent to the dead-letter topic
    Processing,
}

/// A source message that was set aside, with the reason it was.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineEnvelope {
    pub error: String,
    pub error_type: ErrorType,
    /// The original payload, lossily decoded when it is not valid UTF-8
    pub raw: String,
    pub source_topic: String,
    pub source_partition: i32,
    pub source_offset: i64,
}

impl QuarantineEnvelope {
    pub fn new(message: &SourceMessage, error_type: ErrorType, error: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            error_type,
            raw: message
                .payload
                .as_deref()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .unwrap_or_default(),
            source_topic: message.topic.clone(),
            source_partition: message.partition,
            source_offset: message.offset,
        }
    }
}

/// Destination for invalid and dead-lettered messages.
#[async_trait]
pub trait QuarantineSink: Send + Sync {
    async fn quarantine(
        &self,
        key: Option<&[u8]>,
        envelope: &QuarantineEnvelope,
    ) -> Result<(), SinkError>;
}

/// Destination for anomaly notifications.
#[async_trait]
pub trait AnomalySink: Send + Sync {
    async fn publish(&self, anomaly: &AnomalyRecord) -> Result<(), SinkError>;
}

/// Writes JSON messages to a single topic and waits for the broker acknowledgement.
pub struct KafkaSink<C: ClientContext + 'static> {
    producer: FutureProducer<C>,
    topic: String,
}

impl<C: ClientContext + 'static> KafkaSink<C> {
    pub fn new(producer: FutureProducer<C>, topic: impl Into<String>) -> Self {
        Self {
            producer,
            topic: topic.into(),
        }
    }

    pub fn flush(&self, timeout: std::time::Duration) -> Result<(), KafkaError> {
        self.producer.flush(timeout)
    }

    async fn send(&self, key: Option<&[u8]>, payload: &[u8]) -> Result<(), SinkError> {
        let delivery = self
            .producer
            .send_result(FutureRecord {
                topic: self.topic.as_str(),
                payload: Some(payload),
                partition: None,
                key,
                timestamp: None,
                headers: None,
            })
            .map_err(|(e, _)| {
                error!(topic = %self.topic, "failed to enqueue message: {}", e);
                SinkError::Produce(e)
            })?;

        match delivery.await {
            // Cancelled due to timeout while retrying
            Err(_) => Err(SinkError::Canceled),
            Ok(Err((e, _))) => Err(SinkError::Produce(e)),
            Ok(Ok(_)) => Ok(()),
        }
    }
}

#[async_trait]
impl<C: ClientContext + 'static> QuarantineSink for KafkaSink<C> {
    async fn quarantine(
        &self,
        key: Option<&[u8]>,
        envelope: &QuarantineEnvelope,
    ) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(envelope)?;
        self.send(key, &payload).await
    }
}

#[async_trait]
impl<C: ClientContext + 'static> AnomalySink for KafkaSink<C> {
    async fn publish(&self, anomaly: &AnomalyRecord) -> Result<(), SinkError> {
        let payload = serde_json::to_vec(anomaly)?;
        self.send(Some(anomaly.customer_id.as_bytes()), &payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KafkaConfig;
    use crate::kafka::{create_kafka_producer, KafkaContext};
    use assert_json_diff::assert_json_include;
    use health::HealthRegistry;
    use rdkafka::mocking::MockCluster;
    use rdkafka::producer::DefaultProducerContext;
    use rdkafka::types::{RDKafkaApiKey, RDKafkaRespErr};
    use serde_json::json;

    async fn start_on_mocked_sink() -> (
        MockCluster<'static, DefaultProducerContext>,
        KafkaSink<KafkaContext>,
    ) {
        let registry = HealthRegistry::new("liveness");
        let handle = registry.register("producer".to_string(), time::Duration::seconds(30));
        let cluster = MockCluster::new(1).expect("failed to create mock brokers");
        let config = KafkaConfig {
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_enable_idempotence: false,
            kafka_tls: false,
            kafka_hosts: cluster.bootstrap_servers(),
        };
        let producer = create_kafka_producer(&config, handle)
            .await
            .expect("failed to create mocked kafka producer");
        (cluster, KafkaSink::new(producer, "events.invalid.v1"))
    }

    fn message() -> SourceMessage {
        SourceMessage {
            topic: "events.raw.v1".to_string(),
            partition: 2,
            offset: 17,
            key: Some(b"cust_00001".to_vec()),
            payload: Some(br#"{"heart_rate": "fast"}"#.to_vec()),
        }
    }

    #[test]
    fn envelope_wire_format() {
        let envelope = QuarantineEnvelope::new(
            &message(),
            ErrorType::Validation,
            "schema invalid: heart_rate must be an integer",
        );
        assert_json_include!(
            actual: serde_json::to_value(&envelope).unwrap(),
            expected: json!({
                "error": "schema invalid: heart_rate must be an integer",
                "error_type": "VALIDATION",
                "raw": r#"{"heart_rate": "fast"}"#,
                "source_offset": 17,
            })
        );

        let mut binary = message();
        binary.payload = Some(vec![0xff, 0xfe]);
        let envelope = QuarantineEnvelope::new(&binary, ErrorType::Processing, "boom");
        assert_eq!(envelope.raw, "\u{fffd}\u{fffd}");
        assert_eq!(
            serde_json::to_value(envelope.error_type).unwrap(),
            json!("PROCESSING")
        );
    }

    #[test]
    fn only_oversized_messages_are_permanent_broker_errors() {
        assert!(SinkError::Canceled.is_transient());
        assert!(
            SinkError::Produce(KafkaError::MessageProduction(RDKafkaErrorCode::BrokerNotAvailable))
                .is_transient()
        );
        assert!(
            !SinkError::Produce(KafkaError::MessageProduction(RDKafkaErrorCode::MessageSizeTooLarge))
                .is_transient()
        );
    }

    #[tokio::test]
    async fn kafka_sink_error_handling() {
        // Uses a mocked Kafka broker that allows injecting write errors.
        let (cluster, sink) = start_on_mocked_sink().await;
        let envelope = QuarantineEnvelope::new(&message(), ErrorType::Validation, "invalid");

        // Wait for producer to be healthy, to keep kafka_message_timeout_ms short and tests faster
        for _ in 0..20 {
            if sink.quarantine(Some(b"cust_00001"), &envelope).await.is_ok() {
                break;
            }
        }

        sink.quarantine(Some(b"cust_00001"), &envelope)
            .await
            .expect("failed to send initial envelope");

        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_MSG_SIZE_TOO_LARGE; 1];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        match sink.quarantine(None, &envelope).await {
            Err(err) => assert!(!err.is_transient(), "unexpected error {err}"),
            Ok(()) => panic!("should have errored"),
        };

        // Transient errors are retried by the producer, messages go through OK
        cluster.clear_request_errors(RDKafkaApiKey::Produce);
        let err = [RDKafkaRespErr::RD_KAFKA_RESP_ERR_BROKER_NOT_AVAILABLE; 2];
        cluster.request_errors(RDKafkaApiKey::Produce, &err);
        sink.quarantine(None, &envelope)
            .await
            .expect("failed to send envelope after recovery");
    }
}
