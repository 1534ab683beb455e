use std::fmt;
use std::time::Duration;

use health::HealthHandle;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer};
use rdkafka::error::{KafkaError, KafkaResult};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, Producer};
use rdkafka::topic_partition_list::TopicPartitionListElem;
use rdkafka::util::Timeout;
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::config::{ConsumerConfig, KafkaConfig};
use crate::metrics_consts::OFFSET_COMMIT_FAILURES;

/// A topic partition, as assigned to this consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Partition {
    topic: String,
    partition_number: i32,
}

impl Partition {
    pub fn new(topic: impl Into<String>, partition_number: i32) -> Self {
        Self {
            topic: topic.into(),
            partition_number,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition_number(&self) -> i32 {
        self.partition_number
    }
}

impl From<TopicPartitionListElem<'_>> for Partition {
    fn from(elem: TopicPartitionListElem<'_>) -> Self {
        Self::new(elem.topic(), elem.partition())
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.topic, self.partition_number)
    }
}

/// A message detached from the consumer, so it can be handed to a partition worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Option<Vec<u8>>,
}

impl SourceMessage {
    pub fn partition(&self) -> Partition {
        Partition::new(self.topic.clone(), self.partition)
    }
}

impl From<&BorrowedMessage<'_>> for SourceMessage {
    fn from(message: &BorrowedMessage<'_>) -> Self {
        Self {
            topic: message.topic().to_owned(),
            partition: message.partition(),
            offset: message.offset(),
            key: message.key().map(|k| k.to_vec()),
            payload: message.payload().map(|p| p.to_vec()),
        }
    }
}

pub struct KafkaContext {
    liveness: HealthHandle,
}

impl From<HealthHandle> for KafkaContext {
    fn from(value: HealthHandle) -> Self {
        KafkaContext { liveness: value }
    }
}

impl ClientContext for KafkaContext {
    fn stats(&self, _: rdkafka::Statistics) {
        // Signal liveness, as the main rdkafka loop is running and calling us
        self.liveness.report_healthy();
    }
}

fn base_client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    if config.kafka_tls {
        client_config
            .set("security.protocol", "ssl")
            .set("enable.ssl.certificate.verification", "false");
    };
    client_config
}

/// Producer for the quarantine, dead-letter and anomaly topics. Every write is
/// acknowledged by all in-sync replicas.
pub async fn create_kafka_producer(
    config: &KafkaConfig,
    liveness: HealthHandle,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = base_client_config(config);
    client_config
        .set("acks", "all")
        .set("enable.idempotence", config.kafka_enable_idempotence.to_string())
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        );

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(liveness.into())?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, Timeout::After(Duration::from_secs(15)))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

/// Consumer context that reports liveness, logs rebalances and forwards
/// revoked partitions to the consume loop so their workers can be stopped.
pub struct PipelineConsumerContext {
    liveness: HealthHandle,
    revoked: mpsc::UnboundedSender<Vec<Partition>>,
}

impl PipelineConsumerContext {
    pub fn new(liveness: HealthHandle, revoked: mpsc::UnboundedSender<Vec<Partition>>) -> Self {
        Self { liveness, revoked }
    }
}

impl ClientContext for PipelineConsumerContext {
    fn stats(&self, _: rdkafka::Statistics) {
        self.liveness.report_healthy();
    }
}

impl ConsumerContext for PipelineConsumerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                let partitions: Vec<Partition> = partitions
                    .elements()
                    .into_iter()
                    .map(Partition::from)
                    .collect();
                info!(count = partitions.len(), "partitions revoked: {:?}", partitions);

                if let Err(e) = self.revoked.send(partitions) {
                    error!("failed to forward revoked partitions to the consume loop: {}", e);
                }
            }
            Rebalance::Assign(partitions) => {
                info!(count = partitions.count(), "partitions being assigned");
            }
            Rebalance::Error(e) => {
                error!("rebalance error: {}", e);
            }
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            let assigned: Vec<String> = partitions
                .elements()
                .into_iter()
                .map(|elem| Partition::from(elem).to_string())
                .collect();
            info!(count = assigned.len(), "partitions assigned: {:?}", assigned);
        }
    }

    fn commit_callback(&self, result: KafkaResult<()>, offsets: &TopicPartitionList) {
        if let Err(e) = result {
            warn!(partitions = offsets.count(), "failed to commit offsets: {}", e);
        }
    }
}

/// Consumer with auto commit and auto offset store disabled. Offsets are only
/// committed once a message has been fully handled.
pub fn create_stream_consumer(
    kafka: &KafkaConfig,
    consumer: &ConsumerConfig,
    context: PipelineConsumerContext,
) -> Result<StreamConsumer<PipelineConsumerContext>, KafkaError> {
    let mut client_config = base_client_config(kafka);
    client_config
        .set("group.id", &consumer.kafka_consumer_group)
        .set("enable.auto.commit", "false")
        .set("enable.auto.offset.store", "false")
        .set("auto.offset.reset", &consumer.kafka_consumer_offset_reset)
        .set(
            "session.timeout.ms",
            consumer.kafka_session_timeout_ms.to_string(),
        )
        .set(
            "heartbeat.interval.ms",
            consumer.kafka_heartbeat_interval_ms.to_string(),
        )
        .set(
            "max.poll.interval.ms",
            consumer.kafka_max_poll_interval_ms.to_string(),
        );

    debug!("rdkafka consumer configuration: {:?}", client_config);
    let stream: StreamConsumer<PipelineConsumerContext> =
        client_config.create_with_context(context)?;
    stream.subscribe(&[consumer.kafka_consumer_topic.as_str()])?;
    info!(
        topic = %consumer.kafka_consumer_topic,
        group = %consumer.kafka_consumer_group,
        "subscribed to source topic"
    );

    Ok(stream)
}

/// Commits the next offset to read for a partition, once the previous one is handled.
pub trait OffsetCommitter: Send + Sync + 'static {
    fn commit(&self, partition: &Partition, next_offset: i64, mode: CommitMode) -> KafkaResult<()>;
}

impl<C: ConsumerContext + 'static> OffsetCommitter for StreamConsumer<C> {
    fn commit(&self, partition: &Partition, next_offset: i64, mode: CommitMode) -> KafkaResult<()> {
        let mut offsets = TopicPartitionList::new();
        offsets.add_partition_offset(
            partition.topic(),
            partition.partition_number(),
            Offset::Offset(next_offset),
        )?;
        Consumer::commit(self, &offsets, mode)
    }
}

/// Commit, counting and logging failures. A lost commit only means the message is
/// redelivered, which the checkpoint and the idempotent insert absorb.
pub fn commit_or_warn<C: OffsetCommitter + ?Sized>(
    committer: &C,
    partition: &Partition,
    next_offset: i64,
    mode: CommitMode,
) {
    if let Err(e) = committer.commit(partition, next_offset, mode) {
        metrics::counter!(OFFSET_COMMIT_FAILURES).increment(1);
        warn!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            next_offset,
            "failed to commit offset: {}",
            e
        );
    }
}
