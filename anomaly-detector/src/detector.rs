//! Evaluate every reading against the previous one for the same customer.
//!
//! Per partition: `POLL -> LOOKUP STATE -> EVALUATE -> PERSIST + PUBLISH -> UPDATE STATE -> COMMIT`.
//! Detection is advisory. An anomaly that cannot be stored or published after
//! retries is dropped and counted, the partition never waits on it.
//!
//! Spike detection relies on `customer_id` being the partition key: all readings
//! for a customer reach the same worker, in delivery order.

use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::consumer::{PartitionProcessor, ProcessorFactory};
use pipeline_common::kafka::{Partition, SourceMessage};
use pipeline_common::metrics_consts::{ANOMALIES_TOTAL, ANOMALY_DROPPED, DETECTOR_SKIPPED};
use pipeline_common::retry::{RetryError, RetryPolicy};
use pipeline_common::rules::{AnomalyRecord, AnomalyRules};
use pipeline_common::sink::{AnomalySink, SinkError};
use pipeline_common::store::{AnomalyStore, EventStore, StoreError};
use pipeline_common::validation::decode;
use tracing::{debug, info, warn};

use crate::state::DetectionState;

/// What happened to a message.
#[derive(Debug, Clone, PartialEq)]
pub enum Detection {
    Normal,
    Anomaly(AnomalyRecord),
    /// Not a well-formed reading, skipped
    Malformed,
}

pub struct DetectionContext<S, P> {
    pub store: Arc<S>,
    pub sink: Arc<P>,
    pub rules: AnomalyRules,
    pub retry_policy: RetryPolicy,
    pub warm_start: bool,
}

pub struct DetectionProcessorFactory<S, P> {
    context: Arc<DetectionContext<S, P>>,
}

impl<S, P> DetectionProcessorFactory<S, P> {
    pub fn new(context: DetectionContext<S, P>) -> Self {
        Self {
            context: Arc::new(context),
        }
    }
}

impl<S, P> ProcessorFactory for DetectionProcessorFactory<S, P>
where
    S: EventStore + AnomalyStore + 'static,
    P: AnomalySink + 'static,
{
    type Processor = DetectionProcessor<S, P>;

    fn create(&self, partition: &Partition) -> Self::Processor {
        DetectionProcessor::new(self.context.clone(), partition.clone())
    }
}

pub struct DetectionProcessor<S, P> {
    context: Arc<DetectionContext<S, P>>,
    partition: Partition,
    state: DetectionState,
    started: bool,
}

impl<S, P> DetectionProcessor<S, P>
where
    S: EventStore + AnomalyStore + 'static,
    P: AnomalySink + 'static,
{
    pub fn new(context: Arc<DetectionContext<S, P>>, partition: Partition) -> Self {
        Self {
            context,
            partition,
            state: DetectionState::new(),
            started: false,
        }
    }

    pub fn state(&self) -> &DetectionState {
        &self.state
    }

    /// Handle one message. Never fails: the state is always updated and the
    /// offset always committed.
    pub async fn handle(&mut self, message: &SourceMessage) -> Detection {
        if !self.started {
            self.started = true;
            if self.context.warm_start {
                self.warm_start(message.offset).await;
            }
        }

        let reading = match decode(message.payload.as_deref()) {
            Ok(reading) => reading,
            Err(reason) => {
                metrics::counter!(DETECTOR_SKIPPED, "reason" => reason.kind()).increment(1);
                debug!(
                    topic = %message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "skipping malformed message: {}",
                    reason
                );
                return Detection::Malformed;
            }
        };

        let prior = self.state.get(&reading.customer_id);
        let (anomaly, next) = self.context.rules.evaluate(&reading, prior);

        let detection = match anomaly {
            Some(anomaly) => {
                metrics::counter!(
                    ANOMALIES_TOTAL,
                    "type" => anomaly.anomaly_type.as_str(),
                    "severity" => anomaly.severity.as_str()
                )
                .increment(1);
                info!(
                    customer_id = %anomaly.customer_id,
                    event_id = %anomaly.event_id,
                    heart_rate = anomaly.heart_rate,
                    anomaly_type = anomaly.anomaly_type.as_str(),
                    severity = anomaly.severity.as_str(),
                    "anomaly detected"
                );
                self.persist(&anomaly).await;
                self.publish(&anomaly).await;
                Detection::Anomaly(anomaly)
            }
            None => Detection::Normal,
        };

        self.state.update(&reading.customer_id, next);
        detection
    }

    async fn warm_start(&mut self, first_offset: i64) {
        let partition = &self.partition;
        let result = self
            .context
            .retry_policy
            .retry("warm_start", StoreError::is_transient, || {
                self.context.store.latest_heart_rates(
                    partition.topic(),
                    partition.partition_number(),
                    first_offset,
                )
            })
            .await;

        match result {
            Ok(latest) => {
                let seeded = self.state.seed(latest);
                info!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    first_offset,
                    seeded,
                    "seeded detection state from the event store"
                );
            }
            Err(RetryError { error, .. }) => warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                "failed to seed detection state, starting empty: {}",
                error
            ),
        }
    }

    async fn persist(&self, anomaly: &AnomalyRecord) {
        if let Err(RetryError { attempts, error }) = self
            .context
            .retry_policy
            .retry("persist_anomaly", StoreError::is_transient, || {
                self.context.store.insert_anomaly(anomaly)
            })
            .await
        {
            metrics::counter!(ANOMALY_DROPPED, "stage" => "persist").increment(1);
            warn!(
                customer_id = %anomaly.customer_id,
                event_id = %anomaly.event_id,
                attempts,
                "dropping anomaly, failed to persist: {}",
                error
            );
        }
    }

    async fn publish(&self, anomaly: &AnomalyRecord) {
        if let Err(RetryError { attempts, error }) = self
            .context
            .retry_policy
            .retry("publish_anomaly", SinkError::is_transient, || {
                self.context.sink.publish(anomaly)
            })
            .await
        {
            metrics::counter!(ANOMALY_DROPPED, "stage" => "publish").increment(1);
            warn!(
                customer_id = %anomaly.customer_id,
                event_id = %anomaly.event_id,
                attempts,
                "dropping anomaly notification, failed to publish: {}",
                error
            );
        }
    }
}

#[async_trait]
impl<S, P> PartitionProcessor for DetectionProcessor<S, P>
where
    S: EventStore + AnomalyStore + 'static,
    P: AnomalySink + 'static,
{
    type Error = Infallible;

    async fn process(&mut self, message: &SourceMessage) -> Result<(), Infallible> {
        self.handle(message).await;
        Ok(())
    }
}
