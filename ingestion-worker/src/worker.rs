//! Consume raw readings, persist the valid ones exactly once and route the rest.
//!
//! Per partition: `POLL -> VALIDATE -> ROUTE -> COMMIT`. A valid reading is
//! inserted idempotently together with its checkpoint. An invalid one goes to the
//! invalid topic. Anything that keeps failing goes to the dead-letter topic so the
//! partition keeps moving. Only a dead-letter failure stops the partition, since
//! committing past the message would lose it.

use std::sync::Arc;

use async_trait::async_trait;
use pipeline_common::checkpoint::{reconcile, CheckpointKey, CheckpointStore, Reconciliation};
use pipeline_common::consumer::{PartitionProcessor, ProcessorFactory};
use pipeline_common::kafka::{Partition, SourceMessage};
use pipeline_common::metrics_consts::{
    CHECKPOINT_SKIPPED, DB_INSERTS, DLQ_TOTAL, DUPLICATES, INVALID_TOTAL,
};
use pipeline_common::reading::{PersistedEvent, Provenance, Reading};
use pipeline_common::retry::{RetryError, RetryPolicy};
use pipeline_common::sink::{ErrorType, QuarantineEnvelope, QuarantineSink, SinkError};
use pipeline_common::store::{EventStore, InsertOutcome, StoreError};
use pipeline_common::validation::{InvalidReason, Validator};
use tracing::{debug, error, info, warn};

use crate::error::ProcessingError;

/// What happened to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Inserted,
    Duplicate,
    Invalid,
    DeadLettered,
    /// Already durable according to the checkpoint
    Skipped,
}

/// Everything a partition processor needs, shared by all partitions.
pub struct IngestionContext<S, Q> {
    pub store: Arc<S>,
    pub invalid_sink: Arc<Q>,
    pub dlq_sink: Arc<Q>,
    pub validator: Validator,
    pub retry_policy: RetryPolicy,
    pub consumer_group: String,
}

pub struct IngestionProcessorFactory<S, Q> {
    context: Arc<IngestionContext<S, Q>>,
}

impl<S, Q> IngestionProcessorFactory<S, Q> {
    pub fn new(context: IngestionContext<S, Q>) -> Self {
        Self {
            context: Arc::new(context),
        }
    }
}

impl<S, Q> ProcessorFactory for IngestionProcessorFactory<S, Q>
where
    S: EventStore + CheckpointStore + 'static,
    Q: QuarantineSink + 'static,
{
    type Processor = IngestionProcessor<S, Q>;

    fn create(&self, partition: &Partition) -> Self::Processor {
        IngestionProcessor::new(self.context.clone(), partition)
    }
}

pub struct IngestionProcessor<S, Q> {
    context: Arc<IngestionContext<S, Q>>,
    checkpoint_key: CheckpointKey,
    /// Decided on the first message after the partition was assigned
    reconciliation: Option<Reconciliation>,
}

impl<S, Q> IngestionProcessor<S, Q>
where
    S: EventStore + CheckpointStore + 'static,
    Q: QuarantineSink + 'static,
{
    pub fn new(context: Arc<IngestionContext<S, Q>>, partition: &Partition) -> Self {
        let checkpoint_key = CheckpointKey::new(
            context.consumer_group.clone(),
            partition.topic(),
            partition.partition_number(),
        );
        Self {
            context,
            checkpoint_key,
            reconciliation: None,
        }
    }

    /// Handle one message. Errors are only returned when the message could not be
    /// dead-lettered, in which case its offset must not be committed.
    pub async fn handle(&mut self, message: &SourceMessage) -> Result<Outcome, ProcessingError> {
        let reconciliation = match self.reconciliation {
            Some(reconciliation) => reconciliation,
            None => {
                let reconciliation = self.reconcile(message.offset).await;
                self.reconciliation = Some(reconciliation);
                reconciliation
            }
        };
        if reconciliation.skips(message.offset) {
            metrics::counter!(CHECKPOINT_SKIPPED).increment(1);
            debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "skipping message already recorded in the checkpoint"
            );
            return Ok(Outcome::Skipped);
        }

        match self.context.validator.validate(message.payload.as_deref()) {
            Ok(reading) => self.persist(message, reading).await,
            Err(reason) => self.route_invalid(message, reason).await,
        }
    }

    async fn reconcile(&self, first_offset: i64) -> Reconciliation {
        let key = &self.checkpoint_key;
        let checkpoint = match self
            .context
            .retry_policy
            .retry("load_checkpoint", StoreError::is_transient, || {
                self.context.store.load(key)
            })
            .await
        {
            Ok(checkpoint) => checkpoint,
            Err(RetryError { error, .. }) => {
                // Replaying is safe, the idempotent insert absorbs it
                warn!(
                    topic = %key.topic,
                    partition = key.partition,
                    "failed to load checkpoint, trusting the stream offset: {}",
                    error
                );
                None
            }
        };

        let reconciliation = reconcile(first_offset, checkpoint.as_ref());
        match reconciliation {
            Reconciliation::SkipThrough(last_offset) => info!(
                topic = %key.topic,
                partition = key.partition,
                first_offset,
                last_offset,
                "checkpoint is ahead of the committed offset, skipping durable messages"
            ),
            Reconciliation::TrustStream => debug!(
                topic = %key.topic,
                partition = key.partition,
                first_offset,
                "resuming from the committed offset"
            ),
        }
        reconciliation
    }

    async fn persist(
        &self,
        message: &SourceMessage,
        reading: Reading,
    ) -> Result<Outcome, ProcessingError> {
        let event = PersistedEvent::valid(
            reading,
            Provenance {
                topic: message.topic.clone(),
                partition: message.partition,
                offset: message.offset,
            },
        );

        let result = self
            .context
            .retry_policy
            .retry("persist", StoreError::is_transient, || {
                self.context.store.persist(&event, &self.checkpoint_key)
            })
            .await;

        match result {
            Ok(InsertOutcome::Inserted) => {
                metrics::counter!(DB_INSERTS).increment(1);
                debug!(
                    customer_id = %event.reading.customer_id,
                    event_id = %event.reading.event_id,
                    offset = message.offset,
                    "persisted reading"
                );
                Ok(Outcome::Inserted)
            }
            Ok(InsertOutcome::Duplicate) => {
                metrics::counter!(DUPLICATES).increment(1);
                debug!(
                    customer_id = %event.reading.customer_id,
                    event_id = %event.reading.event_id,
                    offset = message.offset,
                    "reading already persisted"
                );
                Ok(Outcome::Duplicate)
            }
            Err(RetryError { attempts, error }) => {
                self.dead_letter(
                    message,
                    ProcessingError::Poison {
                        attempts,
                        error: error.to_string(),
                    },
                )
                .await
            }
        }
    }

    async fn route_invalid(
        &self,
        message: &SourceMessage,
        reason: InvalidReason,
    ) -> Result<Outcome, ProcessingError> {
        metrics::counter!(INVALID_TOTAL, "reason" => reason.kind()).increment(1);
        warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "invalid message: {}",
            reason
        );

        let envelope = QuarantineEnvelope::new(message, ErrorType::Validation, reason.to_string());
        let result = self
            .context
            .retry_policy
            .retry("quarantine_invalid", SinkError::is_transient, || {
                self.context
                    .invalid_sink
                    .quarantine(message.key.as_deref(), &envelope)
            })
            .await;

        match result {
            Ok(()) => {
                self.advance_checkpoint(message.offset).await;
                Ok(Outcome::Invalid)
            }
            Err(RetryError { attempts, error }) => {
                self.dead_letter(
                    message,
                    ProcessingError::Poison {
                        attempts,
                        error: format!("failed to quarantine invalid message: {error}"),
                    },
                )
                .await
            }
        }
    }

    async fn dead_letter(
        &self,
        message: &SourceMessage,
        cause: ProcessingError,
    ) -> Result<Outcome, ProcessingError> {
        let envelope = QuarantineEnvelope::new(message, ErrorType::Processing, cause.to_string());
        self.context
            .retry_policy
            .retry("dead_letter", SinkError::is_transient, || {
                self.context
                    .dlq_sink
                    .quarantine(message.key.as_deref(), &envelope)
            })
            .await
            .map_err(|RetryError { error, .. }| ProcessingError::Sink(error))?;

        metrics::counter!(DLQ_TOTAL).increment(1);
        error!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "message dead-lettered: {}",
            cause
        );
        self.advance_checkpoint(message.offset).await;
        Ok(Outcome::DeadLettered)
    }

    /// Routed messages have no event row, but the checkpoint still moves past them.
    async fn advance_checkpoint(&self, offset: i64) {
        let key = &self.checkpoint_key;
        if let Err(RetryError { error, .. }) = self
            .context
            .retry_policy
            .retry("upsert_checkpoint", StoreError::is_transient, || {
                self.context.store.upsert(key, offset)
            })
            .await
        {
            warn!(
                topic = %key.topic,
                partition = key.partition,
                offset,
                "failed to advance checkpoint past a routed message: {}",
                error
            );
        }
    }
}

#[async_trait]
impl<S, Q> PartitionProcessor for IngestionProcessor<S, Q>
where
    S: EventStore + CheckpointStore + 'static,
    Q: QuarantineSink + 'static,
{
    type Error = ProcessingError;

    async fn process(&mut self, message: &SourceMessage) -> Result<(), ProcessingError> {
        self.handle(message).await.map(|_| ())
    }
}
