//! Partitioned consume loop shared by both coordinators.
//!
//! Each assigned partition gets its own worker task fed by a bounded channel:
//! ordering is preserved within a partition, partitions are handled in parallel,
//! and a slow store applies backpressure to the consume loop. A worker commits
//! `offset + 1` after each message its processor handled, so a message is never
//! committed before it is durable or routed.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use health::{ComponentStatus, HealthHandle, HealthRegistry};
use rdkafka::consumer::{CommitMode, StreamConsumer};
use rdkafka::error::KafkaError;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kafka::{commit_or_warn, OffsetCommitter, Partition, PipelineConsumerContext, SourceMessage};
use crate::metrics_consts::MESSAGES_CONSUMED;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("partition worker for {partition} stopped: {reason}")]
    WorkerFailed { partition: Partition, reason: String },
}

/// Handles the messages of one partition, in order.
#[async_trait]
pub trait PartitionProcessor: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Returning Ok lets the worker commit the message's offset. An error is
    /// unrecoverable for the partition: the worker stops without committing,
    /// so the message is redelivered after a restart.
    async fn process(&mut self, message: &SourceMessage) -> Result<(), Self::Error>;
}

/// Creates the processor owning a newly assigned partition.
pub trait ProcessorFactory: Send + Sync + 'static {
    type Processor: PartitionProcessor;

    fn create(&self, partition: &Partition) -> Self::Processor;
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Messages buffered per partition before the consume loop waits.
    pub channel_capacity: usize,
    /// A worker busy on one message for longer than this is reported as stalled.
    pub liveness_deadline: time::Duration,
    /// How long to wait for workers to drain on revocation or shutdown.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 100,
            liveness_deadline: time::Duration::seconds(60),
            shutdown_grace: Duration::from_secs(30),
        }
    }
}

struct PartitionWorker {
    sender: mpsc::Sender<SourceMessage>,
    handle: JoinHandle<()>,
}

/// The set of running partition workers.
pub struct PartitionWorkers<F: ProcessorFactory, C: OffsetCommitter> {
    factory: Arc<F>,
    committer: Arc<C>,
    liveness: HealthRegistry,
    config: WorkerConfig,
    workers: HashMap<Partition, PartitionWorker>,
    failures_tx: mpsc::UnboundedSender<ConsumerError>,
    failures_rx: mpsc::UnboundedReceiver<ConsumerError>,
}

impl<F: ProcessorFactory, C: OffsetCommitter> PartitionWorkers<F, C> {
    pub fn new(factory: F, committer: Arc<C>, liveness: HealthRegistry, config: WorkerConfig) -> Self {
        let (failures_tx, failures_rx) = mpsc::unbounded_channel();
        Self {
            factory: Arc::new(factory),
            committer,
            liveness,
            config,
            workers: HashMap::new(),
            failures_tx,
            failures_rx,
        }
    }

    pub fn partitions(&self) -> impl Iterator<Item = &Partition> {
        self.workers.keys()
    }

    /// Hand a message to its partition's worker, starting one if needed.
    /// Waits while the worker's channel is full.
    pub async fn dispatch(&mut self, message: SourceMessage) -> Result<(), ConsumerError> {
        let partition = message.partition();
        let sender = match self.workers.get(&partition) {
            Some(worker) => worker.sender.clone(),
            None => {
                let worker = self.spawn(partition.clone());
                let sender = worker.sender.clone();
                self.workers.insert(partition.clone(), worker);
                sender
            }
        };
        if sender.send(message).await.is_err() {
            self.workers.remove(&partition);
            return Err(ConsumerError::WorkerFailed {
                partition,
                reason: "worker is no longer running".to_string(),
            });
        }
        Ok(())
    }

    /// Resolves with the first unrecoverable worker failure.
    pub async fn next_failure(&mut self) -> Option<ConsumerError> {
        self.failures_rx.recv().await
    }

    /// Drain and stop the workers of revoked partitions.
    pub async fn revoke(&mut self, partitions: &[Partition]) {
        let stopping: Vec<(Partition, PartitionWorker)> = partitions
            .iter()
            .filter_map(|p| self.workers.remove_entry(p))
            .collect();
        self.stop(stopping).await;
    }

    /// Drain and stop every worker. Each one commits its last handled offset synchronously.
    pub async fn shutdown(mut self) {
        let stopping: Vec<(Partition, PartitionWorker)> = self.workers.drain().collect();
        self.stop(stopping).await;
    }

    async fn stop(&self, workers: Vec<(Partition, PartitionWorker)>) {
        if workers.is_empty() {
            return;
        }
        let partitions: Vec<String> = workers.iter().map(|(p, _)| p.to_string()).collect();
        let handles = workers.into_iter().map(|(_, worker)| {
            // Dropping the sender lets the worker finish its buffered messages and exit
            drop(worker.sender);
            worker.handle
        });

        match tokio::time::timeout(self.config.shutdown_grace, join_all(handles)).await {
            Ok(results) => {
                for result in results {
                    if let Err(e) = result {
                        warn!("partition worker panicked during shutdown: {}", e);
                    }
                }
                info!("stopped partition workers for {:?}", partitions);
            }
            Err(_) => warn!(
                "partition workers for {:?} did not drain within {:?}",
                partitions, self.config.shutdown_grace
            ),
        }
    }

    fn spawn(&self, partition: Partition) -> PartitionWorker {
        let (sender, receiver) = mpsc::channel(self.config.channel_capacity);
        let processor = self.factory.create(&partition);
        let liveness = self.liveness.register(
            format!("partition-{}-{}", partition.topic(), partition.partition_number()),
            self.config.liveness_deadline,
        );
        let idle_interval = idle_interval(self.config.liveness_deadline);

        let handle = tokio::spawn(run_worker(
            partition,
            processor,
            receiver,
            self.committer.clone(),
            liveness,
            idle_interval,
            self.failures_tx.clone(),
        ));

        PartitionWorker { sender, handle }
    }
}

/// Floor for how often an idle worker wakes up to report itself healthy.
const MIN_IDLE_INTERVAL: Duration = Duration::from_millis(100);

fn idle_interval(liveness_deadline: time::Duration) -> Duration {
    (liveness_deadline.unsigned_abs() / 2).max(MIN_IDLE_INTERVAL)
}

async fn run_worker<P: PartitionProcessor, C: OffsetCommitter>(
    partition: Partition,
    mut processor: P,
    mut receiver: mpsc::Receiver<SourceMessage>,
    committer: Arc<C>,
    liveness: HealthHandle,
    idle_interval: Duration,
    failures: mpsc::UnboundedSender<ConsumerError>,
) {
    info!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        "starting partition worker"
    );
    liveness.report_healthy();
    let mut last_handled: Option<i64> = None;

    loop {
        let message = match tokio::time::timeout(idle_interval, receiver.recv()).await {
            // An idle partition is a healthy one
            Err(_) => {
                liveness.report_healthy();
                continue;
            }
            Ok(None) => break,
            Ok(Some(message)) => message,
        };

        match processor.process(&message).await {
            Ok(()) => {
                commit_or_warn(&*committer, &partition, message.offset + 1, CommitMode::Async);
                last_handled = Some(message.offset);
                liveness.report_healthy();
            }
            Err(e) => {
                error!(
                    topic = partition.topic(),
                    partition = partition.partition_number(),
                    offset = message.offset,
                    "unrecoverable error, stopping partition worker: {}",
                    e
                );
                liveness.report_status(ComponentStatus::Unhealthy);
                receiver.close();
                drop(failures.send(ConsumerError::WorkerFailed {
                    partition,
                    reason: e.to_string(),
                }));
                return;
            }
        }
    }

    if let Some(offset) = last_handled {
        commit_or_warn(&*committer, &partition, offset + 1, CommitMode::Sync);
    }
    debug!(
        topic = partition.topic(),
        partition = partition.partition_number(),
        last_handled,
        "partition worker drained"
    );
    liveness.deregister();
}

/// Poll the source topic and dispatch messages to partition workers until `shutdown`
/// resolves or a worker fails. Workers are drained before returning.
pub async fn consume<F: ProcessorFactory>(
    consumer: Arc<StreamConsumer<PipelineConsumerContext>>,
    mut workers: PartitionWorkers<F, StreamConsumer<PipelineConsumerContext>>,
    mut revoked: mpsc::UnboundedReceiver<Vec<Partition>>,
    liveness: HealthHandle,
    shutdown: impl Future<Output = ()>,
) -> Result<(), ConsumerError> {
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, draining partition workers");
                break Ok(());
            }

            Some(failure) = workers.next_failure() => break Err(failure),

            Some(partitions) = revoked.recv() => workers.revoke(&partitions).await,

            message = consumer.recv() => match message.map(|m| SourceMessage::from(&m)) {
                Ok(message) => {
                    liveness.report_healthy();
                    metrics::counter!(MESSAGES_CONSUMED).increment(1);
                    if let Err(e) = workers.dispatch(message).await {
                        break Err(e);
                    }
                }
                Err(e) => warn!("error while consuming from kafka: {}", e),
            },
        }
    };

    workers.shutdown().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{source_message, RecordingCommitter};
    use std::sync::Mutex;

    #[derive(Debug, Error)]
    #[error("poisoned offset {0}")]
    struct Poisoned(i64);

    struct Recorder {
        seen: Arc<Mutex<Vec<(i32, i64)>>>,
        poison: Option<i64>,
    }

    #[async_trait]
    impl PartitionProcessor for Recorder {
        type Error = Poisoned;

        async fn process(&mut self, message: &SourceMessage) -> Result<(), Poisoned> {
            if self.poison == Some(message.offset) {
                return Err(Poisoned(message.offset));
            }
            self.seen
                .lock()
                .unwrap()
                .push((message.partition, message.offset));
            Ok(())
        }
    }

    struct RecorderFactory {
        seen: Arc<Mutex<Vec<(i32, i64)>>>,
        poison: Option<i64>,
    }

    impl ProcessorFactory for RecorderFactory {
        type Processor = Recorder;

        fn create(&self, _: &Partition) -> Recorder {
            Recorder {
                seen: self.seen.clone(),
                poison: self.poison,
            }
        }
    }

    fn workers(
        poison: Option<i64>,
    ) -> (
        PartitionWorkers<RecorderFactory, RecordingCommitter>,
        Arc<Mutex<Vec<(i32, i64)>>>,
        Arc<RecordingCommitter>,
        HealthRegistry,
    ) {
        let seen = Arc::new(Mutex::new(vec![]));
        let committer = Arc::new(RecordingCommitter::default());
        let registry = HealthRegistry::new("liveness");
        let workers = PartitionWorkers::new(
            RecorderFactory {
                seen: seen.clone(),
                poison,
            },
            committer.clone(),
            registry.clone(),
            WorkerConfig {
                channel_capacity: 4,
                ..Default::default()
            },
        );
        (workers, seen, committer, registry)
    }

    #[tokio::test]
    async fn preserves_order_within_a_partition_and_commits_next_offset() {
        let (mut workers, seen, committer, _) = workers(None);

        for (partition, offset) in [(0, 10), (1, 3), (0, 11), (1, 4), (0, 12)] {
            workers
                .dispatch(source_message(partition, offset, b"{}"))
                .await
                .unwrap();
        }
        workers.shutdown().await;

        let seen = seen.lock().unwrap().clone();
        let partition_0: Vec<i64> = seen.iter().filter(|(p, _)| *p == 0).map(|(_, o)| *o).collect();
        let partition_1: Vec<i64> = seen.iter().filter(|(p, _)| *p == 1).map(|(_, o)| *o).collect();
        assert_eq!(partition_0, vec![10, 11, 12]);
        assert_eq!(partition_1, vec![3, 4]);

        assert_eq!(committer.last_committed(0), Some(13));
        assert_eq!(committer.last_committed(1), Some(5));
        // The drain ends with a synchronous commit per partition
        assert_eq!(committer.sync_commits(), 2);
    }

    #[tokio::test]
    async fn failing_processor_stops_without_committing() {
        let (mut workers, seen, committer, registry) = workers(Some(21));

        for offset in [20, 21] {
            workers
                .dispatch(source_message(0, offset, b"{}"))
                .await
                .unwrap();
        }

        match workers.next_failure().await {
            Some(ConsumerError::WorkerFailed { partition, reason }) => {
                assert_eq!(partition.partition_number(), 0);
                assert_eq!(reason, "poisoned offset 21");
            }
            other => panic!("expected a worker failure, got {other:?}"),
        }

        assert_eq!(seen.lock().unwrap().clone(), vec![(0, 20)]);
        assert_eq!(committer.last_committed(0), Some(21));
        assert!(!registry.get_status().healthy);

        // Later messages for the partition cannot be dispatched any more
        assert!(workers
            .dispatch(source_message(0, 22, b"{}"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn revoked_partitions_are_drained_and_deregistered() {
        let (mut workers, seen, committer, registry) = workers(None);

        workers.dispatch(source_message(0, 1, b"{}")).await.unwrap();
        workers.dispatch(source_message(1, 7, b"{}")).await.unwrap();
        workers
            .revoke(&[Partition::new("events.raw.v1", 1)])
            .await;

        assert_eq!(workers.partitions().count(), 1);
        assert!(seen.lock().unwrap().contains(&(1, 7)));
        assert_eq!(committer.last_committed(1), Some(8));
        assert!(!registry
            .get_status()
            .components
            .contains_key("partition-events.raw.v1-1"));

        workers.shutdown().await;
    }

    #[test]
    fn idle_interval_never_drops_to_zero() {
        assert_eq!(idle_interval(time::Duration::seconds(60)), Duration::from_secs(30));
        assert_eq!(idle_interval(time::Duration::ZERO), MIN_IDLE_INTERVAL);
        assert_eq!(idle_interval(time::Duration::milliseconds(-5)), MIN_IDLE_INTERVAL);
    }
}
