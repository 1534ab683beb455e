use std::sync::Arc;
use std::time::Duration;

use anomaly_detector::detector::{
    Detection, DetectionContext, DetectionProcessor, DetectionProcessorFactory,
};
use health::HealthRegistry;
use metrics_exporter_prometheus::PrometheusBuilder;
use pipeline_common::checkpoint::CheckpointKey;
use pipeline_common::consumer::{PartitionWorkers, WorkerConfig};
use pipeline_common::kafka::Partition;
use pipeline_common::reading::{PersistedEvent, Provenance};
use pipeline_common::retry::RetryPolicy;
use pipeline_common::rules::{AnomalyDetails, AnomalyRules, AnomalyType, Severity, Thresholds};
use pipeline_common::store::EventStore;
use pipeline_common::test_utils::{
    reading_message, reading_payload, source_message, Fault, MemorySink, MemoryStore,
    RecordingCommitter, SOURCE_TOPIC,
};
use pipeline_common::validation::decode;
use uuid::Uuid;

const MAX_ATTEMPTS: u32 = 3;

struct Harness {
    store: Arc<MemoryStore>,
    sink: Arc<MemorySink>,
}

impl Harness {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::new()),
            sink: Arc::new(MemorySink::new()),
        }
    }

    fn context(&self, warm_start: bool) -> DetectionContext<MemoryStore, MemorySink> {
        DetectionContext {
            store: self.store.clone(),
            sink: self.sink.clone(),
            rules: AnomalyRules::new(Thresholds {
                low: 50,
                high: 140,
                spike_delta: 30,
            }),
            retry_policy: RetryPolicy::new(MAX_ATTEMPTS, 2, Duration::from_millis(1), None),
            warm_start,
        }
    }

    fn processor(&self, warm_start: bool) -> DetectionProcessor<MemoryStore, MemorySink> {
        DetectionProcessor::new(
            Arc::new(self.context(warm_start)),
            Partition::new(SOURCE_TOPIC, 0),
        )
    }

    /// Write a reading to the event store as the ingestion worker would have.
    async fn ingested(&self, offset: i64, customer_id: &str, heart_rate: i64) {
        let payload = reading_payload(customer_id, Uuid::now_v7(), heart_rate);
        let reading = decode(Some(payload.as_slice())).unwrap();
        let event = PersistedEvent::valid(
            reading,
            Provenance {
                topic: SOURCE_TOPIC.to_string(),
                partition: 0,
                offset,
            },
        );
        self.store
            .persist(&event, &CheckpointKey::new("cg.db-writer.v1", SOURCE_TOPIC, 0))
            .await
            .unwrap();
    }
}

fn anomaly_type(detection: &Detection) -> Option<AnomalyType> {
    match detection {
        Detection::Anomaly(anomaly) => Some(anomaly.anomaly_type),
        _ => None,
    }
}

#[tokio::test]
async fn spike_then_low_for_one_customer() {
    let harness = Harness::new();
    let mut processor = harness.processor(false);

    let mut detections = vec![];
    for (offset, rate) in [70, 120, 40].into_iter().enumerate() {
        let message = reading_message(0, offset as i64, "cust_00001", Uuid::now_v7(), rate);
        detections.push(processor.handle(&message).await);
    }

    assert_eq!(detections[0], Detection::Normal);
    assert_eq!(anomaly_type(&detections[1]), Some(AnomalyType::Spike));
    assert_eq!(anomaly_type(&detections[2]), Some(AnomalyType::LowHeartRate));

    let stored = harness.store.anomalies();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].severity, Severity::Medium);
    assert_eq!(
        stored[0].details,
        AnomalyDetails::Spike {
            delta: 50,
            threshold: 30,
            previous: 70,
            measured: 120
        }
    );
    assert_eq!(stored[1].severity, Severity::High);
    assert_eq!(harness.sink.anomalies(), stored);
    assert_eq!(processor.state().get("cust_00001"), Some(40));
}

#[tokio::test]
async fn state_is_kept_per_customer() {
    let harness = Harness::new();
    let mut processor = harness.processor(false);

    // Interleaved readings: each customer is compared with its own previous reading
    let readings = [
        ("cust_00001", 70),
        ("cust_00002", 110),
        ("cust_00001", 75),
        ("cust_00002", 105),
    ];
    for (offset, (customer, rate)) in readings.into_iter().enumerate() {
        let message = reading_message(0, offset as i64, customer, Uuid::now_v7(), rate);
        assert_eq!(processor.handle(&message).await, Detection::Normal);
    }

    assert!(harness.store.anomalies().is_empty());
    assert_eq!(processor.state().len(), 2);
    assert_eq!(processor.state().get("cust_00002"), Some(105));
}

#[tokio::test]
async fn readings_outside_the_ingestion_bounds_are_still_evaluated() {
    let harness = Harness::new();
    let mut processor = harness.processor(false);

    let message = reading_message(0, 0, "cust_00001", Uuid::now_v7(), 30);
    assert_eq!(
        anomaly_type(&processor.handle(&message).await),
        Some(AnomalyType::LowHeartRate)
    );
}

#[tokio::test]
async fn malformed_messages_are_skipped_without_touching_state() {
    let harness = Harness::new();
    let mut processor = harness.processor(false);

    let first = reading_message(0, 0, "cust_00001", Uuid::now_v7(), 70);
    processor.handle(&first).await;
    assert_eq!(
        processor.handle(&source_message(0, 1, b"{not json")).await,
        Detection::Malformed
    );
    let out_of_range = reading_message(0, 2, "cust_00001", Uuid::now_v7(), 300);
    assert_eq!(processor.handle(&out_of_range).await, Detection::Malformed);

    assert_eq!(processor.state().get("cust_00001"), Some(70));
}

#[test]
fn malformed_messages_are_counted_as_detector_skips() {
    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let harness = Harness::new();
    let mut processor = harness.processor(false);

    let detection = metrics::with_local_recorder(&recorder, || {
        runtime.block_on(processor.handle(&source_message(0, 0, b"{not json")))
    });
    assert_eq!(detection, Detection::Malformed);

    let rendered = handle.render();
    assert!(rendered.contains(r#"heartbeat_detector_skipped_total{reason="schema"} 1"#));
    assert!(!rendered.contains("heartbeat_invalid_total"));
}

#[tokio::test]
async fn failed_persistence_does_not_block_publication_or_state() {
    let harness = Harness::new();
    let mut processor = harness.processor(false);
    harness.store.fail_always(Some(Fault::Transient));

    let message = reading_message(0, 0, "cust_00001", Uuid::now_v7(), 150);
    assert_eq!(
        anomaly_type(&processor.handle(&message).await),
        Some(AnomalyType::HighHeartRate)
    );

    assert!(harness.store.anomalies().is_empty());
    assert_eq!(harness.sink.anomalies().len(), 1);
    assert_eq!(processor.state().get("cust_00001"), Some(150));
}

#[tokio::test]
async fn failed_publication_is_dropped_and_the_stream_keeps_moving() {
    let harness = Harness::new();
    let mut processor = harness.processor(false);
    harness.sink.fail_always(Some(Fault::Transient));

    let first = reading_message(0, 0, "cust_00001", Uuid::now_v7(), 150);
    processor.handle(&first).await;
    assert_eq!(harness.sink.attempts(), MAX_ATTEMPTS as usize);
    assert!(harness.sink.anomalies().is_empty());
    assert_eq!(harness.store.anomalies().len(), 1);

    harness.sink.fail_always(None);
    let next = reading_message(0, 1, "cust_00001", Uuid::now_v7(), 100);
    assert_eq!(
        anomaly_type(&processor.handle(&next).await),
        Some(AnomalyType::Spike)
    );
    assert_eq!(harness.sink.anomalies().len(), 1);
}

#[tokio::test]
async fn oversized_notifications_are_not_retried() {
    let harness = Harness::new();
    let mut processor = harness.processor(false);
    harness.sink.fail_next([Fault::Permanent]);

    let message = reading_message(0, 0, "cust_00001", Uuid::now_v7(), 30);
    processor.handle(&message).await;
    assert_eq!(harness.sink.attempts(), 1);
}

#[tokio::test]
async fn cold_start_never_spikes_on_the_first_reading() {
    let harness = Harness::new();
    harness.ingested(0, "cust_00001", 70).await;

    let mut processor = harness.processor(false);
    let message = reading_message(0, 1, "cust_00001", Uuid::now_v7(), 120);
    assert_eq!(processor.handle(&message).await, Detection::Normal);
}

#[tokio::test]
async fn warm_start_seeds_state_from_earlier_offsets_only() {
    let harness = Harness::new();
    harness.ingested(0, "cust_00001", 60).await;
    harness.ingested(1, "cust_00001", 70).await;
    harness.ingested(2, "cust_00002", 80).await;
    harness.ingested(3, "cust_00002", 85).await;
    // Not yet delivered to the detector, must not be used as prior state
    harness.ingested(4, "cust_00001", 118).await;

    let mut processor = harness.processor(true);
    let message = reading_message(0, 4, "cust_00001", Uuid::now_v7(), 118);
    match processor.handle(&message).await {
        Detection::Anomaly(anomaly) => assert_eq!(
            anomaly.details,
            AnomalyDetails::Spike {
                delta: 48,
                threshold: 30,
                previous: 70,
                measured: 118
            }
        ),
        other => panic!("expected a spike, got {other:?}"),
    }
    assert_eq!(processor.state().get("cust_00002"), Some(85));
}

#[tokio::test]
async fn warm_start_ignores_readings_before_an_unpersisted_offset() {
    let harness = Harness::new();
    harness.ingested(0, "cust_00001", 100).await;
    // Offset 1 carried 44 for cust_00001, outside the ingestion bounds and never persisted
    harness.ingested(2, "cust_00002", 80).await;

    let mut processor = harness.processor(true);
    let message = reading_message(0, 3, "cust_00001", Uuid::now_v7(), 60);
    assert_eq!(processor.handle(&message).await, Detection::Normal);

    assert!(harness.store.anomalies().is_empty());
    assert_eq!(processor.state().get("cust_00001"), Some(60));
    assert_eq!(processor.state().get("cust_00002"), Some(80));
}

#[tokio::test]
async fn restarted_detector_matches_one_that_never_stopped() {
    let harness = Harness::new();
    harness.ingested(0, "cust_00001", 100).await;

    let mut running = harness.processor(false);
    running
        .handle(&reading_message(0, 0, "cust_00001", Uuid::now_v7(), 100))
        .await;
    assert_eq!(
        anomaly_type(
            &running
                .handle(&reading_message(0, 1, "cust_00001", Uuid::now_v7(), 44))
                .await
        ),
        Some(AnomalyType::LowHeartRate)
    );
    let next = reading_message(0, 2, "cust_00001", Uuid::now_v7(), 60);
    assert_eq!(running.handle(&next).await, Detection::Normal);

    let mut restarted = harness.processor(true);
    assert_eq!(restarted.handle(&next).await, Detection::Normal);
}

#[tokio::test]
async fn partition_workers_commit_every_message() {
    let harness = Harness::new();
    let committer = Arc::new(RecordingCommitter::default());
    let mut workers = PartitionWorkers::new(
        DetectionProcessorFactory::new(harness.context(false)),
        committer.clone(),
        HealthRegistry::new("liveness"),
        WorkerConfig::default(),
    );
    harness.sink.fail_always(Some(Fault::Permanent));

    workers
        .dispatch(reading_message(0, 0, "cust_00001", Uuid::now_v7(), 70))
        .await
        .unwrap();
    workers
        .dispatch(source_message(0, 1, b"garbage"))
        .await
        .unwrap();
    workers
        .dispatch(reading_message(0, 2, "cust_00001", Uuid::now_v7(), 190))
        .await
        .unwrap();
    workers
        .dispatch(reading_message(1, 0, "cust_00002", Uuid::now_v7(), 80))
        .await
        .unwrap();
    workers.shutdown().await;

    assert_eq!(committer.last_committed(0), Some(3));
    assert_eq!(committer.last_committed(1), Some(1));
    assert_eq!(harness.store.anomalies().len(), 1);
    assert!(harness.sink.anomalies().is_empty());
}
