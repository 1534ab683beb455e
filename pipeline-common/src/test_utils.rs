//! In-memory stores, sinks and message builders for coordinator tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;
use rdkafka::consumer::CommitMode;
use rdkafka::error::{KafkaError, KafkaResult, RDKafkaErrorCode};
use serde_json::json;
use uuid::Uuid;

use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
use crate::kafka::{OffsetCommitter, Partition, SourceMessage};
use crate::reading::PersistedEvent;
use crate::rules::AnomalyRecord;
use crate::sink::{AnomalySink, QuarantineEnvelope, QuarantineSink, SinkError};
use crate::store::{AnomalyStore, EventStore, InsertOutcome, StoreError};

pub const SOURCE_TOPIC: &str = "events.raw.v1";

/// Build a source message on [`SOURCE_TOPIC`].
pub fn source_message(partition: i32, offset: i64, payload: &[u8]) -> SourceMessage {
    SourceMessage {
        topic: SOURCE_TOPIC.to_string(),
        partition,
        offset,
        key: None,
        payload: Some(payload.to_vec()),
    }
}

/// Serialized reading, timestamped now.
pub fn reading_payload(customer_id: &str, event_id: Uuid, heart_rate: i64) -> Vec<u8> {
    json!({
        "event_id": event_id,
        "customer_id": customer_id,
        "timestamp": Utc::now().to_rfc3339(),
        "heart_rate": heart_rate,
    })
    .to_string()
    .into_bytes()
}

/// A keyed source message carrying a reading.
pub fn reading_message(
    partition: i32,
    offset: i64,
    customer_id: &str,
    event_id: Uuid,
    heart_rate: i64,
) -> SourceMessage {
    let mut message = source_message(
        partition,
        offset,
        &reading_payload(customer_id, event_id, heart_rate),
    );
    message.key = Some(customer_id.as_bytes().to_vec());
    message
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    Transient,
    Permanent,
}

impl Fault {
    fn store_error(self, command: &'static str) -> StoreError {
        match self {
            Fault::Transient => StoreError::Transient {
                command,
                error: sqlx::Error::PoolTimedOut,
            },
            Fault::Permanent => StoreError::Permanent {
                command,
                error: sqlx::Error::Protocol("injected failure".to_string()),
            },
        }
    }

    fn sink_error(self) -> SinkError {
        match self {
            Fault::Transient => SinkError::Canceled,
            Fault::Permanent => SinkError::Produce(KafkaError::MessageProduction(
                RDKafkaErrorCode::MessageSizeTooLarge,
            )),
        }
    }
}

/// Injected failures: a queue consumed one call at a time, then an optional
/// failure applied to every remaining call.
#[derive(Default)]
struct Faults {
    next: VecDeque<Fault>,
    always: Option<Fault>,
}

impl Faults {
    fn take(&mut self) -> Option<Fault> {
        self.next.pop_front().or(self.always)
    }
}

#[derive(Default)]
struct StoreState {
    events: Vec<PersistedEvent>,
    checkpoints: HashMap<CheckpointKey, Checkpoint>,
    anomalies: Vec<AnomalyRecord>,
    faults: Faults,
    persist_calls: usize,
}

/// In-memory implementation of every store trait, enforcing the same
/// (customer_id, event_id) uniqueness and checkpoint monotonicity as PostgreSQL.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next calls, one per queued fault.
    pub fn fail_next(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().faults.next.extend(faults);
    }

    /// Fail every call from now on, or stop doing so.
    pub fn fail_always(&self, fault: Option<Fault>) {
        self.lock().faults.always = fault;
    }

    pub fn events(&self) -> Vec<PersistedEvent> {
        self.lock().events.clone()
    }

    pub fn anomalies(&self) -> Vec<AnomalyRecord> {
        self.lock().anomalies.clone()
    }

    pub fn persist_calls(&self) -> usize {
        self.lock().persist_calls
    }

    pub fn last_offset(&self, key: &CheckpointKey) -> Option<i64> {
        self.lock().checkpoints.get(key).map(|c| c.last_offset)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn advance(state: &mut StoreState, key: &CheckpointKey, offset: i64) {
    let checkpoint = state
        .checkpoints
        .entry(key.clone())
        .or_insert_with(|| Checkpoint {
            key: key.clone(),
            last_offset: offset,
            updated_at: Utc::now(),
        });
    checkpoint.last_offset = checkpoint.last_offset.max(offset);
    checkpoint.updated_at = Utc::now();
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn persist(
        &self,
        event: &PersistedEvent,
        checkpoint: &CheckpointKey,
    ) -> Result<InsertOutcome, StoreError> {
        let mut state = self.lock();
        state.persist_calls += 1;
        if let Some(fault) = state.faults.take() {
            return Err(fault.store_error("INSERT heartbeat_events"));
        }

        let duplicate = state.events.iter().any(|e| {
            e.reading.customer_id == event.reading.customer_id
                && e.reading.event_id == event.reading.event_id
        });
        if !duplicate {
            state.events.push(event.clone());
        }
        advance(&mut state, checkpoint, event.provenance.offset);

        Ok(match duplicate {
            true => InsertOutcome::Duplicate,
            false => InsertOutcome::Inserted,
        })
    }

    async fn latest_heart_rates(
        &self,
        topic: &str,
        partition: i32,
        before_offset: i64,
    ) -> Result<HashMap<String, i32>, StoreError> {
        let state = self.lock();
        let events: Vec<_> = state
            .events
            .iter()
            .filter(|e| {
                e.provenance.topic == topic
                    && e.provenance.partition == partition
                    && e.provenance.offset < before_offset
            })
            .collect();
        let persisted: HashSet<i64> = events.iter().map(|e| e.provenance.offset).collect();
        let mut contiguous_from = before_offset;
        while persisted.contains(&(contiguous_from - 1)) {
            contiguous_from -= 1;
        }

        let mut latest: HashMap<String, (i64, i32)> = HashMap::new();
        for event in events
            .into_iter()
            .filter(|e| e.provenance.offset >= contiguous_from)
        {
            let entry = latest
                .entry(event.reading.customer_id.clone())
                .or_insert((event.provenance.offset, event.reading.heart_rate));
            if event.provenance.offset >= entry.0 {
                *entry = (event.provenance.offset, event.reading.heart_rate);
            }
        }
        Ok(latest
            .into_iter()
            .map(|(customer, (_, rate))| (customer, rate))
            .collect())
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, StoreError> {
        Ok(self.lock().checkpoints.get(key).cloned())
    }

    async fn upsert(&self, key: &CheckpointKey, offset: i64) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(fault) = state.faults.take() {
            return Err(fault.store_error("UPSERT ingest_checkpoint"));
        }
        advance(&mut state, key, offset);
        Ok(())
    }
}

#[async_trait]
impl AnomalyStore for MemoryStore {
    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<(), StoreError> {
        let mut state = self.lock();
        if let Some(fault) = state.faults.take() {
            return Err(fault.store_error("INSERT anomalies"));
        }
        state.anomalies.push(anomaly.clone());
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    envelopes: Vec<(Option<Vec<u8>>, QuarantineEnvelope)>,
    anomalies: Vec<AnomalyRecord>,
    faults: Faults,
    attempts: usize,
}

/// Records everything written to it, one instance per topic.
#[derive(Default)]
pub struct MemorySink {
    state: Mutex<SinkState>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_next(&self, faults: impl IntoIterator<Item = Fault>) {
        self.lock().faults.next.extend(faults);
    }

    pub fn fail_always(&self, fault: Option<Fault>) {
        self.lock().faults.always = fault;
    }

    pub fn envelopes(&self) -> Vec<QuarantineEnvelope> {
        self.lock().envelopes.iter().map(|(_, e)| e.clone()).collect()
    }

    pub fn keys(&self) -> Vec<Option<Vec<u8>>> {
        self.lock().envelopes.iter().map(|(k, _)| k.clone()).collect()
    }

    pub fn anomalies(&self) -> Vec<AnomalyRecord> {
        self.lock().anomalies.clone()
    }

    /// Calls made, failed ones included.
    pub fn attempts(&self) -> usize {
        self.lock().attempts
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[async_trait]
impl QuarantineSink for MemorySink {
    async fn quarantine(
        &self,
        key: Option<&[u8]>,
        envelope: &QuarantineEnvelope,
    ) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.attempts += 1;
        if let Some(fault) = state.faults.take() {
            return Err(fault.sink_error());
        }
        state
            .envelopes
            .push((key.map(|k| k.to_vec()), envelope.clone()));
        Ok(())
    }
}

#[async_trait]
impl AnomalySink for MemorySink {
    async fn publish(&self, anomaly: &AnomalyRecord) -> Result<(), SinkError> {
        let mut state = self.lock();
        state.attempts += 1;
        if let Some(fault) = state.faults.take() {
            return Err(fault.sink_error());
        }
        state.anomalies.push(anomaly.clone());
        Ok(())
    }
}

/// Offset committer that records commits instead of talking to a broker.
#[derive(Default)]
pub struct RecordingCommitter {
    commits: Mutex<Vec<(Partition, i64, bool)>>,
}

impl RecordingCommitter {
    /// Highest next-offset committed for a partition of [`SOURCE_TOPIC`].
    pub fn last_committed(&self, partition: i32) -> Option<i64> {
        self.lock()
            .iter()
            .filter(|(p, _, _)| p.partition_number() == partition)
            .map(|(_, offset, _)| *offset)
            .max()
    }

    pub fn sync_commits(&self) -> usize {
        self.lock().iter().filter(|(_, _, sync)| *sync).count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Partition, i64, bool)>> {
        match self.commits.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl OffsetCommitter for RecordingCommitter {
    fn commit(&self, partition: &Partition, next_offset: i64, mode: CommitMode) -> KafkaResult<()> {
        self.lock()
            .push((partition.clone(), next_offset, matches!(mode, CommitMode::Sync)));
        Ok(())
    }
}
