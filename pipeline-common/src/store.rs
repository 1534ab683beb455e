use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::Row;
use thiserror::Error;

use crate::checkpoint::{Checkpoint, CheckpointKey, CheckpointStore};
use crate::reading::PersistedEvent;
use crate::rules::AnomalyRecord;

/// Errors from the relational store, classified for the retry policy.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("connection failed with: {0}")]
    Connection(sqlx::Error),
    #[error("{command} failed with a transient error: {error}")]
    Transient {
        command: &'static str,
        error: sqlx::Error,
    },
    #[error("{command} failed: {error}")]
    Permanent {
        command: &'static str,
        error: sqlx::Error,
    },
}

impl StoreError {
    pub fn query(command: &'static str, error: sqlx::Error) -> Self {
        if is_transient_error(&error) {
            StoreError::Transient { command, error }
        } else {
            StoreError::Permanent { command, error }
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient { .. })
    }
}

/// Whether a sqlx error may succeed if the same statement is retried.
pub fn is_transient_error(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => true,
        sqlx::Error::Database(db_error) => match db_error.code() {
            // 08 connection exception, 53 insufficient resources, 57 operator intervention,
            // 40 transaction rollback (serialization failures, deadlocks)
            Some(code) => ["08", "40", "53", "57"]
                .iter()
                .any(|class| code.starts_with(class)),
            None => false,
        },
        _ => false,
    }
}

/// Result of an idempotent insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A row for the same (customer_id, event_id) already exists. Not an error.
    Duplicate,
}

#[async_trait]
pub trait EventStore: Send + Sync {
    /// Insert the event unless it already exists and advance the checkpoint, as one unit.
    async fn persist(
        &self,
        event: &PersistedEvent,
        checkpoint: &CheckpointKey,
    ) -> Result<InsertOutcome, StoreError>;

    /// Latest persisted heart rate per customer read from `topic`/`partition` strictly
    /// before `before_offset`.
    ///
    /// Only the unbroken run of persisted offsets ending at `before_offset - 1` is
    /// considered. A missing offset may have been a reading for any customer that was
    /// never persisted, so nothing at or below a gap can be trusted as the previous
    /// reading.
    async fn latest_heart_rates(
        &self,
        topic: &str,
        partition: i32,
        before_offset: i64,
    ) -> Result<HashMap<String, i32>, StoreError>;
}

#[async_trait]
pub trait AnomalyStore: Send + Sync {
    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<(), StoreError>;
}

/// PostgreSQL backed implementation of every store trait.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Build a pool that connects on first use, so a database outage at startup
    /// surfaces through the retry policy rather than a crash loop.
    pub fn connect_lazy(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_lazy(url)
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

const UPSERT_CHECKPOINT: &str = r#"
INSERT INTO ingest_checkpoint (consumer_group, topic, partition, last_offset, updated_at)
VALUES ($1, $2, $3, $4, NOW())
ON CONFLICT (consumer_group, topic, partition)
DO UPDATE SET
    last_offset = GREATEST(ingest_checkpoint.last_offset, EXCLUDED.last_offset),
    updated_at = NOW()
"#;

#[async_trait]
impl EventStore for PgStore {
    async fn persist(
        &self,
        event: &PersistedEvent,
        checkpoint: &CheckpointKey,
    ) -> Result<InsertOutcome, StoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| StoreError::query("BEGIN", e))?;

        let reading = &event.reading;
        let inserted = sqlx::query(
            r#"
INSERT INTO heartbeat_events (
    event_id, customer_id, event_time, heart_rate,
    quality_flag, source_topic, source_partition, source_offset, payload
)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
ON CONFLICT (customer_id, event_id) DO NOTHING
            "#,
        )
        .bind(reading.event_id)
        .bind(&reading.customer_id)
        .bind(reading.event_time)
        .bind(reading.heart_rate)
        .bind(event.quality_flag.as_str())
        .bind(&event.provenance.topic)
        .bind(event.provenance.partition)
        .bind(event.provenance.offset)
        .bind(sqlx::types::Json(event.payload()))
        .execute(&mut *tx)
        .await
        .map_err(|e| StoreError::query("INSERT heartbeat_events", e))?
        .rows_affected();

        sqlx::query(UPSERT_CHECKPOINT)
            .bind(&checkpoint.consumer_group)
            .bind(&checkpoint.topic)
            .bind(checkpoint.partition)
            .bind(event.provenance.offset)
            .execute(&mut *tx)
            .await
            .map_err(|e| StoreError::query("UPSERT ingest_checkpoint", e))?;

        tx.commit()
            .await
            .map_err(|e| StoreError::query("COMMIT", e))?;

        Ok(match inserted {
            0 => InsertOutcome::Duplicate,
            _ => InsertOutcome::Inserted,
        })
    }

    async fn latest_heart_rates(
        &self,
        topic: &str,
        partition: i32,
        before_offset: i64,
    ) -> Result<HashMap<String, i32>, StoreError> {
        let rows = sqlx::query(
            r#"
WITH recent AS (
    SELECT customer_id, heart_rate, source_offset,
           $3 - ROW_NUMBER() OVER (ORDER BY source_offset DESC) AS expected_offset
    FROM heartbeat_events
    WHERE source_topic = $1 AND source_partition = $2 AND source_offset < $3
)
SELECT DISTINCT ON (customer_id) customer_id, heart_rate
FROM recent
WHERE source_offset = expected_offset
ORDER BY customer_id, source_offset DESC
            "#,
        )
        .bind(topic)
        .bind(partition)
        .bind(before_offset)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::query("SELECT heartbeat_events", e))?;

        rows.iter()
            .map(|row| {
                let customer_id: String = row.try_get("customer_id")?;
                let heart_rate: i32 = row.try_get("heart_rate")?;
                Ok((customer_id, heart_rate))
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(|e| StoreError::query("SELECT heartbeat_events", e))
    }
}

#[async_trait]
impl CheckpointStore for PgStore {
    async fn load(&self, key: &CheckpointKey) -> Result<Option<Checkpoint>, StoreError> {
        let row = sqlx::query(
            r#"
SELECT last_offset, updated_at
FROM ingest_checkpoint
WHERE consumer_group = $1 AND topic = $2 AND partition = $3
            "#,
        )
        .bind(&key.consumer_group)
        .bind(&key.topic)
        .bind(key.partition)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::query("SELECT ingest_checkpoint", e))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let last_offset: i64 = row
            .try_get("last_offset")
            .map_err(|e| StoreError::query("SELECT ingest_checkpoint", e))?;
        let updated_at: DateTime<Utc> = row
            .try_get("updated_at")
            .map_err(|e| StoreError::query("SELECT ingest_checkpoint", e))?;

        Ok(Some(Checkpoint {
            key: key.clone(),
            last_offset,
            updated_at,
        }))
    }

    async fn upsert(&self, key: &CheckpointKey, offset: i64) -> Result<(), StoreError> {
        sqlx::query(UPSERT_CHECKPOINT)
            .bind(&key.consumer_group)
            .bind(&key.topic)
            .bind(key.partition)
            .bind(offset)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::query("UPSERT ingest_checkpoint", e))?;
        Ok(())
    }
}

#[async_trait]
impl AnomalyStore for PgStore {
    async fn insert_anomaly(&self, anomaly: &AnomalyRecord) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO anomalies (
    event_id, customer_id, event_time, heart_rate, anomaly_type, severity, details
)
VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(anomaly.event_id)
        .bind(&anomaly.customer_id)
        .bind(anomaly.event_time)
        .bind(anomaly.heart_rate)
        .bind(anomaly.anomaly_type.as_str())
        .bind(anomaly.severity.as_str())
        .bind(sqlx::types::Json(anomaly.details))
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::query("INSERT anomalies", e))?;
        Ok(())
    }
}
